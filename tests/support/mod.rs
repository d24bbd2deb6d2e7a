#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;

use hoard::body::{self, ProxyBody};
use hoard::config::Bootstrap;
use hoard::Server;

#[derive(Clone, Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cache_status(&self) -> &str {
        self.header("X-Cache").unwrap_or("-")
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }

    /// Sends one request on a fresh connection and returns the response head with a live body.
    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response<Incoming> {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder().method(method).uri(path);
        if !headers.contains_key(http::header::HOST) {
            builder = builder.header(http::header::HOST, self.proxy_addr.to_string());
        }
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(body)).expect("request");
        sender.send_request(req).await.expect("send request")
    }

    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap) -> TestResponse {
        self.send_body(method, path, headers, Bytes::new()).await
    }

    pub async fn send_body(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> TestResponse {
        let resp = self.fetch(method, path, headers, body).await;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Method::GET, path, HeaderMap::new()).await
    }
}

/// What the origin saw for one request.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Handler = Arc<dyn Fn(RecordedRequest) -> BoxFuture<'static, Response<ProxyBody>> + Send + Sync>;

/// Origin double. Every request is counted and recorded before the handler runs.
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(RecordedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler: Handler = Arc::new(move |req| handler(req).boxed());
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let conn_hits = Arc::clone(&hits);
        let conn_requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let hits = Arc::clone(&conn_hits);
                        let requests = Arc::clone(&conn_requests);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let handler = Arc::clone(&handler);
                                let hits = Arc::clone(&hits);
                                let requests = Arc::clone(&requests);
                                async move {
                                    let (parts, incoming) = req.into_parts();
                                    let body = incoming
                                        .collect()
                                        .await
                                        .map(|b| b.to_bytes())
                                        .unwrap_or_default();
                                    let recorded = RecordedRequest {
                                        method: parts.method,
                                        uri: parts.uri.to_string(),
                                        headers: parts.headers,
                                        body,
                                    };
                                    hits.fetch_add(1, Ordering::SeqCst);
                                    requests.lock().unwrap().push(recorded.clone());
                                    Ok::<_, hyper::Error>(handler(recorded).await)
                                }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            requests,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A proxy under test, listening on an ephemeral port with its own cache root.
pub struct Harness {
    pub server: Server,
    pub addr: SocketAddr,
    pub client: TestClient,
    pub cache: tempfile::TempDir,
}

impl Harness {
    pub async fn start(backend: &str) -> Self {
        Self::start_with(backend, |_| {}).await
    }

    pub async fn start_with<F>(backend: &str, edit: F) -> Self
    where
        F: FnOnce(&mut Bootstrap),
    {
        let cache = tempfile::tempdir().expect("cache dir");
        let mut cfg = Bootstrap::default();
        cfg.server.host = "127.0.0.1".to_string();
        cfg.server.port = 0;
        cfg.upstream.backend = backend.to_string();
        cfg.cache.dir = cache.path().to_path_buf();
        edit(&mut cfg);

        let server = Server::new(cfg).expect("build server");
        let addr = server.listen().await.expect("listen");
        Self {
            server,
            addr,
            client: TestClient::new(addr),
            cache,
        }
    }

    pub fn store_path(&self, rel: &str) -> PathBuf {
        self.cache.path().join(rel.trim_start_matches('/'))
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.server.idle())
            .await
            .expect("fills settled");
    }

    /// Every file left under the cache root, relative to it.
    pub fn stored_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![self.cache.path().to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).expect("read cache dir") {
                let path = entry.expect("dir entry").path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(self.cache.path()).expect("under root");
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        out
    }
}

pub fn gen_bytes(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn build_response(status: StatusCode, headers: &[(&str, &str)], body: ProxyBody) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    for (k, v) in headers {
        resp.headers_mut().append(
            http::header::HeaderName::from_bytes(k.as_bytes()).expect("header name"),
            v.parse().expect("header value"),
        );
    }
    resp
}

/// Origin that answers every request with `data`.
pub async fn serve_bytes(data: Bytes, content_type: &'static str) -> MockServer {
    MockServer::start(move |_req| {
        let data = data.clone();
        async move {
            build_response(
                StatusCode::OK,
                &[("Content-Type", content_type), ("Server", "mock-origin/1.0")],
                body::full(data),
            )
        }
    })
    .await
}

/// Body sent in `chunks` pieces with `pause` between them.
pub fn slow_body(data: Bytes, chunks: usize, pause: Duration) -> ProxyBody {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let step = data.len().div_ceil(chunks.max(1)).max(1);
    tokio::spawn(async move {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + step).min(data.len());
            if tx.send(Ok(data.slice(offset..end))).await.is_err() {
                return;
            }
            offset = end;
            tokio::time::sleep(pause).await;
        }
    });
    body::channel(rx)
}
