use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use http::header::{CONTENT_LENGTH, HOST, USER_AGENT};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::access_log::{self, AccessEntry, AccessLogger};
use crate::body::{self, ProxyBody};
use crate::config::Bootstrap;
use crate::constants::{self, CacheStatus};
use crate::event::{LifecycleState, ServerEvents};
use crate::metrics::Metrics;
use crate::policy::CachePolicy;
use crate::proxy::singleflight::Group;
use crate::proxy::Coordinator;
use crate::responder;
use crate::storage::{Lookup, Store};
use crate::upstream::UpstreamClient;

/// How long shutdown waits for running fills before giving up on them.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Binary entry point: listen until SIGINT/SIGTERM, then close.
pub async fn run(cfg: Bootstrap) -> Result<()> {
    let server = Server::new(cfg)?;
    server.on_start(|addr| log::info!("hoard listening on {addr}"));
    server.on_stop(|| log::info!("hoard stopped"));
    server.listen().await?;

    wait_for_signal().await;
    server.close().await?;
    if !server.is_idle() {
        log::info!("waiting for {} fills to finish", server.in_flight());
        if tokio::time::timeout(SHUTDOWN_DRAIN, server.idle()).await.is_err() {
            log::warn!("{} fills still running at exit", server.in_flight());
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => {
                        let _ = sig.recv().await;
                    }
                    None => futures::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

struct AppState {
    cfg: Arc<Bootstrap>,
    policy: CachePolicy,
    store: Store,
    upstream: UpstreamClient,
    coordinator: Coordinator,
    metrics: Metrics,
    access_logger: Option<Arc<AccessLogger>>,
    events: ServerEvents,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_loop: JoinHandle<Result<()>>,
}

/// A caching proxy instance. Owns its fill registry, observers and metrics; several may run in
/// one process.
pub struct Server {
    state: Arc<AppState>,
    lifecycle: Mutex<LifecycleState>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Validates `cfg` and builds every component. Configuration problems surface here.
    pub fn new(cfg: Bootstrap) -> Result<Self> {
        cfg.validate()?;
        let policy = CachePolicy::from_config(&cfg.cache)?;
        let store = Store::new(&cfg.cache.dir);
        let upstream = UpstreamClient::new(&cfg.upstream, &cfg.cache)?;
        let metrics = Metrics::new().context("register metrics")?;
        let coordinator = Coordinator::new(
            store.clone(),
            Group::new(),
            upstream.clone(),
            metrics.clone(),
            cfg.upstream.body_idle_timeout,
        );
        let access_logger = build_access_logger(&cfg)?;

        Ok(Self {
            state: Arc::new(AppState {
                cfg: Arc::new(cfg),
                policy,
                store,
                upstream,
                coordinator,
                metrics,
                access_logger,
                events: ServerEvents::default(),
            }),
            lifecycle: Mutex::new(LifecycleState::Stopped),
            running: Mutex::new(None),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, LifecycleState> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.addr)
    }

    pub fn store(&self) -> &Store {
        &self.state.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.state.metrics
    }

    pub fn on_start<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.state.events.start.subscribe(move |addr| handler(*addr));
    }

    pub fn on_stop<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.events.stop.subscribe(move |_| handler());
    }

    /// Runs `callback` once no fill is in flight: immediately if already idle.
    pub fn on_idle<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.coordinator.group().on_idle(callback);
    }

    pub async fn idle(&self) {
        self.state.coordinator.group().idle().await;
    }

    pub fn is_idle(&self) -> bool {
        self.state.coordinator.group().is_idle()
    }

    pub fn in_flight(&self) -> usize {
        self.state.coordinator.group().in_flight()
    }

    /// Binds the configured address and starts accepting. Port 0 picks a free port; the bound
    /// address is returned and passed to `on_start` observers.
    pub async fn listen(&self) -> Result<SocketAddr> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != LifecycleState::Stopped {
                return Err(anyhow!("server is {}", lifecycle.as_str()));
            }
            *lifecycle = LifecycleState::Starting;
        }

        let bind_addr = self.state.cfg.server.addr();
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                *self.lifecycle() = LifecycleState::Stopped;
                return Err(err).with_context(|| format!("bind {bind_addr}"));
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                *self.lifecycle() = LifecycleState::Stopped;
                return Err(err).context("listener address");
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_loop = tokio::spawn(run_tcp(listener, shutdown_rx, Arc::clone(&self.state)));
        *self.running() = Some(Running {
            addr,
            shutdown: shutdown_tx,
            accept_loop,
        });
        *self.lifecycle() = LifecycleState::Listening;
        log::debug!(
            "proxying {} with cache at {}",
            self.state.cfg.upstream.backend,
            self.state.store.root().display()
        );
        self.state.events.start.emit(&addr);
        Ok(addr)
    }

    /// Stops accepting connections. Connections and fills already running are left to finish.
    pub async fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != LifecycleState::Listening {
                return Ok(());
            }
            *lifecycle = LifecycleState::Stopping;
        }
        let running = self.running().take();
        let mut result = Ok(());
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            result = match running.accept_loop.await {
                Ok(res) => res,
                Err(err) => Err(anyhow!("accept loop panicked: {err}")),
            };
        }
        *self.lifecycle() = LifecycleState::Stopped;
        self.state.events.stop.emit(&());
        result
    }
}

fn build_access_logger(cfg: &Bootstrap) -> Result<Option<Arc<AccessLogger>>> {
    match &cfg.server.access_log {
        Some(access_log) if access_log.enabled => {
            Ok(Some(Arc::new(AccessLogger::new(&access_log.path)?)))
        }
        _ => Ok(None),
    }
}

async fn run_tcp(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        // transient (EMFILE, ECONNABORTED); keep accepting
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state), peer));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection from {peer} closed: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let start_at = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let version = req.version();
    let client_ip = access_log::client_ip(&peer.ip().to_string(), req.headers());
    let host = header_str(req.headers(), HOST.as_str());
    let host = host.split(':').next().unwrap_or_default().to_string();
    let user_agent = header_str(req.headers(), USER_AGENT.as_str());

    let (mut resp, cache_status) = match AssertUnwindSafe(dispatch(req, &state)).catch_unwind().await {
        Ok(res) => res,
        Err(_) => {
            log::error!("panic while handling {method} {uri}");
            (
                body::empty_response(StatusCode::INTERNAL_SERVER_ERROR),
                CacheStatus::Error,
            )
        }
    };

    resp.headers_mut().insert(
        constants::PROTOCOL_CACHE_STATUS_KEY,
        HeaderValue::from_static(cache_status.as_str()),
    );
    state.metrics.record_request(cache_status);

    if let Some(logger) = &state.access_logger {
        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .or_else(|| resp.body().size_hint().exact());
        logger.log(&AccessEntry {
            client_ip: &client_ip,
            host: &host,
            method: &method,
            uri: &uri,
            version,
            status: resp.status(),
            content_length,
            duration: start_at.elapsed(),
            cache_status,
            user_agent: &user_agent,
        });
    }
    Ok(resp)
}

/// Routes one request: metrics endpoint, pass-through, store hit, or fill.
async fn dispatch(req: Request<Incoming>, state: &AppState) -> (Response<ProxyBody>, CacheStatus) {
    let (parts, body) = req.into_parts();

    if let Some(metrics_path) = state.cfg.server.metrics_path.as_deref() {
        if parts.uri.path() == metrics_path {
            let mut resp = body::text_response(StatusCode::OK, &state.metrics.render());
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            return (resp, CacheStatus::Pass);
        }
    }

    if !state.policy.is_cacheable(&parts.method, parts.uri.path()) {
        return proxy_pass(parts, body, state).await;
    }
    // cache-eligible requests never forward their body
    drop(body);

    let key = match state.store.resolve(parts.uri.path()) {
        Ok(key) => key,
        Err(err) => {
            log::debug!("reject {}: {err}", parts.uri);
            return (err.response(), CacheStatus::Error);
        }
    };

    match state.store.lookup(&key).await {
        Ok(Lookup::File(meta)) => (
            responder::serve(&key, &meta, &parts.method, &parts.headers).await,
            CacheStatus::Hit,
        ),
        Ok(Lookup::Directory) => {
            log::debug!("{} is a directory in the store", key.path().display());
            (body::empty_response(StatusCode::BAD_REQUEST), CacheStatus::Error)
        }
        Ok(Lookup::Missing) => {
            state
                .coordinator
                .fetch(key, &parts.method, &parts.uri, &parts.headers)
                .await
        }
        Err(err) => {
            log::warn!("lookup {} failed: {err}", key.path().display());
            (err.response(), CacheStatus::Error)
        }
    }
}

/// Forwards a request that is never cached, streaming both bodies.
async fn proxy_pass(
    parts: http::request::Parts,
    body: Incoming,
    state: &AppState,
) -> (Response<ProxyBody>, CacheStatus) {
    state.metrics.record_upstream_fetch();
    let resp = state
        .upstream
        .forward(parts.method, &parts.uri, &parts.headers, body::incoming(body))
        .await;
    match resp {
        Ok(resp) => {
            let (head, incoming) = resp.into_parts();
            let mut out = Response::new(body::incoming(incoming));
            *out.status_mut() = head.status;
            *out.headers_mut() = state.upstream.filter().filter(&head.headers);
            (out, CacheStatus::Pass)
        }
        Err(err) => {
            log::warn!("proxy {} failed: {err}", parts.uri);
            (err.response(), CacheStatus::Error)
        }
    }
}

fn header_str(headers: &http::HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
