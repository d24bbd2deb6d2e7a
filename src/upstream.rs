use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use http::header::{HeaderName, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::body::ProxyBody;
use crate::config;
use crate::error::ProxyError;

const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header names dropped when copying between client and origin, in both directions.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    excluded: HashSet<HeaderName>,
}

impl HeaderFilter {
    pub fn new(excluded: &[String]) -> Self {
        let excluded = excluded
            .iter()
            .map(|s| s.as_str())
            .chain(HOP_HEADERS.iter().copied())
            .filter_map(|name| HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes()).ok())
            .collect();
        Self { excluded }
    }

    pub fn is_excluded(&self, name: &HeaderName) -> bool {
        self.excluded.contains(name)
    }

    pub fn filter(&self, src: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::with_capacity(src.len());
        for (k, v) in src.iter() {
            if self.is_excluded(k) {
                continue;
            }
            out.append(k.clone(), v.clone());
        }
        out
    }
}

/// Client for the single configured origin. The transport is fixed by the backend scheme at construction.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    scheme: http::uri::Scheme,
    authority: http::uri::Authority,
    base_path: String,
    host: HeaderValue,
    filter: Arc<HeaderFilter>,
    response_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(upstream: &config::Upstream, cache: &config::Cache) -> Result<Self> {
        let backend: Uri = upstream
            .backend
            .trim()
            .parse()
            .with_context(|| format!("parse upstream.backend {}", upstream.backend))?;
        let scheme = backend
            .scheme()
            .cloned()
            .ok_or_else(|| anyhow!("upstream.backend has no scheme"))?;
        let authority = backend
            .authority()
            .cloned()
            .ok_or_else(|| anyhow!("upstream.backend has no host"))?;
        let base_path = backend.path().trim_end_matches('/').to_string();
        let host = HeaderValue::from_str(authority.as_str()).context("upstream host header")?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        let https = if upstream.insecure_skip_verify {
            HttpsConnectorBuilder::new()
                .with_tls_config(insecure_tls_config()?)
                .https_or_http()
                .enable_http1()
                .wrap_connector(connector)
        } else {
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .context("load native tls roots")?
                .https_or_http()
                .enable_http1()
                .wrap_connector(connector)
        };
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            client,
            scheme,
            authority,
            base_path,
            host,
            filter: Arc::new(HeaderFilter::new(&cache.exclude_headers)),
            response_timeout: upstream.response_timeout,
        })
    }

    pub fn filter(&self) -> &HeaderFilter {
        &self.filter
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == http::uri::Scheme::HTTPS
    }

    /// Origin URI for a client request target, keeping the query string.
    pub fn upstream_uri(&self, target: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
            .map_err(|err| ProxyError::BadPath(format!("{path_and_query}: {err}")))
    }

    /// Sends one request to the origin. Excluded and hop-by-hop headers are dropped and `host` is
    /// rewritten to the origin authority. No retries.
    pub async fn forward(
        &self,
        method: Method,
        target: &Uri,
        headers: &HeaderMap,
        body: ProxyBody,
    ) -> Result<Response<Incoming>, ProxyError> {
        let uri = self.upstream_uri(target)?;
        let mut req = Request::new(body);
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        *req.headers_mut() = self.filter.filter(headers);
        req.headers_mut().insert(HOST, self.host.clone());

        let pending = self.client.request(req);
        let resp = if self.response_timeout.is_zero() {
            pending.await?
        } else {
            tokio::time::timeout(self.response_timeout, pending)
                .await
                .map_err(|_| ProxyError::UpstreamTimeout(self.response_timeout))??
        };
        Ok(resp)
    }
}

fn insecure_tls_config() -> Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("tls versions")?;
    Ok(builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth())
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
