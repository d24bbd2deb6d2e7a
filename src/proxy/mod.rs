//! Cache fills: one upstream fetch per key, streamed to the leader while it is written to the store,
//! then handed to every request that queued behind it.

use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, RANGE};
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::{mpsc, oneshot};

use crate::body::{self, ProxyBody};
use crate::constants::CacheStatus;
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::responder;
use crate::storage::publish::PendingEntry;
use crate::storage::{CacheKey, Lookup, Store};
use crate::upstream::UpstreamClient;

pub mod singleflight;
pub mod tee;

use singleflight::{FillOutcome, FlightGuard, Group, Join};
use tee::{Tee, TEE_BUFFER_CHUNKS};

/// Routes store misses through the singleflight registry.
#[derive(Clone)]
pub struct Coordinator {
    store: Store,
    group: Group,
    upstream: UpstreamClient,
    metrics: Metrics,
    body_idle_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        store: Store,
        group: Group,
        upstream: UpstreamClient,
        metrics: Metrics,
        body_idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            group,
            upstream,
            metrics,
            body_idle_timeout,
        }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Answers a cache-eligible request whose key was missing from the store.
    pub async fn fetch(
        &self,
        key: CacheKey,
        method: &Method,
        uri: &Uri,
        req_headers: &HeaderMap,
    ) -> (Response<ProxyBody>, CacheStatus) {
        match self.group.join(&key) {
            Join::Follower(rx) => self.follow(&key, rx, method, req_headers).await,
            Join::Leader(guard) => self.lead(key, guard, method, uri, req_headers).await,
        }
    }

    async fn lead(
        &self,
        key: CacheKey,
        guard: FlightGuard,
        method: &Method,
        uri: &Uri,
        req_headers: &HeaderMap,
    ) -> (Response<ProxyBody>, CacheStatus) {
        // a fill may have published between the caller's stat and our registration
        match self.store.lookup(&key).await {
            Ok(Lookup::Missing) => {}
            Ok(Lookup::File(meta)) => {
                guard.finish(FillOutcome::Published {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                });
                return (responder::serve(&key, &meta, method, req_headers).await, CacheStatus::Hit);
            }
            Ok(Lookup::Directory) => {
                guard.finish(FillOutcome::Failed);
                return (body::empty_response(StatusCode::BAD_REQUEST), CacheStatus::Error);
            }
            Err(err) => {
                guard.finish(FillOutcome::Failed);
                return (err.response(), CacheStatus::Error);
            }
        }

        let mut headers = req_headers.clone();
        // the origin must answer with the full, unencoded entity
        for name in [RANGE, IF_RANGE, IF_NONE_MATCH, IF_MODIFIED_SINCE, ACCEPT_ENCODING] {
            headers.remove(name);
        }
        let fill = Fill {
            key,
            guard,
            upstream: self.upstream.clone(),
            metrics: self.metrics.clone(),
            body_idle_timeout: self.body_idle_timeout,
            uri: uri.clone(),
            headers,
            leader_wants_body: *method != Method::HEAD,
        };
        let (head_tx, head_rx) = oneshot::channel();
        // detached so a leader disconnect never cancels the fill its followers are waiting on
        tokio::spawn(fill.run(head_tx));
        match head_rx.await {
            Ok((resp, status)) => (resp, status),
            Err(_) => (
                body::empty_response(StatusCode::INTERNAL_SERVER_ERROR),
                CacheStatus::Error,
            ),
        }
    }

    async fn follow(
        &self,
        key: &CacheKey,
        rx: oneshot::Receiver<FillOutcome>,
        method: &Method,
        req_headers: &HeaderMap,
    ) -> (Response<ProxyBody>, CacheStatus) {
        match rx.await {
            Ok(FillOutcome::Published { status, headers }) => match self.store.lookup(key).await {
                Ok(Lookup::File(meta)) => (
                    responder::serve_with(key, &meta, method, req_headers, status, headers).await,
                    CacheStatus::Coalesced,
                ),
                Ok(_) => {
                    log::warn!("published entry {} vanished before serving", key.path().display());
                    (
                        body::empty_response(StatusCode::INTERNAL_SERVER_ERROR),
                        CacheStatus::Error,
                    )
                }
                Err(err) => (err.response(), CacheStatus::Error),
            },
            Ok(FillOutcome::Passed { status, headers }) => {
                let mut resp = body::empty_response(status);
                *resp.headers_mut() = headers;
                (resp, CacheStatus::Coalesced)
            }
            Ok(FillOutcome::Failed) | Err(_) => (
                body::empty_response(StatusCode::INTERNAL_SERVER_ERROR),
                CacheStatus::Error,
            ),
        }
    }
}

type LeaderHead = (Response<ProxyBody>, CacheStatus);

enum Interrupted {
    Upstream(ProxyError),
    Disk,
}

/// One upstream fetch. Owns the flight, so whatever happens to the leader's connection the
/// registry entry is resolved exactly once.
struct Fill {
    key: CacheKey,
    guard: FlightGuard,
    upstream: UpstreamClient,
    metrics: Metrics,
    body_idle_timeout: Duration,
    uri: Uri,
    headers: HeaderMap,
    leader_wants_body: bool,
}

impl Fill {
    async fn run(self, head_tx: oneshot::Sender<LeaderHead>) {
        let metrics = self.metrics.clone();
        metrics.fill_started();
        self.execute(head_tx).await;
        metrics.fill_finished();
    }

    async fn execute(self, head_tx: oneshot::Sender<LeaderHead>) {
        let Fill {
            key,
            guard,
            upstream,
            metrics,
            body_idle_timeout,
            uri,
            headers,
            leader_wants_body,
        } = self;

        metrics.record_upstream_fetch();
        // always GET so a HEAD leader still produces a full entry
        let resp = match upstream.forward(Method::GET, &uri, &headers, body::empty()).await {
            Ok(resp) => resp,
            Err(err) => {
                log::warn!("fill {} failed: {err}", key.path().display());
                let _ = head_tx.send((err.response(), CacheStatus::Error));
                guard.finish(FillOutcome::Failed);
                return;
            }
        };

        let status = resp.status();
        let resp_headers = upstream.filter().filter(resp.headers());

        if !status.is_success() {
            log::debug!("fill {} got {status}, not storing", key.path().display());
            let mut waiter_headers = resp_headers.clone();
            waiter_headers.remove(CONTENT_LENGTH);
            let leader_body = if leader_wants_body {
                body::incoming(resp.into_body())
            } else {
                body::empty()
            };
            let _ = head_tx.send((with_head(leader_body, status, resp_headers), CacheStatus::Miss));
            guard.finish(FillOutcome::Passed {
                status,
                headers: waiter_headers,
            });
            return;
        }

        let pending = match PendingEntry::create(&key).await {
            Ok(pending) => pending,
            Err(err) => {
                log::warn!("fill {} failed: {err}", key.path().display());
                let _ = head_tx.send((err.response(), CacheStatus::Error));
                guard.finish(FillOutcome::Failed);
                return;
            }
        };

        let (disk_tx, disk_rx) = mpsc::channel::<Bytes>(TEE_BUFFER_CHUNKS);
        let writer = tokio::spawn(async move {
            let mut pending = pending;
            let res = pending.write_from(disk_rx).await;
            (pending, res)
        });

        let (client_tx, leader_body) = if leader_wants_body {
            let (tx, rx) = mpsc::channel(TEE_BUFFER_CHUNKS);
            (Some(tx), body::channel(rx))
        } else {
            (None, body::empty())
        };
        let _ = head_tx.send((
            with_head(leader_body, status, resp_headers.clone()),
            CacheStatus::Miss,
        ));

        let mut tee = Tee::new(disk_tx, client_tx).with_client_timeout(body_idle_timeout);
        let interrupted = pump(resp.into_body(), &mut tee, body_idle_timeout).await;

        if let Some(interrupted) = interrupted {
            let reason = match &interrupted {
                Interrupted::Upstream(err) => err.to_string(),
                Interrupted::Disk => "cache write failed".to_string(),
            };
            tee.abort_client(reason.clone()).await;
            tee.finish();
            let disk_err = match writer.await {
                Ok((pending, res)) => {
                    pending.discard().await;
                    res.err()
                }
                Err(err) => {
                    log::error!("cache writer for {} panicked: {err}", key.path().display());
                    None
                }
            };
            match disk_err {
                Some(err) => log::warn!("fill {} aborted: {err}", key.path().display()),
                None => log::warn!("fill {} aborted: {reason}", key.path().display()),
            }
            guard.finish(FillOutcome::Failed);
            return;
        }

        tee.finish();
        let published = match writer.await {
            Ok((pending, Ok(()))) => pending.publish().await,
            Ok((pending, Err(err))) => {
                pending.discard().await;
                Err(err)
            }
            Err(err) => {
                log::error!("cache writer for {} panicked: {err}", key.path().display());
                guard.finish(FillOutcome::Failed);
                return;
            }
        };
        match published {
            Ok(bytes) => {
                log::debug!("published {} ({bytes} bytes)", key.path().display());
                metrics.record_published(bytes);
                guard.finish(FillOutcome::Published {
                    status,
                    headers: resp_headers,
                });
            }
            Err(err) => {
                log::warn!("fill {} failed: {err}", key.path().display());
                guard.finish(FillOutcome::Failed);
            }
        }
    }
}

/// Copies the upstream body into the tee until it ends, fails, or stalls.
async fn pump(mut body: Incoming, tee: &mut Tee, idle_timeout: Duration) -> Option<Interrupted> {
    loop {
        let next = if idle_timeout.is_zero() {
            body.frame().await
        } else {
            match tokio::time::timeout(idle_timeout, body.frame()).await {
                Ok(next) => next,
                Err(_) => return Some(Interrupted::Upstream(ProxyError::UpstreamTimeout(idle_timeout))),
            }
        };
        let frame = match next {
            None => return None,
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Some(Interrupted::Upstream(err.into())),
        };
        // trailers are dropped
        let Ok(data) = frame.into_data() else { continue };
        if data.is_empty() {
            continue;
        }
        if tee.push(data).await.is_err() {
            return Some(Interrupted::Disk);
        }
    }
}

fn with_head(body: ProxyBody, status: StatusCode, headers: HeaderMap) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}
