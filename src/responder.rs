//! Serves published store entries.

use std::fs::Metadata;
use std::io;
use std::time::UNIX_EPOCH;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use tokio::fs::File;

use crate::body::{self, ProxyBody};
use crate::error::ProxyError;
use crate::storage::CacheKey;

/// Weak validator derived from size and modification time only.
pub fn entity_tag(meta: &Metadata) -> String {
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("W/\"{:x}-{:x}\"", meta.len(), mtime_ms)
}

/// `If-None-Match` check using weak comparison. Accepts `*` and comma-separated lists.
pub fn not_modified(headers: &HeaderMap, etag: &str) -> bool {
    let ours = strip_weak(etag);
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == ours)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

pub fn content_type(key: &CacheKey) -> String {
    mime_guess::from_path(key.path())
        .first_or_octet_stream()
        .to_string()
}

/// Serves a store hit.
pub async fn serve(key: &CacheKey, meta: &Metadata, method: &Method, req_headers: &HeaderMap) -> Response<ProxyBody> {
    serve_with(key, meta, method, req_headers, StatusCode::OK, HeaderMap::new()).await
}

/// Serves a store entry on top of a base status and header set, used when releasing fill waiters.
/// Validator, length and modification headers always come from the file itself.
pub async fn serve_with(
    key: &CacheKey,
    meta: &Metadata,
    method: &Method,
    req_headers: &HeaderMap,
    status: StatusCode,
    mut headers: HeaderMap,
) -> Response<ProxyBody> {
    let etag = entity_tag(meta);
    if not_modified(req_headers, &etag) {
        let mut resp = body::empty_response(StatusCode::NOT_MODIFIED);
        if let Ok(val) = HeaderValue::from_str(&etag) {
            resp.headers_mut().insert(ETAG, val);
        }
        return resp;
    }

    if let Ok(val) = HeaderValue::from_str(&etag) {
        headers.insert(ETAG, val);
    }
    if let Ok(modified) = meta.modified() {
        if let Ok(val) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
            headers.insert(LAST_MODIFIED, val);
        }
    }
    if !headers.contains_key(CONTENT_TYPE) {
        if let Ok(val) = HeaderValue::from_str(&content_type(key)) {
            headers.insert(CONTENT_TYPE, val);
        }
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(meta.len()));

    let body = if *method == Method::HEAD {
        body::empty()
    } else {
        match File::open(key.path()).await {
            Ok(file) => body::file(file),
            Err(err) => return read_error(key, err),
        }
    };

    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

fn read_error(key: &CacheKey, err: io::Error) -> Response<ProxyBody> {
    let err = ProxyError::LocalRead(err);
    log::warn!("serve {} failed: {err}", key.path().display());
    body::empty_response(err.status())
}
