use std::io;
use std::path::PathBuf;
use std::time::Duration;

use http::{Response, StatusCode};
use thiserror::Error;

use crate::body::{self, ProxyBody};

/// Failures resolved at the request boundary. None of these are fatal to the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad request path {0:?}")]
    BadPath(String),
    #[error("store entry {} is a directory", .0.display())]
    StoreConflict(PathBuf),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("publish {} failed: {source}", path.display())]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("local read failed: {0}")]
    LocalRead(#[source] io::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadPath(_) | ProxyError::StoreConflict(_) => StatusCode::BAD_REQUEST,
            ProxyError::LocalRead(err) if err.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ProxyError::Upstream(_)
            | ProxyError::UpstreamTimeout(_)
            | ProxyError::Publish { .. }
            | ProxyError::LocalRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Locally generated error responses carry no body.
    pub fn response(&self) -> Response<ProxyBody> {
        body::empty_response(self.status())
    }

    pub fn publish(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ProxyError::Publish {
            path: path.into(),
            source,
        }
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}
