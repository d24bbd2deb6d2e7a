use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::ProxyError;

pub mod path;
pub mod publish;

pub use path::CacheKey;

/// Result of checking the store for a key.
#[derive(Debug)]
pub enum Lookup {
    File(Metadata),
    Directory,
    Missing,
}

/// Handle on the cache root. Entries are created once by rename and never modified afterwards.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, request_path: &str) -> Result<CacheKey, ProxyError> {
        path::resolve(&self.root, request_path)
    }

    pub async fn lookup(&self, key: &CacheKey) -> Result<Lookup, ProxyError> {
        match tokio::fs::metadata(key.path()).await {
            Ok(meta) if meta.is_dir() => Ok(Lookup::Directory),
            Ok(meta) => Ok(Lookup::File(meta)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Lookup::Missing),
            // a cached file sits where a parent directory would have to be
            Err(err) if err.kind() == io::ErrorKind::NotADirectory => {
                Err(ProxyError::StoreConflict(key.path().to_path_buf()))
            }
            Err(err) => Err(ProxyError::LocalRead(err)),
        }
    }
}
