use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::ProxyError;
use crate::storage::CacheKey;

/// A body being written under the `.in-progress` name.
///
/// Nothing is visible at the canonical path until [`PendingEntry::publish`] renames the temp file
/// into place. Dropping an unpublished entry removes the temp file.
pub struct PendingEntry {
    key: CacheKey,
    temp_path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl PendingEntry {
    pub async fn create(key: &CacheKey) -> Result<Self, ProxyError> {
        let temp_path = key.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ProxyError::publish(parent, err))?;
        }
        let file = File::create(&temp_path)
            .await
            .map_err(|err| ProxyError::publish(&temp_path, err))?;
        Ok(Self {
            key: key.clone(),
            temp_path,
            file: Some(file),
            written: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ProxyError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ProxyError::publish(&self.temp_path, std::io::ErrorKind::BrokenPipe.into()))?;
        file.write_all(chunk)
            .await
            .map_err(|err| ProxyError::publish(&self.temp_path, err))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Writes every chunk received until the sender side is dropped.
    pub async fn write_from(&mut self, mut rx: mpsc::Receiver<Bytes>) -> Result<(), ProxyError> {
        while let Some(chunk) = rx.recv().await {
            self.write(&chunk).await?;
        }
        Ok(())
    }

    /// Flushes the temp file and atomically renames it to the canonical path.
    pub async fn publish(mut self) -> Result<u64, ProxyError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|err| ProxyError::publish(&self.temp_path, err))?;
            file.sync_all()
                .await
                .map_err(|err| ProxyError::publish(&self.temp_path, err))?;
        }
        fs::rename(&self.temp_path, self.key.path())
            .await
            .map_err(|err| ProxyError::publish(self.key.path(), err))?;
        // renamed away; nothing left for Drop to clean up
        self.temp_path = PathBuf::new();
        Ok(self.written)
    }

    pub async fn discard(mut self) {
        self.file.take();
        let temp_path = std::mem::take(&mut self.temp_path);
        if let Err(err) = fs::remove_file(&temp_path).await {
            log::warn!("remove temp file {} failed: {err}", temp_path.display());
        }
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if self.temp_path.as_os_str().is_empty() {
            return;
        }
        self.file.take();
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    #[tokio::test]
    async fn publish_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let key = store.resolve("/deep/nested/hello.png").unwrap();

        let mut pending = PendingEntry::create(&key).await.unwrap();
        pending.write(b"hello ").await.unwrap();
        assert!(key.temp_path().exists());
        assert!(!key.path().exists(), "canonical path must stay absent until publish");

        pending.write(b"world").await.unwrap();
        let written = pending.publish().await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(std::fs::read(key.path()).unwrap(), b"hello world");
        assert!(!key.temp_path().exists());
    }

    #[tokio::test]
    async fn discard_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let key = store.resolve("/hello.png").unwrap();

        let mut pending = PendingEntry::create(&key).await.unwrap();
        pending.write(b"partial").await.unwrap();
        pending.discard().await;
        assert!(!key.temp_path().exists());
        assert!(!key.path().exists());
    }

    #[tokio::test]
    async fn drop_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let key = store.resolve("/hello.png").unwrap();

        let pending = PendingEntry::create(&key).await.unwrap();
        assert!(key.temp_path().exists());
        drop(pending);
        assert!(!key.temp_path().exists());
    }

    #[tokio::test]
    async fn write_from_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let key = store.resolve("/stream.bin").unwrap();

        let (tx, rx) = mpsc::channel(2);
        let writer = tokio::spawn(async move {
            let mut pending = PendingEntry::create(&key).await.unwrap();
            pending.write_from(rx).await.unwrap();
            pending.publish().await.unwrap()
        });
        for _ in 0..10 {
            tx.send(Bytes::from_static(b"0123456789")).await.unwrap();
        }
        drop(tx);
        assert_eq!(writer.await.unwrap(), 100);
    }

    #[tokio::test]
    async fn create_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        std::fs::write(dir.path().join("blocker"), b"x").unwrap();
        let key = store.resolve("/blocker/inner.png").unwrap();
        assert!(matches!(
            PendingEntry::create(&key).await,
            Err(ProxyError::Publish { .. })
        ));
    }
}
