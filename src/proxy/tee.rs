use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::body::BodyError;

/// Chunks buffered per consumer before the producer has to wait.
pub const TEE_BUFFER_CHUNKS: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub enum TeeError {
    /// The disk side stopped accepting chunks; the fill cannot be published.
    DiskClosed,
}

/// Fans one upstream byte stream out to the store writer and the live client.
///
/// Each side has its own bounded queue, so either consumer can run up to
/// [`TEE_BUFFER_CHUNKS`] behind the other; past that the producer waits for the slower one.
/// Losing the client, or a client that accepts nothing for `client_timeout`, only detaches it.
/// Losing the disk side aborts the tee.
pub struct Tee {
    disk: Option<mpsc::Sender<Bytes>>,
    client: Option<mpsc::Sender<Result<Bytes, BodyError>>>,
    client_timeout: Option<Duration>,
}

enum ClientSend {
    Sent,
    Gone,
    Stalled,
}

impl Tee {
    pub fn new(
        disk: mpsc::Sender<Bytes>,
        client: Option<mpsc::Sender<Result<Bytes, BodyError>>>,
    ) -> Self {
        Self {
            disk: Some(disk),
            client,
            client_timeout: None,
        }
    }

    /// Bounds how long a full client queue may hold up the disk side. Zero means no bound.
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn client_attached(&self) -> bool {
        self.client.is_some()
    }

    pub async fn push(&mut self, chunk: Bytes) -> Result<(), TeeError> {
        let disk = self.disk.as_ref().ok_or(TeeError::DiskClosed)?;
        let (disk_sent, client_sent) = match self.client.as_ref() {
            Some(client) => {
                let (d, c) = tokio::join!(
                    disk.send(chunk.clone()),
                    send_client(client, chunk, self.client_timeout)
                );
                (d.is_ok(), Some(c))
            }
            None => (disk.send(chunk).await.is_ok(), None),
        };
        match client_sent {
            Some(ClientSend::Gone) => {
                log::debug!("client went away, fill continues without it");
                self.client = None;
            }
            Some(ClientSend::Stalled) => {
                log::debug!("client stopped reading, fill continues without it");
                if let Some(client) = self.client.take() {
                    // lands once the client drains its queue, or is dropped with the connection
                    tokio::spawn(async move {
                        let _ = client.send(Err("client stalled".into())).await;
                    });
                }
            }
            Some(ClientSend::Sent) | None => {}
        }
        if !disk_sent {
            self.disk = None;
            return Err(TeeError::DiskClosed);
        }
        Ok(())
    }

    /// Ends the client body with an error so a truncated transfer is never mistaken for a complete one.
    pub async fn abort_client(&mut self, reason: impl Into<BodyError>) {
        if let Some(client) = self.client.take() {
            let _ = client.send(Err(reason.into())).await;
        }
    }

    /// Closes both sides cleanly.
    pub fn finish(self) {}
}

async fn send_client(
    client: &mpsc::Sender<Result<Bytes, BodyError>>,
    chunk: Bytes,
    limit: Option<Duration>,
) -> ClientSend {
    let sent = match limit {
        None => client.send(Ok(chunk)).await,
        Some(limit) => match tokio::time::timeout(limit, client.send(Ok(chunk))).await {
            Ok(sent) => sent,
            Err(_) => return ClientSend::Stalled,
        },
    };
    match sent {
        Ok(()) => ClientSend::Sent,
        Err(_) => ClientSend::Gone,
    }
}
