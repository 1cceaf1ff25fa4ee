/// Per-connection transport state
///
/// A connection starts paused: its reader task holds until `resume` is
/// called, so the pool can decide whether to take the connection before
/// any bytes are read.

use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

pub struct Connection {
    pub id: String,
    pub peer_addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    resume: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        id: String,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
    ) -> (Self, oneshot::Receiver<()>) {
        let (resume, resumed) = oneshot::channel();
        let conn = Self {
            id,
            peer_addr,
            writer: Mutex::new(Some(writer)),
            resume: std::sync::Mutex::new(Some(resume)),
            cancel: CancellationToken::new(),
        };
        (conn, resumed)
    }

    /// Let the reader task start. Resuming twice is harmless.
    pub fn resume(&self) {
        if let Ok(mut guard) = self.resume.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write one already-framed payload.
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed"))?;
        writer.write_all(payload).await?;
        writer.flush().await
    }

    /// Stop the reader and shut the socket down.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
