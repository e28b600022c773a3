//! Write side of a client connection.
//!
//! Every line a client receives, whether a reply to its own command or a
//! push from another connection's task, goes through the handle's write
//! lock, so lines never interleave on the socket.

use crate::error::{Error, Result};
use crate::protocol::{render_push, Frame};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared, serialized sender for one connection.
pub struct ConnectionHandle {
    id: u64,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Wrap the write half of a connection.
    pub fn new<W>(writer: W, peer: Option<SocketAddr>) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address, when known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether a write has failed or the connection was shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one text line. The newline is appended here.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.closed.store(true, Ordering::Release);
            debug!(conn = self.id, error = %e, "Write failed, marking connection closed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Push a relayed frame, rendered as the line the client sees.
    pub async fn push(&self, frame: &Frame) -> Result<()> {
        self.send_line(&render_push(frame)).await
    }

    /// Mark closed and shut down the write half.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
