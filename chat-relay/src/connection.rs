use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
};
use tracing::debug;

pub type ConnectionId = u64;

/// Shared handle to a live client connection.
pub type ConnectionHandle = Arc<Connection>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one client connection, reachable from any task.
///
/// The read side stays with the session task that owns the connection. Other
/// tasks deliver lines through [`Connection::send_line`]; the writer mutex keeps
/// concurrent deliveries from interleaving bytes within a line.
///
/// Closing is a one-way latch. Once [`Connection::close`] runs, further sends
/// fail and the owning session task is woken through [`Connection::closed`].
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new<W>(id: ConnectionId, peer: Option<SocketAddr>, writer: W) -> ConnectionHandle
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            peer,
            writer: Mutex::new(Box::new(writer)),
            closed,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes `line` followed by `\n` and flushes.
    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }

        let mut encoded = Vec::with_capacity(line.len() + 1);
        encoded.extend_from_slice(line.as_bytes());
        encoded.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Marks the connection closed. Returns `true` only for the call that
    /// actually flipped the latch.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shuts down the underlying writer so the peer observes end of stream.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(conn = self.id, ?error, "writer shutdown failed");
        }
    }
}
