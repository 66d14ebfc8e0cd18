//! Per-connection session state machine.
//!
//! A session starts in [`SessionState::Connecting`] where the first line is
//! the requested display name. Once registered it is `Active` and every line
//! is a command or chat. Any way out (`/leave`, end of stream, read or write
//! failure, or the relay closing the connection) ends in `Closed` through the
//! same teardown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tracing::{debug, info};

use crate::{
    connection::ConnectionHandle,
    framer::LineFramer,
    protocol::{self, Command},
    router::Router,
};

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active { name: String },
    Closed,
}

pub struct Session {
    conn: ConnectionHandle,
    router: Arc<Router>,
    state: SessionState,
}

impl Session {
    pub fn new(conn: ConnectionHandle, router: Arc<Router>) -> Self {
        Self {
            conn,
            router,
            state: SessionState::Connecting,
        }
    }

    /// Drives the session until it closes, then tears it down.
    ///
    /// Any unterminated bytes left in the framer at that point are discarded.
    pub async fn run<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut framer = LineFramer::new();
        let outcome = self.read_loop(&mut reader, &mut framer).await;

        if framer.pending() > 0 {
            debug!(
                conn = self.conn.id(),
                bytes = framer.pending(),
                "discarding unterminated input"
            );
        }
        self.teardown().await;

        outcome
    }

    async fn read_loop<R>(&mut self, reader: &mut R, framer: &mut LineFramer) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            // A raised close latch wins over data that is already readable.
            let read = select! {
                biased;
                () = self.conn.closed() => {
                    debug!(conn = self.conn.id(), "connection closed by relay");
                    return Ok(());
                }
                read = reader.read(&mut chunk) => read,
            };

            let bytes = read.context("failed to read from client")?;
            if bytes == 0 {
                debug!(conn = self.conn.id(), "client closed the stream");
                return Ok(());
            }

            for line in framer.feed(&chunk[..bytes]) {
                self.handle_line(&line).await?;
                if self.state == SessionState::Closed {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        // The router may have closed and unregistered this connection during
        // an earlier line; nothing else may go out under the freed name.
        if self.conn.is_closed() {
            debug!(conn = self.conn.id(), "dropping input after close");
            self.state = SessionState::Closed;
            return Ok(());
        }

        let next = match &self.state {
            SessionState::Connecting => self.handshake(line).await?,
            SessionState::Active { name } => self.dispatch(name, line).await?,
            SessionState::Closed => return Ok(()),
        };
        self.state = next;
        Ok(())
    }

    async fn handshake(&self, name: &str) -> Result<SessionState> {
        let registry = self.router.registry();
        if let Err(error) = registry.register(name, &self.conn).await {
            info!(peer = ?self.conn.peer(), %name, %error, "handshake rejected");
            self.reply(&protocol::error(&error)).await?;
            return Ok(SessionState::Closed);
        }

        info!(peer = ?self.conn.peer(), %name, "client joined");
        self.reply(&protocol::welcome(name)).await?;

        self.router.send_roster().await;
        if self.conn.is_closed() {
            return Ok(SessionState::Closed);
        }
        self.router
            .broadcast_except(&protocol::joined(name), self.conn.id())
            .await;

        Ok(SessionState::Active {
            name: name.to_string(),
        })
    }

    async fn dispatch(&self, name: &str, line: &str) -> Result<SessionState> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(error) => {
                self.reply(&protocol::error(&error)).await?;
                return Ok(self.state.clone());
            }
        };

        match command {
            Command::Empty => {}
            Command::Leave => {
                debug!(%name, "client sent /leave");
                return Ok(SessionState::Closed);
            }
            Command::Who => {
                let names = self.router.registry().names().await;
                self.reply(&protocol::roster(&names)).await?;
            }
            Command::Msg { target, text } => {
                if let Err(error) = self.router.unicast(name, target, text).await {
                    self.reply(&protocol::error(&error)).await?;
                }
            }
            Command::Chat(text) => {
                self.router.broadcast_all(&protocol::chat(name, text)).await;
            }
        }

        Ok(self.state.clone())
    }

    async fn reply(&self, line: &str) -> Result<()> {
        self.conn
            .send_line(line)
            .await
            .context("failed to write to client")
    }

    /// Releases the connection. Safe to reach after the router has already
    /// unregistered this connection: only the first unregister frees a name.
    async fn teardown(&mut self) {
        self.state = SessionState::Closed;
        self.conn.close();

        if let Some(name) = self.router.registry().unregister(self.conn.id()).await {
            info!(peer = ?self.conn.peer(), %name, "client left");
            self.router.announce_departure(&name).await;
        }

        self.conn.shutdown().await;
    }
}
