//! Delivery of lines to registered sessions.
//!
//! Every routing pass starts from a fresh [`Registry::snapshot`] and writes
//! outside the registry lock. A failed write never aborts the pass; the
//! connection is collected as a departure candidate and handled once the pass
//! is over.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    protocol,
    registry::Registry,
};

/// Direct message failures, reported only to the sender.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnicastError {
    #[error("you cannot DM yourself.")]
    SelfTarget,
    #[error("user not found: {0}")]
    UserNotFound(String),
}

pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Sends `line` to every active session, the sender included.
    pub async fn broadcast_all(&self, line: &str) {
        let failed = self.deliver(line, None).await;
        self.handle_departures(failed).await;
    }

    /// Sends `line` to every active session except `excluded`.
    pub async fn broadcast_except(&self, line: &str, excluded: ConnectionId) {
        let failed = self.deliver(line, Some(excluded)).await;
        self.handle_departures(failed).await;
    }

    /// Sends the current roster to every active session.
    pub async fn send_roster(&self) {
        let names = self.registry.names().await;
        self.broadcast_all(&protocol::roster(&names)).await;
    }

    /// Tells everyone still online that `name` is gone.
    ///
    /// The caller must already have unregistered `name`. Write failures here
    /// only close the failing connection; its own session task then runs its
    /// regular cleanup.
    pub async fn announce_departure(&self, name: &str) {
        self.announce_departures(&[name.to_string()]).await;
    }

    /// Sends a direct message from `from` to `to`, echoing it back to `from`.
    pub async fn unicast(&self, from: &str, to: &str, text: &str) -> Result<(), UnicastError> {
        if from == to {
            return Err(UnicastError::SelfTarget);
        }

        let snapshot = self.registry.snapshot().await;
        let find = |wanted: &str| {
            snapshot
                .iter()
                .find(|(name, _)| name == wanted)
                .map(|(_, conn)| ConnectionHandle::clone(conn))
        };
        let target = find(to).ok_or_else(|| UnicastError::UserNotFound(to.to_string()))?;
        let sender = find(from);
        drop(snapshot);

        let mut failed = Vec::new();
        if let Err(error) = target.send_line(&protocol::direct_message(from, text)).await {
            debug!(conn = target.id(), ?error, "direct message delivery failed");
            failed.push(target);
        }
        if let Some(sender) = sender {
            if let Err(error) = sender.send_line(&protocol::direct_echo(to, text)).await {
                debug!(conn = sender.id(), ?error, "direct message echo failed");
                failed.push(sender);
            }
        }

        self.handle_departures(failed).await;
        Ok(())
    }

    /// One pass over a fresh snapshot. Returns the connections whose write
    /// failed.
    async fn deliver(&self, line: &str, excluded: Option<ConnectionId>) -> Vec<ConnectionHandle> {
        let snapshot = self.registry.snapshot().await;

        let mut failed = Vec::new();
        for (name, conn) in snapshot {
            if Some(conn.id()) == excluded {
                continue;
            }
            if let Err(error) = conn.send_line(line).await {
                debug!(%name, conn = conn.id(), ?error, "delivery failed");
                failed.push(conn);
            }
        }
        failed
    }

    async fn handle_departures(&self, failed: Vec<ConnectionHandle>) {
        let mut departed = Vec::new();
        for conn in failed {
            conn.close();
            if let Some(name) = self.registry.unregister(conn.id()).await {
                info!(peer = ?conn.peer(), %name, "client dropped during delivery");
                departed.push(name);
            }
        }

        if !departed.is_empty() {
            self.announce_departures(&departed).await;
        }
    }

    async fn announce_departures(&self, names: &[String]) {
        let roster = protocol::roster(&self.registry.names().await);
        self.deliver_without_departures(&roster).await;
        for name in names {
            self.deliver_without_departures(&protocol::left(name)).await;
        }
    }

    async fn deliver_without_departures(&self, line: &str) {
        for conn in self.deliver(line, None).await {
            conn.close();
        }
    }
}
