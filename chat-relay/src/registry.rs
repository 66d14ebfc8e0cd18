//! Who is online.
//!
//! The registry is the only shared mutable state in the relay. Both views
//! (name to connection, connection to name) live behind one lock and are
//! always updated together, so no caller can observe one without the other.
//! Callers copy what they need out with [`Registry::snapshot`] and do their
//! network I/O after the lock is released.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::connection::{ConnectionHandle, ConnectionId};

pub const MAX_NAME_CHARS: usize = 24;

/// Reasons a display name cannot be bound to a connection.
///
/// The `Display` text is sent to the client verbatim after `ERR `.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invalid username (1-24 chars).")]
    InvalidName,
    #[error("username taken.")]
    NameTaken,
    #[error("already registered.")]
    AlreadyRegistered,
}

#[derive(Default)]
struct Sessions {
    by_name: BTreeMap<String, ConnectionHandle>,
    by_id: HashMap<ConnectionId, String>,
}

#[derive(Default)]
pub struct Registry {
    sessions: Mutex<Sessions>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `conn`. Names are compared exactly (case-sensitive).
    pub async fn register(&self, name: &str, conn: &ConnectionHandle) -> Result<(), RegisterError> {
        validate_name(name)?;

        let mut sessions = self.sessions.lock().await;
        if sessions.by_name.contains_key(name) {
            return Err(RegisterError::NameTaken);
        }
        if sessions.by_id.contains_key(&conn.id()) {
            return Err(RegisterError::AlreadyRegistered);
        }

        sessions.by_name.insert(name.to_string(), ConnectionHandle::clone(conn));
        sessions.by_id.insert(conn.id(), name.to_string());
        Ok(())
    }

    /// Removes every trace of `id`, returning the freed name.
    ///
    /// Only the first call for a given connection returns `Some`; racing
    /// callers get `None` and must not announce a departure.
    pub async fn unregister(&self, id: ConnectionId) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        let name = sessions.by_id.remove(&id)?;
        sessions.by_name.remove(&name);
        Some(name)
    }

    /// Point-in-time copy of all active sessions, ordered by name.
    pub async fn snapshot(&self) -> Vec<(String, ConnectionHandle)> {
        let sessions = self.sessions.lock().await;
        sessions
            .by_name
            .iter()
            .map(|(name, conn)| (name.clone(), ConnectionHandle::clone(conn)))
            .collect()
    }

    /// Online names, ordered.
    pub async fn names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.by_name.keys().cloned().collect()
    }

    pub async fn lookup(&self, name: &str) -> Option<ConnectionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.by_name.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn name_of(&self, id: ConnectionId) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.by_id.get(&id).cloned()
    }

    /// Number of registered names.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.by_name.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Display names are 1 to [`MAX_NAME_CHARS`] characters long.
pub fn validate_name(name: &str) -> Result<(), RegisterError> {
    let chars = name.chars().count();
    if chars == 0 || chars > MAX_NAME_CHARS {
        return Err(RegisterError::InvalidName);
    }
    Ok(())
}
