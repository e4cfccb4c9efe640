//! In-process connection registry: which users have which live connections.
//!
//! Every mutation takes one write lock over both the forward map
//! (`connection -> entry`) and the reverse map (`user -> connections`), so
//! readers never observe the two out of step. No method awaits.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::events::Dispatch;

/// Outbound queue depth per connection. A full queue drops the event.
pub const OUTBOUND_CAPACITY: usize = 256;

struct ConnectionEntry {
    /// Owning user, set once the connection registers.
    user_id: Option<String>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    sender: Option<mpsc::Sender<Dispatch>>,
}

impl ConnectionEntry {
    fn new(sender: Option<mpsc::Sender<Dispatch>>) -> Self {
        Self {
            user_id: None,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
            sender,
        }
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, ConnectionEntry>,
    by_user: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn detach(&mut self, connection_id: &str, user_id: &str) {
        if let Some(set) = self.by_user.get_mut(user_id) {
            set.remove(connection_id);
            if set.is_empty() {
                self.by_user.remove(user_id);
            }
        }
    }
}

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Connection newly bound to the user.
    Added,
    /// Connection was already bound to this user; only liveness was refreshed.
    Refreshed,
    /// Connection moved from another user, who is returned.
    Rebound { previous_user: String },
}

/// Snapshot of one connection, logged when its session closes.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub idle_for: Duration,
}

/// The single authority for "is this user reachable in-process".
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted, not yet authenticated connection.
    /// Re-connecting a known id only replaces its outbound sender.
    pub fn connect(&self, connection_id: &str, sender: Option<mpsc::Sender<Dispatch>>) {
        let mut inner = self.inner.write();
        match inner.connections.get_mut(connection_id) {
            Some(entry) => {
                if sender.is_some() {
                    entry.sender = sender;
                }
            }
            None => {
                inner
                    .connections
                    .insert(connection_id.to_string(), ConnectionEntry::new(sender));
            }
        }
    }

    /// Bind `connection_id` to `user_id`. Idempotent for the same pair, but
    /// always counts as a fresh heartbeat.
    pub fn register(&self, user_id: &str, connection_id: &str) -> Registration {
        let mut inner = self.inner.write();
        let entry = inner
            .connections
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionEntry::new(None));
        entry.last_heartbeat = Instant::now();

        let previous = entry.user_id.replace(user_id.to_string());
        let outcome = match previous {
            Some(prev) if prev == user_id => Registration::Refreshed,
            Some(prev) => {
                inner.detach(connection_id, &prev);
                Registration::Rebound {
                    previous_user: prev,
                }
            }
            None => Registration::Added,
        };

        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        outcome
    }

    /// Remove a connection. Returns the owning user, or `None` if the
    /// connection was unknown or never registered.
    pub fn unregister(&self, connection_id: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let entry = inner.connections.remove(connection_id)?;
        let user_id = entry.user_id?;
        inner.detach(connection_id, &user_id);
        Some(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .read()
            .by_user
            .get(user_id)
            .is_some_and(|set| !set.is_empty())
    }

    /// Snapshot of the user's connections. May be stale as soon as it returns.
    pub fn connections_of(&self, user_id: &str) -> HashSet<String> {
        self.inner
            .read()
            .by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_of(&self, connection_id: &str) -> Option<String> {
        self.inner
            .read()
            .connections
            .get(connection_id)
            .and_then(|e| e.user_id.clone())
    }

    /// Record a heartbeat. Returns the owning user if the connection is registered.
    pub fn touch(&self, connection_id: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let entry = inner.connections.get_mut(connection_id)?;
        entry.last_heartbeat = Instant::now();
        entry.user_id.clone()
    }

    /// Most recent heartbeat across all of the user's connections.
    pub fn latest_heartbeat(&self, user_id: &str) -> Option<Instant> {
        let inner = self.inner.read();
        inner
            .by_user
            .get(user_id)?
            .iter()
            .filter_map(|c| inner.connections.get(c))
            .map(|e| e.last_heartbeat)
            .max()
    }

    /// Queue an event for one connection. Returns `false` if the connection
    /// is gone, has no outbound channel, or its queue is full.
    pub fn emit(&self, connection_id: &str, dispatch: Dispatch) -> bool {
        let sender = {
            let inner = self.inner.read();
            match inner.connections.get(connection_id).and_then(|e| e.sender.clone()) {
                Some(tx) => tx,
                None => return false,
            }
        };
        match sender.try_send(dispatch) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(connection_id, error = %e, "dropped outbound event");
                false
            }
        }
    }

    /// Connections with no heartbeat for at least `idle`.
    pub fn stale_connections(&self, idle: Duration) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .read()
            .connections
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) >= idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn online_users(&self) -> Vec<String> {
        self.inner.read().by_user.keys().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let inner = self.inner.read();
        let e = inner.connections.get(connection_id)?;
        Some(ConnectionInfo {
            connection_id: connection_id.to_string(),
            user_id: e.user_id.clone(),
            connected_at: e.connected_at,
            idle_for: e.last_heartbeat.elapsed(),
        })
    }

    /// Push a connection's last heartbeat into the past.
    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, connection_id: &str, by: Duration) {
        if let Some(e) = self.inner.write().connections.get_mut(connection_id) {
            if let Some(earlier) = e.last_heartbeat.checked_sub(by) {
                e.last_heartbeat = earlier;
            }
        }
    }
}
