//! Delivers a user's presence change to every live connection of their
//! online friends.
//!
//! Cost is O(friends × connections per friend). Presence is ephemeral:
//! offline friends simply miss the event, there is no push fallback.

use std::sync::Arc;
use std::time::Duration;

use crate::db::store::{with_timeout, Store};
use crate::models::user_status::PresenceStatus;

use super::events::Dispatch;
use super::registry::ConnectionRegistry;

pub struct FriendFanout {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    store_timeout: Duration,
}

impl FriendFanout {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            store_timeout,
        }
    }

    /// Sends `PRESENCE_UPDATE {user_id, status}` to each friend connection
    /// once. Returns the number of connections the event was queued on.
    pub async fn broadcast_presence(&self, user_id: &str, status: PresenceStatus) -> usize {
        // The store returns a set, so edges stored in both directions
        // collapse to one friend.
        let friends = match with_timeout(self.store_timeout, self.store.friend_ids_of(user_id)).await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "friend lookup failed, presence not broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for friend_id in friends.iter().filter(|f| f.as_str() != user_id) {
            if !self.registry.is_online(friend_id) {
                continue;
            }
            for connection_id in self.registry.connections_of(friend_id) {
                if self
                    .registry
                    .emit(&connection_id, Dispatch::presence(user_id, status))
                {
                    delivered += 1;
                }
            }
        }

        tracing::debug!(
            user_id,
            status = %status,
            friends = friends.len(),
            delivered,
            "presence broadcast"
        );
        delivered
    }
}
