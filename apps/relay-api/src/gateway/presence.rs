//! Per-user presence state machine.
//!
//! Presence is per-**user**, not per-connection. The status written to the
//! store is never the value an event carried: every sync re-reads the
//! connection registry under the user's slot lock and derives the status
//! from it. Writes and the matching friend broadcast for one user are
//! serialized through that lock, so they cannot reorder.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::PresenceConfig;
use crate::db::store::{with_timeout, Store};
use crate::models::user_status::PresenceStatus;

use super::fanout::FriendFanout;
use super::registry::{ConnectionRegistry, Registration};

/// Per-user state guarded by the single-flight lock.
#[derive(Debug)]
struct Slot {
    /// Status most recently broadcast to friends.
    broadcast: PresenceStatus,
    /// Set by a client PRESENCE_UPDATE; cleared when the last connection goes.
    manual_away: bool,
    /// The last status write failed and must be retried.
    dirty: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            broadcast: PresenceStatus::Offline,
            manual_away: false,
            dirty: false,
        }
    }
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.broadcast == PresenceStatus::Offline && !self.dirty && !self.manual_away
    }
}

pub struct PresenceEngine {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    fanout: FriendFanout,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    config: PresenceConfig,
    store_timeout: std::time::Duration,
}

impl PresenceEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        config: PresenceConfig,
        store_timeout: std::time::Duration,
    ) -> Self {
        let fanout = FriendFanout::new(registry.clone(), store.clone(), store_timeout);
        Self {
            registry,
            store,
            fanout,
            slots: DashMap::new(),
            config,
            store_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn slot(&self, user_id: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Status implied by the registry right now.
    fn derive(&self, user_id: &str, slot: &Slot, now: Instant) -> PresenceStatus {
        match self.registry.latest_heartbeat(user_id) {
            None => PresenceStatus::Offline,
            Some(_) if slot.manual_away => PresenceStatus::Away,
            Some(beat) if now.duration_since(beat) >= self.config.away_after => {
                PresenceStatus::Away
            }
            Some(_) => PresenceStatus::Online,
        }
    }

    /// Derive, persist, and (on change) broadcast the user's status.
    /// Returns the status that was derived.
    pub async fn sync(&self, user_id: &str) -> PresenceStatus {
        let slot = self.slot(user_id);
        let mut slot = slot.lock().await;

        let status = self.derive(user_id, &slot, Instant::now());
        if status == PresenceStatus::Offline {
            slot.manual_away = false;
        }

        let write = self.store.upsert_status(user_id, status, Utc::now());
        match with_timeout(self.store_timeout, write).await {
            Ok(()) => {
                if slot.dirty {
                    tracing::info!(user_id, status = %status, "status write recovered");
                }
                slot.dirty = false;
            }
            Err(e) => {
                tracing::warn!(user_id, status = %status, error = %e, "status write failed, will retry");
                slot.dirty = true;
            }
        }

        if slot.broadcast != status {
            tracing::debug!(user_id, from = %slot.broadcast, to = %status, "presence changed");
            self.fanout.broadcast_presence(user_id, status).await;
            slot.broadcast = status;
        }

        status
    }

    /// Status friends were last told about. A user whose last connection
    /// closed keeps this until the offline grace period runs out.
    pub async fn announced(&self, user_id: &str) -> PresenceStatus {
        let Some(slot) = self.slots.get(user_id).map(|e| e.value().clone()) else {
            return PresenceStatus::Offline;
        };
        let slot = slot.lock().await;
        slot.broadcast
    }

    /// Whether a periodic sweep should re-sync this user.
    pub async fn needs_resync(&self, user_id: &str) -> bool {
        let slot = self.slot(user_id);
        let slot = slot.lock().await;
        slot.dirty || self.derive(user_id, &slot, Instant::now()) != slot.broadcast
    }

    /// Users whose slot holds a failed write.
    pub fn dirty_users(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|e| e.value().try_lock().map(|s| s.dirty).unwrap_or(false))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop slots for users that are offline with nothing pending.
    /// A slot someone else still holds is kept.
    pub fn prune_idle_slots(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|user_id, slot| {
            if Arc::strong_count(slot) > 1 || self.registry.is_online(user_id) {
                return true;
            }
            match slot.try_lock() {
                Ok(s) => !s.is_idle(),
                Err(_) => true,
            }
        });
        before - self.slots.len()
    }

    fn spawn_sync(self: &Arc<Self>, user_id: String) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.sync(&user_id).await;
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle hooks
    // -----------------------------------------------------------------------

    /// A connection registered to a user. Registering the same pair again is
    /// treated as a heartbeat.
    pub fn on_register(self: &Arc<Self>, connection_id: &str, user_id: &str) -> JoinHandle<()> {
        match self.registry.register(user_id, connection_id) {
            Registration::Rebound { previous_user } => {
                tracing::debug!(connection_id, previous_user = %previous_user, user_id, "connection rebound");
                self.spawn_sync(previous_user);
            }
            Registration::Refreshed => {
                tracing::debug!(connection_id, user_id, "duplicate register");
            }
            Registration::Added => {}
        }
        self.spawn_sync(user_id.to_string())
    }

    /// A connection closed. Syncs the owner only if this was their last
    /// connection, after the offline grace period.
    pub fn on_disconnect(self: &Arc<Self>, connection_id: &str) -> Option<JoinHandle<()>> {
        let Some(user_id) = self.registry.unregister(connection_id) else {
            tracing::debug!(connection_id, "disconnect for unknown or unregistered connection");
            return None;
        };

        if self.registry.is_online(&user_id) {
            return None;
        }

        let engine = self.clone();
        let grace = self.config.offline_grace;
        Some(tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            engine.sync(&user_id).await;
        }))
    }

    /// A heartbeat on one connection. Refreshes `last_seen` and retries any
    /// failed write.
    pub fn on_heartbeat(self: &Arc<Self>, connection_id: &str) -> Option<JoinHandle<()>> {
        let Some(user_id) = self.registry.touch(connection_id) else {
            tracing::debug!(connection_id, "heartbeat from unregistered connection");
            return None;
        };
        Some(self.spawn_sync(user_id))
    }

    /// Client-requested status. `away` sticks until cleared or the user's
    /// last connection goes; `offline` cannot be requested.
    pub fn on_status_request(
        self: &Arc<Self>,
        user_id: &str,
        requested: PresenceStatus,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            {
                let slot = engine.slot(&user_id);
                let mut slot = slot.lock().await;
                slot.manual_away = requested == PresenceStatus::Away;
            }
            engine.sync(&user_id).await;
        })
    }

    /// External trigger: re-derive and re-broadcast if needed.
    pub fn refresh(self: &Arc<Self>, user_id: &str) -> JoinHandle<()> {
        self.spawn_sync(user_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use tokio::sync::{mpsc, Notify};

    use super::*;
    use crate::db::memory::InMemoryStore;
    use crate::db::store::StoreError;
    use crate::gateway::events::Dispatch;
    use crate::models::notification::Notification;
    use crate::models::push_subscription::{PushSubscription, SubscriptionKeys};
    use crate::models::user_status::UserStatus;

    fn test_config() -> PresenceConfig {
        PresenceConfig {
            offline_grace: Duration::ZERO,
            ..PresenceConfig::default()
        }
    }

    fn engine_over(store: Arc<dyn Store>) -> Arc<PresenceEngine> {
        let registry = Arc::new(ConnectionRegistry::new());
        Arc::new(PresenceEngine::new(
            registry,
            store,
            test_config(),
            Duration::from_secs(1),
        ))
    }

    async fn persisted(store: &InMemoryStore, user: &str) -> Option<PresenceStatus> {
        store.get_status(user).await.unwrap().map(|s| s.status)
    }

    /// Wraps a store and adds per-call behaviour to `upsert_status`.
    struct HookedStore {
        inner: Arc<InMemoryStore>,
        /// Offline writes wait here until notified.
        offline_gate: Option<Arc<Notify>>,
        /// Random delay before each status write, in microseconds.
        jitter_us: u64,
    }

    #[async_trait]
    impl Store for HookedStore {
        async fn friend_ids_of(&self, user_id: &str) -> Result<HashSet<String>, StoreError> {
            self.inner.friend_ids_of(user_id).await
        }
        async fn upsert_status(
            &self,
            user_id: &str,
            status: PresenceStatus,
            last_seen: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if status == PresenceStatus::Offline {
                if let Some(gate) = &self.offline_gate {
                    gate.notified().await;
                }
            }
            if self.jitter_us > 0 {
                let us = rand::thread_rng().gen_range(0..self.jitter_us);
                tokio::time::sleep(Duration::from_micros(us)).await;
            }
            self.inner.upsert_status(user_id, status, last_seen).await
        }
        async fn get_status(&self, user_id: &str) -> Result<Option<UserStatus>, StoreError> {
            self.inner.get_status(user_id).await
        }
        async fn insert_notification(&self, n: &Notification) -> Result<Notification, StoreError> {
            self.inner.insert_notification(n).await
        }
        async fn list_notifications(
            &self,
            user_id: &str,
            before: Option<i64>,
            limit: i64,
        ) -> Result<Vec<Notification>, StoreError> {
            self.inner.list_notifications(user_id, before, limit).await
        }
        async fn unread_count(&self, user_id: &str) -> Result<i64, StoreError> {
            self.inner.unread_count(user_id).await
        }
        async fn mark_read(&self, user_id: &str, id: i64) -> Result<Option<Notification>, StoreError> {
            self.inner.mark_read(user_id, id).await
        }
        async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
            self.inner.mark_all_read(user_id).await
        }
        async fn delete_notification(&self, user_id: &str, id: i64) -> Result<bool, StoreError> {
            self.inner.delete_notification(user_id, id).await
        }
        async fn list_push_endpoints(
            &self,
            user_id: &str,
        ) -> Result<Vec<PushSubscription>, StoreError> {
            self.inner.list_push_endpoints(user_id).await
        }
        async fn upsert_push_subscription(
            &self,
            user_id: &str,
            endpoint: &str,
            keys: &SubscriptionKeys,
        ) -> Result<(), StoreError> {
            self.inner.upsert_push_subscription(user_id, endpoint, keys).await
        }
        async fn delete_push_subscription(&self, endpoint: &str) -> Result<bool, StoreError> {
            self.inner.delete_push_subscription(endpoint).await
        }
        async fn delete_user_push_subscription(
            &self,
            user_id: &str,
            endpoint: &str,
        ) -> Result<bool, StoreError> {
            self.inner.delete_user_push_subscription(user_id, endpoint).await
        }
    }

    #[tokio::test]
    async fn announced_status_holds_through_offline_grace() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let config = PresenceConfig {
            offline_grace: Duration::from_millis(200),
            ..PresenceConfig::default()
        };
        let engine = Arc::new(PresenceEngine::new(
            registry,
            store.clone(),
            config,
            Duration::from_secs(1),
        ));
        assert_eq!(engine.announced("u").await, PresenceStatus::Offline);

        engine.on_register("c1", "u").await.unwrap();
        assert_eq!(engine.announced("u").await, PresenceStatus::Online);

        let pending = engine.on_disconnect("c1").unwrap();
        assert!(!engine.registry().is_online("u"));
        assert_eq!(engine.announced("u").await, PresenceStatus::Online);

        pending.await.unwrap();
        assert_eq!(engine.announced("u").await, PresenceStatus::Offline);
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Offline));
    }

    #[tokio::test]
    async fn two_devices_then_one_disconnect_stays_online() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_over(store.clone());

        engine.on_register("c1", "u").await.unwrap();
        engine.on_register("c2", "u").await.unwrap();
        // Not the last connection: no status write is scheduled.
        assert!(engine.on_disconnect("c1").is_none());

        assert!(engine.registry().is_online("u"));
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Online));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_disconnect_write_cannot_override_reconnect() {
        let inner = Arc::new(InMemoryStore::new());
        let gate = Arc::new(Notify::new());
        let store = Arc::new(HookedStore {
            inner: inner.clone(),
            offline_gate: Some(gate.clone()),
            jitter_us: 0,
        });
        let engine = engine_over(store);

        engine.on_register("c1", "u").await.unwrap();

        // The disconnect's write stalls at the store.
        let disconnect = engine.on_disconnect("c1").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A new device connects while that write is still in flight.
        let connect = engine.on_register("c2", "u");
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.notify_one();
        disconnect.await.unwrap();
        connect.await.unwrap();

        assert!(engine.registry().is_online("u"));
        assert_eq!(persisted(&inner, "u").await, Some(PresenceStatus::Online));
        assert_eq!(inner.status_log("u").last(), Some(&PresenceStatus::Online));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_converges_for_any_interleaving() {
        let mut rng = StdRng::seed_from_u64(42);

        for round in 0..40 {
            let inner = Arc::new(InMemoryStore::new());
            let store = Arc::new(HookedStore {
                inner: inner.clone(),
                offline_gate: None,
                jitter_us: 2_000,
            });
            let engine = engine_over(store);

            // Each connection appears once as connect and once (maybe) as disconnect.
            let mut ops: Vec<(bool, String)> = Vec::new();
            let conns = rng.gen_range(1..6);
            for c in 0..conns {
                ops.push((true, format!("c{c}")));
                if rng.gen_bool(0.7) {
                    ops.push((false, format!("c{c}")));
                }
            }
            ops.shuffle(&mut rng);

            let mut handles = Vec::new();
            for (is_connect, conn) in ops {
                if is_connect {
                    handles.push(engine.on_register(&conn, "u"));
                } else if let Some(h) = engine.on_disconnect(&conn) {
                    handles.push(h);
                }
                if rng.gen_bool(0.5) {
                    tokio::task::yield_now().await;
                }
            }
            for h in handles {
                h.await.unwrap();
            }

            let online = engine.registry().is_online("u");
            let status = persisted(&inner, "u").await;
            let expected = if online {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            };
            assert_eq!(
                status,
                Some(expected),
                "round {round}: persisted {status:?}, online {online}"
            );
        }
    }

    #[tokio::test]
    async fn failed_write_is_retried_on_next_heartbeat() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_over(store.clone());

        store.set_fail_status_writes(true);
        engine.on_register("c1", "u").await.unwrap();
        assert_eq!(persisted(&store, "u").await, None);
        assert_eq!(engine.dirty_users(), vec!["u".to_string()]);

        store.set_fail_status_writes(false);
        engine.on_heartbeat("c1").unwrap().await.unwrap();
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Online));
        assert!(engine.dirty_users().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_from_unregistered_connection_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_over(store.clone());
        engine.registry().connect("c1", None);

        assert!(engine.on_heartbeat("c1").is_none());
        assert!(engine.on_disconnect("c1").is_none());
        assert!(engine.on_disconnect("never-seen").is_none());
        assert!(store.status_log("u").is_empty());
    }

    #[tokio::test]
    async fn idle_connection_derives_away() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_over(store.clone());

        engine.on_register("c1", "u").await.unwrap();
        engine
            .registry()
            .backdate_heartbeat("c1", Duration::from_secs(301));
        assert!(engine.needs_resync("u").await);

        assert_eq!(engine.sync("u").await, PresenceStatus::Away);
        assert!(!engine.needs_resync("u").await);

        engine.on_heartbeat("c1").unwrap().await.unwrap();
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Online));
    }

    #[tokio::test]
    async fn manual_away_is_broadcast_once_and_cleared_on_offline() {
        let store = Arc::new(InMemoryStore::new());
        store.add_friendship("u", "f");
        let engine = engine_over(store.clone());

        let (tx, mut friend_rx) = mpsc::channel(16);
        engine.registry().connect("f1", Some(tx));
        engine.on_register("f1", "f").await.unwrap();

        engine.on_register("u1", "u").await.unwrap();
        engine
            .on_status_request("u", PresenceStatus::Away)
            .await
            .unwrap();
        // A heartbeat does not undo a manual away.
        engine.on_heartbeat("u1").unwrap().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(d) = friend_rx.try_recv() {
            seen.push(d);
        }
        assert_eq!(
            seen,
            vec![
                Dispatch::presence("u", PresenceStatus::Online),
                Dispatch::presence("u", PresenceStatus::Away),
            ]
        );

        engine.on_disconnect("u1").unwrap().await.unwrap();
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Offline));

        engine.on_register("u2", "u").await.unwrap();
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Online));
    }

    #[tokio::test]
    async fn reconnect_within_grace_writes_no_offline() {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(PresenceEngine::new(
            Arc::new(ConnectionRegistry::new()),
            store.clone(),
            PresenceConfig {
                offline_grace: Duration::from_millis(50),
                ..PresenceConfig::default()
            },
            Duration::from_secs(1),
        ));

        engine.on_register("c1", "u").await.unwrap();
        let pending = engine.on_disconnect("c1").unwrap();
        engine.on_register("c2", "u").await.unwrap();
        pending.await.unwrap();

        assert!(!store.status_log("u").contains(&PresenceStatus::Offline));
        assert_eq!(persisted(&store, "u").await, Some(PresenceStatus::Online));
    }

    #[tokio::test]
    async fn idle_offline_slots_are_pruned() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_over(store.clone());

        engine.on_register("c1", "u").await.unwrap();
        engine.on_register("c2", "v").await.unwrap();
        engine.on_disconnect("c1").unwrap().await.unwrap();

        assert_eq!(engine.prune_idle_slots(), 1);
        assert_eq!(engine.slots.len(), 1);
        assert!(engine.slots.contains_key("v"));
    }
}
