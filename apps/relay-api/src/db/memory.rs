//! In-process [`Store`] used by tests and by local runs without Postgres.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::store::{Store, StoreError};
use crate::models::notification::Notification;
use crate::models::push_subscription::{PushSubscription, SubscriptionKeys};
use crate::models::user_status::{PresenceStatus, UserStatus};

#[derive(Default)]
struct Inner {
    /// Accepted friendship edges as stored, possibly in both directions.
    friendships: Vec<(String, String)>,
    statuses: HashMap<String, UserStatus>,
    /// Every status write in completion order, per user.
    status_log: HashMap<String, Vec<PresenceStatus>>,
    notifications: BTreeMap<i64, Notification>,
    /// `event_id` -> notification id.
    notification_events: HashMap<String, i64>,
    push: HashMap<String, PushSubscription>,
}

impl Inner {
    fn insert_notification(&mut self, notification: &Notification) -> Notification {
        let existing = notification
            .event_id
            .as_ref()
            .and_then(|key| self.notification_events.get(key))
            .and_then(|id| self.notifications.get(id));
        if let Some(existing) = existing {
            return existing.clone();
        }

        let stored = self
            .notifications
            .entry(notification.id)
            .or_insert_with(|| notification.clone())
            .clone();
        if let Some(key) = &stored.event_id {
            self.notification_events.insert(key.clone(), stored.id);
        }
        stored
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    fail_status_writes: AtomicBool,
    insert_ack_delay: Mutex<Option<Duration>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a single accepted edge `user_id -> friend_id`.
    pub fn add_friendship(&self, user_id: &str, friend_id: &str) {
        self.inner
            .lock()
            .friendships
            .push((user_id.to_string(), friend_id.to_string()));
    }

    /// Makes every subsequent `upsert_status` fail until switched off again.
    pub fn set_fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    /// Notification inserts land immediately but only return after `delay`,
    /// like a commit whose acknowledgement is slow.
    pub fn set_insert_ack_delay(&self, delay: Option<Duration>) {
        *self.insert_ack_delay.lock() = delay;
    }

    /// Status values written for `user_id`, oldest first.
    pub fn status_log(&self, user_id: &str) -> Vec<PresenceStatus> {
        self.inner
            .lock()
            .status_log
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn notification_count(&self, user_id: &str) -> usize {
        self.inner
            .lock()
            .notifications
            .values()
            .filter(|n| n.user_id == user_id)
            .count()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn friend_ids_of(&self, user_id: &str) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock();
        let mut ids: HashSet<String> = inner
            .friendships
            .iter()
            .filter_map(|(a, b)| {
                if a == user_id {
                    Some(b.clone())
                } else if b == user_id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        ids.remove(user_id);
        Ok(ids)
    }

    async fn upsert_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Pool("injected failure".to_string()));
        }

        let mut inner = self.inner.lock();
        inner.statuses.insert(
            user_id.to_string(),
            UserStatus {
                user_id: user_id.to_string(),
                status,
                last_seen,
                updated_at: Utc::now(),
            },
        );
        inner
            .status_log
            .entry(user_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn get_status(&self, user_id: &str) -> Result<Option<UserStatus>, StoreError> {
        Ok(self.inner.lock().statuses.get(user_id).cloned())
    }

    async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, StoreError> {
        let stored = self.inner.lock().insert_notification(notification);
        let delay = *self.insert_ack_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(stored)
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let inner = self.inner.lock();
        let upper = before.unwrap_or(i64::MAX);
        Ok(inner
            .notifications
            .range(..upper)
            .rev()
            .map(|(_, n)| n)
            .filter(|n| n.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn mark_read(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<Option<Notification>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(n) = inner
            .notifications
            .get_mut(&notification_id)
            .filter(|n| n.user_id == user_id)
        else {
            return Ok(None);
        };
        if !n.is_read {
            n.is_read = true;
            n.read_at = Some(Utc::now());
        }
        Ok(Some(n.clone()))
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut updated = 0;
        for n in inner
            .notifications
            .values_mut()
            .filter(|n| n.user_id == user_id && !n.is_read)
        {
            n.is_read = true;
            n.read_at = Some(now);
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_notification(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let owned = inner
            .notifications
            .get(&notification_id)
            .is_some_and(|n| n.user_id == user_id);
        if owned {
            if let Some(removed) = inner.notifications.remove(&notification_id) {
                if let Some(key) = removed.event_id {
                    inner.notification_events.remove(&key);
                }
            }
        }
        Ok(owned)
    }

    async fn list_push_endpoints(
        &self,
        user_id: &str,
    ) -> Result<Vec<PushSubscription>, StoreError> {
        let inner = self.inner.lock();
        let mut subs: Vec<PushSubscription> = inner
            .push
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.endpoint.cmp(&b.endpoint)));
        Ok(subs)
    }

    async fn upsert_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        keys: &SubscriptionKeys,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner
            .push
            .entry(endpoint.to_string())
            .and_modify(|s| {
                s.user_id = user_id.to_string();
                s.p256dh = keys.p256dh.clone();
                s.auth = keys.auth.clone();
                s.updated_at = now;
            })
            .or_insert_with(|| PushSubscription {
                endpoint: endpoint.to_string(),
                user_id: user_id.to_string(),
                p256dh: keys.p256dh.clone(),
                auth: keys.auth.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().push.remove(endpoint).is_some())
    }

    async fn delete_user_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let owned = inner
            .push
            .get(endpoint)
            .is_some_and(|s| s.user_id == user_id);
        if owned {
            inner.push.remove(endpoint);
        }
        Ok(owned)
    }
}
