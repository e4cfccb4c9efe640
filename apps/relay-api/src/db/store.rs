//! The relational query surface the relay consumes.
//!
//! Profiles, friendships and the rest of the social graph belong to the CRUD
//! layer; the relay only reads friend ids and owns three small tables
//! (`user_status`, `notifications`, `push_subscriptions`).

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::notification::Notification;
use crate::models::push_subscription::{PushSubscription, SubscriptionKeys};
use crate::models::user_status::{PresenceStatus, UserStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Accepted friends of `user_id`, both storage directions collapsed.
    async fn friend_ids_of(&self, user_id: &str) -> Result<HashSet<String>, StoreError>;

    /// Idempotent upsert keyed by `user_id`.
    async fn upsert_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_status(&self, user_id: &str) -> Result<Option<UserStatus>, StoreError>;

    /// Inserts the row unless one with the same id or the same `event_id`
    /// already exists, and returns the stored row either way.
    async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, StoreError>;

    /// Newest first, optionally strictly older than `before`.
    async fn list_notifications(
        &self,
        user_id: &str,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError>;

    async fn unread_count(&self, user_id: &str) -> Result<i64, StoreError>;

    /// Returns `None` when the notification does not exist or is not owned by `user_id`.
    async fn mark_read(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<Option<Notification>, StoreError>;

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError>;

    async fn delete_notification(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<bool, StoreError>;

    async fn list_push_endpoints(&self, user_id: &str)
        -> Result<Vec<PushSubscription>, StoreError>;

    /// Upsert keyed by endpoint; an endpoint moving to another user is re-owned.
    async fn upsert_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        keys: &SubscriptionKeys,
    ) -> Result<(), StoreError>;

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<bool, StoreError>;

    async fn delete_user_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError>;
}

/// Bounds a store call so a slow database fails this call only.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
