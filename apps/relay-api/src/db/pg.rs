//! Postgres implementation of [`Store`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::OptionalExtension;

use super::pool::DbPool;
use super::schema::{friendships, notifications, push_subscriptions, user_status};
use super::store::{Store, StoreError};
use crate::models::notification::{Notification, NotificationRow};
use crate::models::push_subscription::{NewPushSubscription, PushSubscription, SubscriptionKeys};
use crate::models::user_status::{PresenceStatus, UserStatus};

/// Friendship rows in this state count as an edge of the friend graph.
const FRIENDSHIP_ACCEPTED: &str = "accepted";

#[derive(Clone)]
pub struct PgStore {
    db: DbPool,
}

impl PgStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn friend_ids_of(&self, user_id: &str) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.db.get().await?;

        // Edges may be stored in either direction (or both); read both and collapse.
        let outgoing: Vec<String> = diesel_async::RunQueryDsl::load(
            friendships::table
                .filter(friendships::user_id.eq(user_id))
                .filter(friendships::status.eq(FRIENDSHIP_ACCEPTED))
                .select(friendships::friend_id),
            &mut conn,
        )
        .await?;

        let incoming: Vec<String> = diesel_async::RunQueryDsl::load(
            friendships::table
                .filter(friendships::friend_id.eq(user_id))
                .filter(friendships::status.eq(FRIENDSHIP_ACCEPTED))
                .select(friendships::user_id),
            &mut conn,
        )
        .await?;

        let mut ids: HashSet<String> = outgoing.into_iter().chain(incoming).collect();
        ids.remove(user_id);
        Ok(ids)
    }

    async fn upsert_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.db.get().await?;
        let now = Utc::now();

        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(user_status::table)
                .values((
                    user_status::user_id.eq(user_id),
                    user_status::status.eq(status.as_str()),
                    user_status::last_seen.eq(last_seen),
                    user_status::updated_at.eq(now),
                ))
                .on_conflict(user_status::user_id)
                .do_update()
                .set((
                    user_status::status.eq(status.as_str()),
                    user_status::last_seen.eq(last_seen),
                    user_status::updated_at.eq(now),
                )),
            &mut conn,
        )
        .await?;

        Ok(())
    }

    async fn get_status(&self, user_id: &str) -> Result<Option<UserStatus>, StoreError> {
        let mut conn = self.db.get().await?;

        let row: Option<(String, String, DateTime<Utc>, DateTime<Utc>)> =
            diesel_async::RunQueryDsl::get_result(
                user_status::table.find(user_id).select((
                    user_status::user_id,
                    user_status::status,
                    user_status::last_seen,
                    user_status::updated_at,
                )),
                &mut conn,
            )
            .await
            .optional()?;

        row.map(|(user_id, status, last_seen, updated_at)| {
            let status = status
                .parse::<PresenceStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Ok(UserStatus {
                user_id,
                status,
                last_seen,
                updated_at,
            })
        })
        .transpose()
    }

    async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, StoreError> {
        let mut conn = self.db.get().await?;

        // A conflict on either the id or the event key keeps the first row.
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(notifications::table)
                .values(NotificationRow::from(notification))
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;

        let stored: Notification = match &notification.event_id {
            Some(key) => {
                diesel_async::RunQueryDsl::get_result(
                    notifications::table
                        .filter(notifications::event_id.eq(key))
                        .select(Notification::as_select()),
                    &mut conn,
                )
                .await?
            }
            None => {
                diesel_async::RunQueryDsl::get_result(
                    notifications::table
                        .find(notification.id)
                        .select(Notification::as_select()),
                    &mut conn,
                )
                .await?
            }
        };

        Ok(stored)
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut conn = self.db.get().await?;

        let mut query = notifications::table
            .filter(notifications::user_id.eq(user_id))
            .select(Notification::as_select())
            .into_boxed();

        if let Some(before) = before {
            query = query.filter(notifications::id.lt(before));
        }

        let rows: Vec<Notification> = diesel_async::RunQueryDsl::load(
            query.order(notifications::id.desc()).limit(limit),
            &mut conn,
        )
        .await?;

        Ok(rows)
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.db.get().await?;

        let count: i64 = diesel_async::RunQueryDsl::get_result(
            notifications::table
                .filter(notifications::user_id.eq(user_id))
                .filter(notifications::is_read.eq(false))
                .count(),
            &mut conn,
        )
        .await?;

        Ok(count)
    }

    async fn mark_read(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<Option<Notification>, StoreError> {
        let mut conn = self.db.get().await?;

        // Only unread rows are touched so `read_at` keeps the first read time.
        diesel_async::RunQueryDsl::execute(
            diesel::update(
                notifications::table
                    .filter(notifications::id.eq(notification_id))
                    .filter(notifications::user_id.eq(user_id))
                    .filter(notifications::is_read.eq(false)),
            )
            .set((
                notifications::is_read.eq(true),
                notifications::read_at.eq(Some(Utc::now())),
            )),
            &mut conn,
        )
        .await?;

        let row: Option<Notification> = diesel_async::RunQueryDsl::get_result(
            notifications::table
                .filter(notifications::id.eq(notification_id))
                .filter(notifications::user_id.eq(user_id))
                .select(Notification::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        Ok(row)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.db.get().await?;

        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                notifications::table
                    .filter(notifications::user_id.eq(user_id))
                    .filter(notifications::is_read.eq(false)),
            )
            .set((
                notifications::is_read.eq(true),
                notifications::read_at.eq(Some(Utc::now())),
            )),
            &mut conn,
        )
        .await?;

        Ok(updated)
    }

    async fn delete_notification(
        &self,
        user_id: &str,
        notification_id: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.db.get().await?;

        let deleted = diesel_async::RunQueryDsl::execute(
            diesel::delete(
                notifications::table
                    .filter(notifications::id.eq(notification_id))
                    .filter(notifications::user_id.eq(user_id)),
            ),
            &mut conn,
        )
        .await?;

        Ok(deleted > 0)
    }

    async fn list_push_endpoints(
        &self,
        user_id: &str,
    ) -> Result<Vec<PushSubscription>, StoreError> {
        let mut conn = self.db.get().await?;

        let rows: Vec<PushSubscription> = diesel_async::RunQueryDsl::load(
            push_subscriptions::table
                .filter(push_subscriptions::user_id.eq(user_id))
                .order(push_subscriptions::created_at.asc())
                .select(PushSubscription::as_select()),
            &mut conn,
        )
        .await?;

        Ok(rows)
    }

    async fn upsert_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        keys: &SubscriptionKeys,
    ) -> Result<(), StoreError> {
        let mut conn = self.db.get().await?;

        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(push_subscriptions::table)
                .values(NewPushSubscription {
                    endpoint,
                    user_id,
                    p256dh: &keys.p256dh,
                    auth: &keys.auth,
                })
                .on_conflict(push_subscriptions::endpoint)
                .do_update()
                .set((
                    push_subscriptions::user_id.eq(user_id),
                    push_subscriptions::p256dh.eq(&keys.p256dh),
                    push_subscriptions::auth.eq(&keys.auth),
                    push_subscriptions::updated_at.eq(Utc::now()),
                )),
            &mut conn,
        )
        .await?;

        Ok(())
    }

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<bool, StoreError> {
        let mut conn = self.db.get().await?;

        let deleted = diesel_async::RunQueryDsl::execute(
            diesel::delete(
                push_subscriptions::table.filter(push_subscriptions::endpoint.eq(endpoint)),
            ),
            &mut conn,
        )
        .await?;

        Ok(deleted > 0)
    }

    async fn delete_user_push_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.db.get().await?;

        let deleted = diesel_async::RunQueryDsl::execute(
            diesel::delete(
                push_subscriptions::table
                    .filter(push_subscriptions::endpoint.eq(endpoint))
                    .filter(push_subscriptions::user_id.eq(user_id)),
            ),
            &mut conn,
        )
        .await?;

        Ok(deleted > 0)
    }
}
