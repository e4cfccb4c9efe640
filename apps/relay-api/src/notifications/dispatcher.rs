//! Persists notifications and delivers them over the gateway and Web Push.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use circle_common::SnowflakeGenerator;
use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::db::store::{with_timeout, Store, StoreError};
use crate::gateway::events::Dispatch;
use crate::gateway::registry::ConnectionRegistry;
use crate::models::notification::{NewNotification, Notification};

use super::push::{send_with_timeout, PushOutcome, PushService};

/// What happened to one notification after it was persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Live connections the event was queued on.
    pub realtime: usize,
    pub pushed: usize,
    /// Endpoints the push service reported gone, now unsubscribed.
    pub removed: usize,
    pub push_failed: usize,
}

pub struct NotificationDispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn Store>,
    push: Arc<dyn PushService>,
    snowflake: Arc<SnowflakeGenerator>,
    store_timeout: Duration,
    push_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn Store>,
        push: Arc<dyn PushService>,
        snowflake: Arc<SnowflakeGenerator>,
        store_timeout: Duration,
        push_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            push,
            snowflake,
            store_timeout,
            push_timeout,
        }
    }

    /// Persist one row for `event` and return as soon as it is durable.
    /// Delivery continues on a background task. Only a failed insert is an
    /// error; delivery problems are logged and reported by the task.
    pub async fn accept(
        self: &Arc<Self>,
        event: NewNotification,
    ) -> Result<(Notification, JoinHandle<DeliveryReport>), StoreError> {
        let stored = self.persist_event(event).await?;
        let dispatcher = self.clone();
        let notification = stored.clone();
        let delivery = tokio::spawn(async move { dispatcher.deliver_logged(&notification).await });
        Ok((stored, delivery))
    }

    async fn persist_event(&self, event: NewNotification) -> Result<Notification, StoreError> {
        let notification = event.into_notification(self.snowflake.generate(), Utc::now());
        let stored = self.persist(&notification).await?;
        if stored.id != notification.id {
            tracing::debug!(
                notification_id = stored.id,
                event_id = ?stored.event_id,
                "event already stored, delivering existing row"
            );
        }
        Ok(stored)
    }

    /// Insert is idempotent on id and on `event_id`, so retrying an accept
    /// never adds a row.
    async fn persist(&self, notification: &Notification) -> Result<Notification, StoreError> {
        with_timeout(self.store_timeout, self.store.insert_notification(notification))
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %notification.user_id,
                    notification_id = notification.id,
                    error = %e,
                    "failed to persist notification"
                );
                e
            })
    }

    async fn deliver_logged(&self, notification: &Notification) -> DeliveryReport {
        let report = self.deliver(notification).await;
        tracing::info!(
            notification_id = notification.id,
            user_id = %notification.user_id,
            kind = %notification.type_,
            realtime = report.realtime,
            pushed = report.pushed,
            removed = report.removed,
            push_failed = report.push_failed,
            "notification dispatched"
        );
        report
    }

    /// Real-time delivery to every live connection plus push to every
    /// endpoint. Push does not depend on whether the user is online: other
    /// devices may have no live connection.
    pub async fn deliver(&self, notification: &Notification) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        if self.registry.is_online(&notification.user_id) {
            for connection_id in self.registry.connections_of(&notification.user_id) {
                if self
                    .registry
                    .emit(&connection_id, Dispatch::notification(notification))
                {
                    report.realtime += 1;
                }
            }
        }

        if !self.push.is_enabled() {
            return report;
        }

        let subscriptions = match with_timeout(
            self.store_timeout,
            self.store.list_push_endpoints(&notification.user_id),
        )
        .await
        {
            Ok(subs) => subs,
            Err(e) => {
                tracing::warn!(user_id = %notification.user_id, error = %e, "failed to load push endpoints");
                return report;
            }
        };

        let attempts = subscriptions.iter().map(|sub| async move {
            let outcome =
                send_with_timeout(self.push.as_ref(), sub, notification, self.push_timeout).await;
            (sub, outcome)
        });

        for (sub, outcome) in join_all(attempts).await {
            match outcome {
                PushOutcome::Delivered => report.pushed += 1,
                PushOutcome::TransientFailure => {
                    tracing::warn!(endpoint = %sub.endpoint, user_id = %sub.user_id, "push delivery failed");
                    report.push_failed += 1;
                }
                PushOutcome::PermanentlyFailed => {
                    match with_timeout(
                        self.store_timeout,
                        self.store.delete_push_subscription(&sub.endpoint),
                    )
                    .await
                    {
                        Ok(_) => {
                            tracing::info!(endpoint = %sub.endpoint, user_id = %sub.user_id, "push endpoint gone, unsubscribed");
                            report.removed += 1;
                        }
                        Err(e) => {
                            tracing::warn!(endpoint = %sub.endpoint, error = %e, "failed to remove dead push endpoint");
                            report.push_failed += 1;
                        }
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::memory::InMemoryStore;
    use crate::gateway::events::EventName;
    use crate::models::notification::NotificationType;
    use crate::models::push_subscription::{PushSubscription, SubscriptionKeys};

    /// Push service with a scripted outcome per endpoint.
    #[derive(Default)]
    struct ScriptedPush {
        outcomes: HashMap<String, PushOutcome>,
        hang: HashSet<String>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushService for ScriptedPush {
        async fn send(&self, sub: &PushSubscription, _: &Notification) -> PushOutcome {
            if self.hang.contains(&sub.endpoint) {
                std::future::pending::<()>().await;
            }
            self.sent.lock().push(sub.endpoint.clone());
            self.outcomes
                .get(&sub.endpoint)
                .copied()
                .unwrap_or(PushOutcome::Delivered)
        }
    }

    fn keys() -> SubscriptionKeys {
        SubscriptionKeys {
            p256dh: "p256dh".into(),
            auth: "auth".into(),
        }
    }

    fn event(user: &str) -> NewNotification {
        NewNotification {
            user_id: user.into(),
            kind: NotificationType::FriendRequest,
            title: "New friend request".into(),
            message: "Ada wants to be friends".into(),
            actor_id: Some("usr_ada".into()),
            related_id: None,
            related_type: None,
            action_url: Some("/friends".into()),
            event_id: None,
        }
    }

    fn dispatcher(
        registry: Arc<ConnectionRegistry>,
        store: Arc<InMemoryStore>,
        push: Arc<ScriptedPush>,
    ) -> Arc<NotificationDispatcher> {
        Arc::new(NotificationDispatcher::new(
            registry,
            store,
            push,
            Arc::new(SnowflakeGenerator::new(1)),
            Duration::from_secs(1),
            Duration::from_millis(100),
        ))
    }

    /// Accept and wait for delivery to finish.
    async fn dispatch(
        d: &Arc<NotificationDispatcher>,
        event: NewNotification,
    ) -> Result<Notification, StoreError> {
        let (stored, delivery) = d.accept(event).await?;
        delivery.await.expect("delivery task");
        Ok(stored)
    }

    #[tokio::test]
    async fn offline_recipient_with_one_dead_endpoint() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_push_subscription("r", "https://push.test/good", &keys()).await.unwrap();
        store.upsert_push_subscription("r", "https://push.test/gone", &keys()).await.unwrap();
        let push = Arc::new(ScriptedPush {
            outcomes: HashMap::from([(
                "https://push.test/gone".to_string(),
                PushOutcome::PermanentlyFailed,
            )]),
            ..Default::default()
        });
        let d = dispatcher(Arc::new(ConnectionRegistry::new()), store.clone(), push.clone());

        let n = dispatch(&d, event("r")).await.unwrap();

        assert_eq!(store.notification_count("r"), 1);
        let remaining = store.list_push_endpoints("r").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].endpoint, "https://push.test/good");
        assert!(push.sent.lock().contains(&"https://push.test/good".to_string()));

        // Discoverable through the read path right away.
        let listed = store.list_notifications("r", None, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, n.id);
    }

    #[tokio::test]
    async fn online_recipient_gets_realtime_and_push() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        registry.connect("c1", Some(tx));
        registry.register("r", "c1");

        let store = Arc::new(InMemoryStore::new());
        store.upsert_push_subscription("r", "https://push.test/phone", &keys()).await.unwrap();
        let push = Arc::new(ScriptedPush::default());
        let d = dispatcher(registry, store.clone(), push.clone());

        let n = dispatch(&d, event("r")).await.unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event_name, EventName::NOTIFICATION_CREATE);
        assert_eq!(frame.data["notification"]["id"], n.id.to_string());
        assert_eq!(frame.data["notification"]["type"], "friend_request");
        assert_eq!(*push.sent.lock(), vec!["https://push.test/phone".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_push_and_dead_connection_still_persist_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(1);
        registry.connect("c1", Some(tx));
        registry.register("r", "c1");
        drop(rx);

        let store = Arc::new(InMemoryStore::new());
        store.upsert_push_subscription("r", "https://push.test/slow", &keys()).await.unwrap();
        store.upsert_push_subscription("r", "https://push.test/down", &keys()).await.unwrap();
        let push = Arc::new(ScriptedPush {
            outcomes: HashMap::from([(
                "https://push.test/down".to_string(),
                PushOutcome::TransientFailure,
            )]),
            hang: HashSet::from(["https://push.test/slow".to_string()]),
            ..Default::default()
        });
        let d = dispatcher(registry, store.clone(), push);

        let n = dispatch(&d, event("r")).await.unwrap();
        let report = d.deliver(&n).await;

        assert_eq!(report.realtime, 0);
        assert_eq!(report.push_failed, 2);
        assert_eq!(store.notification_count("r"), 1);
        // Transient failures keep the subscriptions.
        assert_eq!(store.list_push_endpoints("r").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persisting_the_same_notification_twice_keeps_one_row() {
        let store = Arc::new(InMemoryStore::new());
        let d = dispatcher(
            Arc::new(ConnectionRegistry::new()),
            store.clone(),
            Arc::new(ScriptedPush::default()),
        );
        let n = dispatch(&d, event("r")).await.unwrap();
        let again = d.persist(&n).await.unwrap();
        assert_eq!(again.id, n.id);
        assert_eq!(store.notification_count("r"), 1);
    }

    #[tokio::test]
    async fn dead_endpoint_of_one_recipient_does_not_affect_another() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_push_subscription("a", "https://push.test/a-gone", &keys()).await.unwrap();
        store.upsert_push_subscription("b", "https://push.test/b", &keys()).await.unwrap();
        let push = Arc::new(ScriptedPush {
            outcomes: HashMap::from([(
                "https://push.test/a-gone".to_string(),
                PushOutcome::PermanentlyFailed,
            )]),
            ..Default::default()
        });
        let d = dispatcher(Arc::new(ConnectionRegistry::new()), store.clone(), push.clone());

        dispatch(&d, event("a")).await.unwrap();
        dispatch(&d, event("b")).await.unwrap();

        assert!(store.list_push_endpoints("a").await.unwrap().is_empty());
        assert_eq!(store.list_push_endpoints("b").await.unwrap().len(), 1);
        assert!(push.sent.lock().contains(&"https://push.test/b".to_string()));
    }

    #[tokio::test]
    async fn retry_after_slow_ack_keeps_one_row_per_event() {
        let store = Arc::new(InMemoryStore::new());
        store.set_insert_ack_delay(Some(Duration::from_millis(200)));
        let d = Arc::new(NotificationDispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            store.clone(),
            Arc::new(ScriptedPush::default()),
            Arc::new(SnowflakeGenerator::new(1)),
            Duration::from_millis(50),
            Duration::from_millis(100),
        ));
        let mut original = event("r");
        original.event_id = Some("friendship_7:requested".into());

        // The row lands but the caller only sees the timeout, twice.
        for _ in 0..2 {
            assert!(matches!(
                dispatch(&d, original.clone()).await,
                Err(StoreError::Timeout(_))
            ));
            assert_eq!(store.notification_count("r"), 1);
        }

        store.set_insert_ack_delay(None);
        let stored = dispatch(&d, original).await.unwrap();
        assert_eq!(stored.event_id.as_deref(), Some("friendship_7:requested"));
        assert_eq!(store.notification_count("r"), 1);
    }

    #[tokio::test]
    async fn accept_returns_before_push_finishes() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_push_subscription("r", "https://push.test/slow", &keys()).await.unwrap();
        let push = Arc::new(ScriptedPush {
            hang: HashSet::from(["https://push.test/slow".to_string()]),
            ..Default::default()
        });
        let d = Arc::new(NotificationDispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            store.clone(),
            push,
            Arc::new(SnowflakeGenerator::new(1)),
            Duration::from_secs(1),
            Duration::from_millis(300),
        ));

        let started = std::time::Instant::now();
        let (n, delivery) = d.accept(event("r")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(store.list_notifications("r", None, 10).await.unwrap()[0].id, n.id);

        let report = delivery.await.unwrap();
        assert_eq!(report.push_failed, 1);
    }
}
