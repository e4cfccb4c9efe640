//! Entry point for everything that changes presence or asks for delivery.
//!
//! The transport layer and the internal HTTP triggers describe what happened
//! as a [`RelayEvent`]; [`Relay::handle`] routes it to the owning component.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::store::StoreError;
use crate::gateway::events::Dispatch;
use crate::gateway::presence::PresenceEngine;
use crate::gateway::registry::ConnectionRegistry;
use crate::models::notification::{NewNotification, Notification};
use crate::models::user_status::PresenceStatus;
use crate::notifications::{DeliveryReport, NotificationDispatcher};

/// Lifecycle and domain triggers.
#[derive(Debug)]
pub enum RelayEvent {
    /// Socket accepted, not yet authenticated.
    Connected {
        connection_id: String,
        sender: Option<mpsc::Sender<Dispatch>>,
    },
    Registered {
        connection_id: String,
        user_id: String,
    },
    Disconnected {
        connection_id: String,
    },
    Heartbeat {
        connection_id: String,
    },
    /// Client asked to show as `online` or `away`.
    PresenceUpdate {
        user_id: String,
        status: PresenceStatus,
    },
    /// Something outside the gateway changed what friends should see.
    PresenceRefresh {
        user_id: String,
    },
    DomainEvent(NewNotification),
}

/// Result of handling one event.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Nothing to wait for.
    Done,
    /// A status sync was scheduled.
    Scheduled(JoinHandle<()>),
    /// The notification is stored; `delivery` runs in the background.
    Notified {
        notification: Notification,
        delivery: JoinHandle<DeliveryReport>,
    },
}

impl RelayOutcome {
    /// Wait for any scheduled work. Used by tests and shutdown.
    pub async fn settle(self) {
        match self {
            RelayOutcome::Done => {}
            RelayOutcome::Scheduled(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "presence task failed");
                }
            }
            RelayOutcome::Notified { delivery, .. } => {
                if let Err(e) = delivery.await {
                    tracing::warn!(error = %e, "delivery task failed");
                }
            }
        }
    }
}

pub struct Relay {
    presence: Arc<PresenceEngine>,
    notifications: Arc<NotificationDispatcher>,
}

impl Relay {
    pub fn new(presence: Arc<PresenceEngine>, notifications: Arc<NotificationDispatcher>) -> Self {
        Self {
            presence,
            notifications,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.presence.registry()
    }

    pub fn presence(&self) -> &Arc<PresenceEngine> {
        &self.presence
    }

    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.notifications
    }

    /// Presence events never fail; only a domain event whose notification
    /// could not be persisted returns an error.
    pub async fn handle(&self, event: RelayEvent) -> Result<RelayOutcome, StoreError> {
        let outcome = match event {
            RelayEvent::Connected {
                connection_id,
                sender,
            } => {
                tracing::debug!(connection_id = %connection_id, "connection opened");
                self.registry().connect(&connection_id, sender);
                RelayOutcome::Done
            }
            RelayEvent::Registered {
                connection_id,
                user_id,
            } => RelayOutcome::Scheduled(self.presence.on_register(&connection_id, &user_id)),
            RelayEvent::Disconnected { connection_id } => {
                match self.presence.on_disconnect(&connection_id) {
                    Some(handle) => RelayOutcome::Scheduled(handle),
                    None => RelayOutcome::Done,
                }
            }
            RelayEvent::Heartbeat { connection_id } => {
                match self.presence.on_heartbeat(&connection_id) {
                    Some(handle) => RelayOutcome::Scheduled(handle),
                    None => RelayOutcome::Done,
                }
            }
            RelayEvent::PresenceUpdate { user_id, status } => {
                RelayOutcome::Scheduled(self.presence.on_status_request(&user_id, status))
            }
            RelayEvent::PresenceRefresh { user_id } => {
                RelayOutcome::Scheduled(self.presence.refresh(&user_id))
            }
            RelayEvent::DomainEvent(event) => {
                let (notification, delivery) = self.notifications.accept(event).await?;
                RelayOutcome::Notified {
                    notification,
                    delivery,
                }
            }
        };
        Ok(outcome)
    }
}
