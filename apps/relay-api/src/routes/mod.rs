pub mod health;
pub mod internal;
pub mod notifications;
pub mod presence;
pub mod push_subscriptions;
pub mod tickets;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest(
            "/api/v1",
            notifications::router()
                .merge(push_subscriptions::router())
                .merge(presence::router())
                .merge(tickets::router()),
        )
        .nest("/internal/v1", internal::router())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Notifications
        notifications::list_notifications,
        notifications::unread_count,
        notifications::mark_read,
        notifications::mark_all_read,
        notifications::delete_notification,
        // Push
        push_subscriptions::subscribe,
        push_subscriptions::unsubscribe,
        // Presence
        presence::get_presence,
        // Gateway
        tickets::create_ticket,
        // Internal
        internal::create_notification,
        internal::refresh_presence,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Models
            crate::models::notification::Notification,
            crate::models::notification::NewNotification,
            crate::models::notification::NotificationType,
            crate::models::push_subscription::SubscriptionKeys,
            crate::models::user_status::PresenceStatus,
            // Route request/response types
            health::HealthResponse,
            notifications::ListNotificationsResponse,
            notifications::UnreadCountResponse,
            notifications::MarkAllReadResponse,
            push_subscriptions::SubscribeRequest,
            push_subscriptions::SubscribeResponse,
            push_subscriptions::UnsubscribeRequest,
            presence::PresenceResponse,
            tickets::TicketResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Notifications", description = "Notification inbox"),
        (name = "Push", description = "Web Push subscriptions"),
        (name = "Presence", description = "User presence"),
        (name = "Gateway", description = "Real-time gateway"),
        (name = "Internal", description = "Service-to-service triggers"),
    )
)]
pub struct ApiDoc;
