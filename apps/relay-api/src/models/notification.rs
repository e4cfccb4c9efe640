use std::fmt;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::schema::notifications;

/// Kinds of domain events that produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Message,
    FriendRequest,
    FriendAccepted,
    GroupInvite,
    GroupActivity,
    PostLike,
    PostComment,
    Mention,
    System,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::FriendRequest => "friend_request",
            Self::FriendAccepted => "friend_accepted",
            Self::GroupInvite => "group_invite",
            Self::GroupActivity => "group_activity",
            Self::PostLike => "post_like",
            Self::PostComment => "post_comment",
            Self::Mention => "mention",
            Self::System => "system",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = notifications)]
pub struct Notification {
    #[serde(serialize_with = "super::serialize_i64_as_string")]
    #[schema(value_type = String)]
    pub id: i64,
    pub user_id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub message: String,
    pub actor_id: Option<String>,
    pub related_id: Option<String>,
    pub related_type: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub action_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// A domain event asking for one notification to be created and delivered.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct NewNotification {
    /// Recipient.
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub related_id: Option<String>,
    #[serde(default)]
    pub related_type: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    /// Caller-chosen key for the logical event. Retries carrying the same key
    /// resolve to the row the first attempt stored.
    #[serde(default)]
    pub event_id: Option<String>,
}

impl NewNotification {
    /// Builds the persisted row for this event.
    pub fn into_notification(self, id: i64, created_at: DateTime<Utc>) -> Notification {
        Notification {
            id,
            user_id: self.user_id,
            type_: self.kind.as_str().to_string(),
            title: self.title,
            message: self.message,
            actor_id: self.actor_id,
            related_id: self.related_id,
            related_type: self.related_type,
            is_read: false,
            read_at: None,
            action_url: self.action_url,
            created_at,
            event_id: self.event_id,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notifications)]
pub struct NotificationRow<'a> {
    pub id: i64,
    pub user_id: &'a str,
    pub type_: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    pub actor_id: Option<&'a str>,
    pub related_id: Option<&'a str>,
    pub related_type: Option<&'a str>,
    pub is_read: bool,
    pub action_url: Option<&'a str>,
    pub created_at: DateTime<Utc>,
    pub event_id: Option<&'a str>,
}

impl<'a> From<&'a Notification> for NotificationRow<'a> {
    fn from(n: &'a Notification) -> Self {
        Self {
            id: n.id,
            user_id: &n.user_id,
            type_: &n.type_,
            title: &n.title,
            message: &n.message,
            actor_id: n.actor_id.as_deref(),
            related_id: n.related_id.as_deref(),
            related_type: n.related_type.as_deref(),
            is_read: n.is_read,
            action_url: n.action_url.as_deref(),
            created_at: n.created_at,
            event_id: n.event_id.as_deref(),
        }
    }
}
