//! Event-bus frames.
//!
//! Every frame on the wire is a JSON object `{"event": <name>, "data": <payload>}`.
//! [`PushEvent`] covers what the server pushes to us, [`ClientEvent`] what we
//! emit back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::models::{Message, Notification, ServerFriendshipStatus};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReadEvent {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadEvent {
    pub conversation_id: String,
    #[serde(default)]
    pub read_by: Option<String>,
    /// Everything sent at or before this instant has been read. Absent means
    /// "everything so far".
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDeletedEvent {
    pub notification_id: String,
}

/// Payload shared by the friendship events. `user_id` is the other party as
/// seen by the receiving client; `is_sender` tells whether the receiving
/// client sent the underlying request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendshipEvent {
    pub user_id: String,
    #[serde(default)]
    pub status: Option<ServerFriendshipStatus>,
    #[serde(default)]
    pub is_sender: Option<bool>,
    #[serde(default)]
    pub friendship_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChurchRequestProcessedEvent {
    pub church_id: String,
    #[serde(default)]
    pub applicant_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequestProcessedEvent {
    pub group_id: String,
    #[serde(default)]
    pub applicant_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedEvent {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Events pushed by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PushEvent {
    Authenticated(AuthenticatedEvent),
    NewMessage(Message),
    ConversationRead(ConversationReadEvent),
    #[serde(rename = "messages_read_update")]
    MessagesReadUpdate(MessagesReadEvent),
    NewNotification(Notification),
    NotificationDeleted(NotificationDeletedEvent),
    FriendRequestReceived(FriendshipEvent),
    FriendshipAccepted(FriendshipEvent),
    FriendshipStatusChanged(FriendshipEvent),
    FriendshipRemoved(FriendshipEvent),
    FriendRequestCancelled(FriendshipEvent),
    FriendRequestRejected(FriendshipEvent),
    ChurchRequestProcessed(ChurchRequestProcessedEvent),
    GroupRequestProcessed(GroupRequestProcessedEvent),
    /// A frame whose name we do not know. Ignored by every controller.
    #[serde(skip)]
    Unknown(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PushEventKind {
    Authenticated,
    NewMessage,
    ConversationRead,
    MessagesReadUpdate,
    NewNotification,
    NotificationDeleted,
    FriendRequestReceived,
    FriendshipAccepted,
    FriendshipStatusChanged,
    FriendshipRemoved,
    FriendRequestCancelled,
    FriendRequestRejected,
    ChurchRequestProcessed,
    GroupRequestProcessed,
    Unknown,
}

impl PushEventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "authenticated" => PushEventKind::Authenticated,
            "newMessage" => PushEventKind::NewMessage,
            "conversationRead" => PushEventKind::ConversationRead,
            "messages_read_update" => PushEventKind::MessagesReadUpdate,
            "newNotification" => PushEventKind::NewNotification,
            "notificationDeleted" => PushEventKind::NotificationDeleted,
            "friendRequestReceived" => PushEventKind::FriendRequestReceived,
            "friendshipAccepted" => PushEventKind::FriendshipAccepted,
            "friendshipStatusChanged" => PushEventKind::FriendshipStatusChanged,
            "friendshipRemoved" => PushEventKind::FriendshipRemoved,
            "friendRequestCancelled" => PushEventKind::FriendRequestCancelled,
            "friendRequestRejected" => PushEventKind::FriendRequestRejected,
            "churchRequestProcessed" => PushEventKind::ChurchRequestProcessed,
            "groupRequestProcessed" => PushEventKind::GroupRequestProcessed,
            _ => return None,
        };
        Some(kind)
    }

    /// Events the conversation controller listens to.
    pub const CONVERSATIONS: &'static [PushEventKind] = &[
        PushEventKind::NewMessage,
        PushEventKind::ConversationRead,
        PushEventKind::MessagesReadUpdate,
    ];

    /// Events the notification engine listens to.
    pub const NOTIFICATIONS: &'static [PushEventKind] = &[
        PushEventKind::NewNotification,
        PushEventKind::NotificationDeleted,
        PushEventKind::FriendshipStatusChanged,
        PushEventKind::FriendRequestCancelled,
        PushEventKind::FriendRequestRejected,
        PushEventKind::ChurchRequestProcessed,
        PushEventKind::GroupRequestProcessed,
    ];

    /// Events the friendship tracker listens to.
    pub const FRIENDSHIP: &'static [PushEventKind] = &[
        PushEventKind::FriendRequestReceived,
        PushEventKind::FriendshipAccepted,
        PushEventKind::FriendshipStatusChanged,
        PushEventKind::FriendshipRemoved,
    ];
}

impl PushEvent {
    pub fn kind(&self) -> PushEventKind {
        match self {
            PushEvent::Authenticated(_) => PushEventKind::Authenticated,
            PushEvent::NewMessage(_) => PushEventKind::NewMessage,
            PushEvent::ConversationRead(_) => PushEventKind::ConversationRead,
            PushEvent::MessagesReadUpdate(_) => PushEventKind::MessagesReadUpdate,
            PushEvent::NewNotification(_) => PushEventKind::NewNotification,
            PushEvent::NotificationDeleted(_) => PushEventKind::NotificationDeleted,
            PushEvent::FriendRequestReceived(_) => PushEventKind::FriendRequestReceived,
            PushEvent::FriendshipAccepted(_) => PushEventKind::FriendshipAccepted,
            PushEvent::FriendshipStatusChanged(_) => PushEventKind::FriendshipStatusChanged,
            PushEvent::FriendshipRemoved(_) => PushEventKind::FriendshipRemoved,
            PushEvent::FriendRequestCancelled(_) => PushEventKind::FriendRequestCancelled,
            PushEvent::FriendRequestRejected(_) => PushEventKind::FriendRequestRejected,
            PushEvent::ChurchRequestProcessed(_) => PushEventKind::ChurchRequestProcessed,
            PushEvent::GroupRequestProcessed(_) => PushEventKind::GroupRequestProcessed,
            PushEvent::Unknown(_) => PushEventKind::Unknown,
        }
    }

    /// Decode one text frame. Unknown event names decode to
    /// [`PushEvent::Unknown`]; a known name with a malformed payload is an
    /// error.
    pub fn decode(text: &str) -> Result<PushEvent> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        let name = value
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::Decode("frame has no event name".into()))?
            .to_string();

        if PushEventKind::from_name(&name).is_none() {
            return Ok(PushEvent::Unknown(name));
        }
        if let Some(obj) = value.as_object_mut() {
            // `authenticated` is sometimes sent bare.
            obj.entry("data").or_insert_with(|| serde_json::json!({}));
        }
        serde_json::from_value(value).map_err(|e| SyncError::Decode(format!("{name}: {e}")))
    }
}

/// Events the client emits.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    #[serde(rename = "message_read")]
    MessageRead {
        conversation_id: String,
        message_id: String,
    },
    SubscribeConversation {
        conversation_id: String,
    },
    UnsubscribeConversation {
        conversation_id: String,
    },
    SubscribeNotifications,
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Room subscriptions are replayed after every re-authentication.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            ClientEvent::SubscribeConversation { .. } | ClientEvent::SubscribeNotifications
        )
    }
}
