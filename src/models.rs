//! Entities shared between the REST boundary, the event bus and the
//! controllers. JSON field names follow the server (camelCase).

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationScope {
    Principal,
    Pending,
    Archived,
}

impl ConversationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationScope::Principal => "principal",
            ConversationScope::Pending => "pending",
            ConversationScope::Archived => "archived",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    #[default]
    Accepted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: Option<String>,
    pub sender_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    /// Unread count per participant id.
    #[serde(default)]
    pub unread: HashMap<String, u32>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub starred_by: BTreeSet<String>,
    #[serde(default)]
    pub status: ConversationStatus,
}

impl Conversation {
    /// Which list this conversation belongs in.
    pub fn scope(&self) -> ConversationScope {
        if self.archived {
            ConversationScope::Archived
        } else if self.status == ConversationStatus::Pending {
            ConversationScope::Pending
        } else {
            ConversationScope::Principal
        }
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    pub fn is_starred_by(&self, user_id: &str) -> bool {
        self.starred_by.contains(user_id)
    }

    /// The other participant of a one-to-one conversation.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != user_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Document => "document",
        }
    }
}

/// An attachment as stored by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDetail {
    pub conversation: Conversation,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A file the user picked, before upload.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingAttachment {
    pub kind: AttachmentKind,
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub attachment: Option<OutgoingAttachment>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            attachment: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    FriendRequest,
    FriendAccepted,
    GroupJoinRequest,
    ChurchJoinRequest,
    ChurchRequestProcessed,
    Info,
    Deleted,
    #[serde(other)]
    Other,
}

/// Structured pointer to whatever a notification is about.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRef {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub church_id: Option<String>,
    #[serde(default)]
    pub applicant_id: Option<String>,
    #[serde(default)]
    pub friendship_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub reference: Option<NotificationRef>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id.as_deref() == Some(user_id)
    }

    pub fn is_to(&self, user_id: &str) -> bool {
        self.recipient_id.as_deref() == Some(user_id)
    }

    fn reference_field(&self, pick: impl Fn(&NotificationRef) -> Option<&String>) -> Option<&str> {
        self.reference.as_ref().and_then(pick).map(String::as_str)
    }

    pub fn church_id(&self) -> Option<&str> {
        self.reference_field(|r| r.church_id.as_ref())
    }

    pub fn group_id(&self) -> Option<&str> {
        self.reference_field(|r| r.group_id.as_ref())
    }

    /// The user asking to join, falling back to the sender.
    pub fn applicant_id(&self) -> Option<&str> {
        self.reference_field(|r| r.applicant_id.as_ref())
            .or(self.sender_id.as_deref())
    }

    pub fn friendship_id(&self) -> Option<&str> {
        self.reference_field(|r| r.friendship_id.as_ref())
    }
}

/// Friendship status as the server reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFriendshipStatus {
    #[serde(rename = "self")]
    SelfProfile,
    #[serde(alias = "default")]
    None,
    #[serde(alias = "pending")]
    Pendiente,
    #[serde(alias = "aceptado", alias = "accepted")]
    Aceptada,
    #[serde(alias = "rechazado", alias = "rejected")]
    Rechazada,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendshipStatusReport {
    pub status: ServerFriendshipStatus,
    #[serde(default)]
    pub is_sender: bool,
    #[serde(default)]
    pub friendship_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friendship {
    pub id: String,
    pub requester_id: String,
    pub recipient_id: String,
    pub status: ServerFriendshipStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}
