#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use congregate::api::{JoinDecision, SocialApi};
use congregate::models::{
    Conversation, ConversationDetail, ConversationScope, ConversationStatus, Friendship,
    FriendshipStatusReport, Message, Notification, NotificationKind, NotificationRef,
    OutgoingMessage, ServerFriendshipStatus,
};
use congregate::{Result, SyncError};

pub const ME: &str = "me";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn conversation(id: &str, peer: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        participants: vec![ME.to_string(), peer.to_string()],
        last_message: None,
        unread: HashMap::new(),
        archived: false,
        starred_by: Default::default(),
        status: ConversationStatus::Accepted,
    }
}

pub fn message(id: &str, conversation_id: &str, sender: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        content: Some(format!("text of {id}")),
        attachment: None,
        created_at: at(secs),
        read: false,
    }
}

pub fn friend_request(id: &str, from: &str, friendship_id: &str) -> Notification {
    Notification {
        id: id.to_string(),
        kind: NotificationKind::FriendRequest,
        sender_id: Some(from.to_string()),
        recipient_id: Some(ME.to_string()),
        reference: Some(NotificationRef {
            friendship_id: Some(friendship_id.to_string()),
            ..Default::default()
        }),
        read: false,
        created_at: at(0),
    }
}

pub fn info_notification(id: &str) -> Notification {
    Notification {
        id: id.to_string(),
        kind: NotificationKind::Info,
        sender_id: None,
        recipient_id: Some(ME.to_string()),
        reference: None,
        read: false,
        created_at: at(0),
    }
}

type Failure = Box<dyn Fn() -> SyncError + Send + Sync>;

/// Scriptable in-memory server. Every call yields once before answering so
/// concurrent callers interleave the way they would over a network.
#[derive(Default)]
pub struct FakeApi {
    pub lists: Mutex<HashMap<ConversationScope, Vec<Conversation>>>,
    pub details: Mutex<HashMap<String, ConversationDetail>>,
    pub peers: Mutex<HashMap<String, Conversation>>,
    pub notifications: Mutex<Vec<Notification>>,
    pub friendship: Mutex<Option<FriendshipStatusReport>>,
    failures: Mutex<HashMap<&'static str, Failure>>,
    calls: Mutex<Vec<String>>,
    sent: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(self, scope: ConversationScope, list: Vec<Conversation>) -> Self {
        self.lists.lock().unwrap().insert(scope, list);
        self
    }

    pub fn with_detail(self, conversation: Conversation, messages: Vec<Message>) -> Self {
        self.details.lock().unwrap().insert(
            conversation.id.clone(),
            ConversationDetail {
                conversation,
                messages,
            },
        );
        self
    }

    pub fn with_notifications(self, list: Vec<Notification>) -> Self {
        *self.notifications.lock().unwrap() = list;
        self
    }

    pub fn with_friendship(self, status: ServerFriendshipStatus, is_sender: bool, id: Option<&str>) -> Self {
        *self.friendship.lock().unwrap() = Some(FriendshipStatusReport {
            status,
            is_sender,
            friendship_id: id.map(str::to_string),
        });
        self
    }

    /// Make the next call named `call` fail with `err()`.
    pub fn fail_next(&self, call: &'static str, err: impl Fn() -> SyncError + Send + Sync + 'static) {
        self.failures.lock().unwrap().insert(call, Box::new(err));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(':').next() == Some(call))
            .count()
    }

    async fn enter(&self, call: &'static str, arg: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{call}:{arg}"));
        tokio::task::yield_now().await;
        match self.failures.lock().unwrap().remove(call) {
            Some(err) => Err(err()),
            None => Ok(()),
        }
    }

    fn find(&self, id: &str) -> Option<Conversation> {
        if let Some(d) = self.details.lock().unwrap().get(id) {
            return Some(d.conversation.clone());
        }
        if let Some(c) = self.peers.lock().unwrap().values().find(|c| c.id == id) {
            return Some(c.clone());
        }
        self.lists
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|c| c.id == id)
            .cloned()
    }

    fn found(&self, id: &str) -> Result<Conversation> {
        self.find(id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {id}")))
    }
}

#[async_trait]
impl SocialApi for FakeApi {
    async fn list_conversations(&self, scope: ConversationScope) -> Result<Vec<Conversation>> {
        self.enter("list_conversations", scope.as_str()).await?;
        Ok(self.lists.lock().unwrap().get(&scope).cloned().unwrap_or_default())
    }

    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail> {
        self.enter("get_conversation", id).await?;
        if let Some(d) = self.details.lock().unwrap().get(id) {
            return Ok(d.clone());
        }
        Ok(ConversationDetail {
            conversation: self.found(id)?,
            messages: Vec::new(),
        })
    }

    async fn conversation_with_peer(&self, user_id: &str) -> Result<Conversation> {
        self.enter("conversation_with_peer", user_id).await?;
        let mut peers = self.peers.lock().unwrap();
        let c = peers
            .entry(user_id.to_string())
            .or_insert_with(|| conversation(&format!("conv-{user_id}"), user_id));
        Ok(c.clone())
    }

    async fn send_message(&self, conversation_id: &str, message: &OutgoingMessage) -> Result<Message> {
        self.enter("send_message", conversation_id).await?;
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Message {
            id: format!("sent-{n}"),
            conversation_id: conversation_id.to_string(),
            sender_id: ME.to_string(),
            content: message.content.clone(),
            attachment: None,
            created_at: at(100 + n as i64),
            read: false,
        })
    }

    async fn mark_conversation_read(&self, id: &str) -> Result<()> {
        self.enter("mark_conversation_read", id).await
    }

    async fn archive_conversation(&self, id: &str) -> Result<Conversation> {
        self.enter("archive_conversation", id).await?;
        let mut c = self.found(id)?;
        c.archived = true;
        Ok(c)
    }

    async fn star_conversation(&self, id: &str) -> Result<Conversation> {
        self.enter("star_conversation", id).await?;
        let mut c = self.found(id)?;
        if !c.starred_by.remove(ME) {
            c.starred_by.insert(ME.to_string());
        }
        Ok(c)
    }

    async fn accept_conversation(&self, id: &str) -> Result<Conversation> {
        self.enter("accept_conversation", id).await?;
        let mut c = self.found(id)?;
        c.status = ConversationStatus::Accepted;
        Ok(c)
    }

    async fn decline_conversation(&self, id: &str) -> Result<()> {
        self.enter("decline_conversation", id).await
    }

    async fn clear_conversation(&self, id: &str) -> Result<()> {
        self.enter("clear_conversation", id).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.enter("delete_conversation", id).await
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        self.enter("list_notifications", "").await?;
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn mark_notification_read(&self, id: &str) -> Result<()> {
        self.enter("mark_notification_read", id).await
    }

    async fn delete_notification(&self, id: &str) -> Result<()> {
        self.enter("delete_notification", id).await?;
        self.notifications.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }

    async fn friendship_status(&self, user_id: &str) -> Result<FriendshipStatusReport> {
        self.enter("friendship_status", user_id).await?;
        Ok(self
            .friendship
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(FriendshipStatusReport {
                status: ServerFriendshipStatus::None,
                is_sender: false,
                friendship_id: None,
            }))
    }

    async fn send_friend_request(&self, user_id: &str) -> Result<Friendship> {
        self.enter("send_friend_request", user_id).await?;
        Ok(Friendship {
            id: format!("f-{user_id}"),
            requester_id: ME.to_string(),
            recipient_id: user_id.to_string(),
            status: ServerFriendshipStatus::Pendiente,
        })
    }

    async fn accept_friendship(&self, friendship_id: &str) -> Result<()> {
        self.enter("accept_friendship", friendship_id).await
    }

    async fn reject_friendship(&self, friendship_id: &str) -> Result<()> {
        self.enter("reject_friendship", friendship_id).await
    }

    async fn delete_friendship(&self, friendship_id: &str) -> Result<()> {
        self.enter("delete_friendship", friendship_id).await
    }

    async fn respond_group_request(&self, group_id: &str, user_id: &str, decision: JoinDecision) -> Result<()> {
        self.enter("respond_group_request", &format!("{group_id}/{user_id}/{}", decision.as_str()))
            .await
    }

    async fn respond_church_request(&self, church_id: &str, user_id: &str, decision: JoinDecision) -> Result<()> {
        self.enter("respond_church_request", &format!("{church_id}/{user_id}/{}", decision.as_str()))
            .await
    }
}
