//! REST boundary used by the controllers.
//!
//! [`crate::http_api::HttpSocialApi`] is the production implementation;
//! tests substitute recording fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Conversation, ConversationDetail, ConversationScope, Friendship, FriendshipStatusReport,
    Message, Notification, OutgoingMessage,
};

/// Outcome of answering a group or church join request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinDecision {
    Accept,
    Reject,
}

impl JoinDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinDecision::Accept => "accept",
            JoinDecision::Reject => "reject",
        }
    }
}

#[async_trait]
pub trait SocialApi: Send + Sync {
    // Conversations
    async fn list_conversations(&self, scope: ConversationScope) -> Result<Vec<Conversation>>;
    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail>;
    /// Returns the existing conversation with `user_id`, creating it if needed.
    async fn conversation_with_peer(&self, user_id: &str) -> Result<Conversation>;
    async fn send_message(&self, conversation_id: &str, message: &OutgoingMessage)
        -> Result<Message>;
    async fn mark_conversation_read(&self, id: &str) -> Result<()>;
    async fn archive_conversation(&self, id: &str) -> Result<Conversation>;
    async fn star_conversation(&self, id: &str) -> Result<Conversation>;
    async fn accept_conversation(&self, id: &str) -> Result<Conversation>;
    async fn decline_conversation(&self, id: &str) -> Result<()>;
    async fn clear_conversation(&self, id: &str) -> Result<()>;
    async fn delete_conversation(&self, id: &str) -> Result<()>;

    // Notifications
    async fn list_notifications(&self) -> Result<Vec<Notification>>;
    async fn mark_notification_read(&self, id: &str) -> Result<()>;
    async fn delete_notification(&self, id: &str) -> Result<()>;

    // Friendships
    async fn friendship_status(&self, user_id: &str) -> Result<FriendshipStatusReport>;
    async fn send_friend_request(&self, user_id: &str) -> Result<Friendship>;
    async fn accept_friendship(&self, friendship_id: &str) -> Result<()>;
    async fn reject_friendship(&self, friendship_id: &str) -> Result<()>;
    async fn delete_friendship(&self, friendship_id: &str) -> Result<()>;

    // Join requests embedded in notifications
    async fn respond_group_request(
        &self,
        group_id: &str,
        user_id: &str,
        decision: JoinDecision,
    ) -> Result<()>;
    async fn respond_church_request(
        &self,
        church_id: &str,
        user_id: &str,
        decision: JoinDecision,
    ) -> Result<()>;
}
