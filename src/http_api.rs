//! [`SocialApi`] over HTTP.
//!
//! Requests go through a blocking `ureq` agent on tokio's blocking pool.
//! Status codes are mapped onto [`SyncError`]; a 401 tears the session down
//! before the error reaches the caller.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{JoinDecision, SocialApi};
use crate::error::{Result, SyncError};
use crate::models::{
    Conversation, ConversationDetail, ConversationScope, Friendship, FriendshipStatusReport,
    Message, Notification, OutgoingMessage,
};
use crate::session::SessionStore;

const ALREADY_PROCESSED_CODE: &str = "REQUEST_ALREADY_PROCESSED";

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

enum Reply {
    Body(String),
    Status(u16, String),
}

pub struct HttpSocialApi {
    base_url: String,
    agent: ureq::Agent,
    session: Arc<SessionStore>,
}

impl HttpSocialApi {
    pub fn new(base_url: &str, session: Arc<SessionStore>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().build(),
            session,
        }
    }

    async fn call(&self, method: &'static str, path: String, body: Option<Value>) -> Result<String> {
        let token = self.session.token()?;
        let url = format!("{}{}", self.base_url, path);
        let agent = self.agent.clone();
        debug!(method, %url, "api request");

        let reply = tokio::task::spawn_blocking(move || -> Result<Reply> {
            let mut req = agent.request(method, &url);
            if let Some(token) = &token {
                req = req.set("Authorization", &format!("Bearer {token}"));
            }
            let response = match body {
                Some(body) => req.send_json(body),
                None => req.call(),
            };
            match response {
                Ok(resp) => resp
                    .into_string()
                    .map(Reply::Body)
                    .map_err(|e| SyncError::Transport(format!("read response: {e}"))),
                Err(ureq::Error::Status(code, resp)) => {
                    Ok(Reply::Status(code, resp.into_string().unwrap_or_default()))
                }
                Err(e) => Err(SyncError::Transport(e.to_string())),
            }
        })
        .await
        .map_err(|e| SyncError::Transport(format!("request task failed: {e}")))??;

        match reply {
            Reply::Body(text) => Ok(text),
            Reply::Status(code, text) => Err(self.map_status(code, &text)),
        }
    }

    fn map_status(&self, status: u16, text: &str) -> SyncError {
        let body: ErrorBody = serde_json::from_str(text).unwrap_or_default();
        let message = body.error.unwrap_or_else(|| text.to_string());

        if status == 401 {
            if let Err(e) = self.session.clear() {
                warn!(error = %e, "failed to clear session after 401");
            }
            return SyncError::Unauthorized;
        }
        if status == 409 || body.code.as_deref() == Some(ALREADY_PROCESSED_CODE) {
            return SyncError::AlreadyProcessed(message);
        }
        if status == 404 {
            return SyncError::NotFound(message);
        }
        SyncError::Rejected { status, message }
    }

    async fn get<T: DeserializeOwned>(&self, path: String) -> Result<T> {
        let text = self.call("GET", path, None).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &'static str,
        path: String,
        body: Option<Value>,
    ) -> Result<T> {
        let text = self.call(method, path, body).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn send_empty(&self, method: &'static str, path: String, body: Option<Value>) -> Result<()> {
        self.call(method, path, body).await.map(|_| ())
    }
}

fn message_body(message: &OutgoingMessage) -> Value {
    let mut body = json!({});
    if let Some(content) = &message.content {
        body["content"] = json!(content);
    }
    if let Some(att) = &message.attachment {
        body["attachment"] = json!({
            "kind": att.kind.as_str(),
            "name": att.name,
            "contentType": att.content_type,
            "data": base64::engine::general_purpose::STANDARD.encode(&att.data),
        });
    }
    body
}

#[async_trait]
impl SocialApi for HttpSocialApi {
    async fn list_conversations(&self, scope: ConversationScope) -> Result<Vec<Conversation>> {
        self.get(format!("/conversations?scope={}", scope.as_str()))
            .await
    }

    async fn get_conversation(&self, id: &str) -> Result<ConversationDetail> {
        self.get(format!("/conversations/{id}")).await
    }

    async fn conversation_with_peer(&self, user_id: &str) -> Result<Conversation> {
        self.get(format!("/conversations/peer/{user_id}")).await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutgoingMessage,
    ) -> Result<Message> {
        self.send(
            "POST",
            format!("/conversations/{conversation_id}/message"),
            Some(message_body(message)),
        )
        .await
    }

    async fn mark_conversation_read(&self, id: &str) -> Result<()> {
        self.send_empty("PUT", format!("/conversations/{id}/read"), None)
            .await
    }

    async fn archive_conversation(&self, id: &str) -> Result<Conversation> {
        self.send("PUT", format!("/conversations/{id}/archive"), None)
            .await
    }

    async fn star_conversation(&self, id: &str) -> Result<Conversation> {
        self.send("PUT", format!("/conversations/{id}/star"), None)
            .await
    }

    async fn accept_conversation(&self, id: &str) -> Result<Conversation> {
        self.send("PUT", format!("/conversations/{id}/accept"), None)
            .await
    }

    async fn decline_conversation(&self, id: &str) -> Result<()> {
        self.send_empty("PUT", format!("/conversations/{id}/decline"), None)
            .await
    }

    async fn clear_conversation(&self, id: &str) -> Result<()> {
        self.send_empty("PUT", format!("/conversations/{id}/clear"), None)
            .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.send_empty("DELETE", format!("/conversations/{id}"), None)
            .await
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        self.get("/notifications".to_string()).await
    }

    async fn mark_notification_read(&self, id: &str) -> Result<()> {
        self.send_empty("PUT", format!("/notifications/{id}/read"), None)
            .await
    }

    async fn delete_notification(&self, id: &str) -> Result<()> {
        self.send_empty("DELETE", format!("/notifications/{id}"), None)
            .await
    }

    async fn friendship_status(&self, user_id: &str) -> Result<FriendshipStatusReport> {
        self.get(format!("/friendships/status/{user_id}")).await
    }

    async fn send_friend_request(&self, user_id: &str) -> Result<Friendship> {
        self.send(
            "POST",
            "/friendships/request".to_string(),
            Some(json!({ "recipientId": user_id })),
        )
        .await
    }

    async fn accept_friendship(&self, friendship_id: &str) -> Result<()> {
        self.send_empty(
            "POST",
            "/friendships/accept".to_string(),
            Some(json!({ "friendshipId": friendship_id })),
        )
        .await
    }

    async fn reject_friendship(&self, friendship_id: &str) -> Result<()> {
        self.send_empty(
            "POST",
            "/friendships/reject".to_string(),
            Some(json!({ "friendshipId": friendship_id })),
        )
        .await
    }

    async fn delete_friendship(&self, friendship_id: &str) -> Result<()> {
        self.send_empty("DELETE", format!("/friendships/{friendship_id}"), None)
            .await
    }

    async fn respond_group_request(
        &self,
        group_id: &str,
        user_id: &str,
        decision: JoinDecision,
    ) -> Result<()> {
        self.send_empty(
            "PUT",
            format!("/groups/{group_id}/requests/{user_id}/{}", decision.as_str()),
            None,
        )
        .await
    }

    async fn respond_church_request(
        &self,
        church_id: &str,
        user_id: &str,
        decision: JoinDecision,
    ) -> Result<()> {
        self.send_empty(
            "PUT",
            format!("/churches/{church_id}/requests/{user_id}/{}", decision.as_str()),
            None,
        )
        .await
    }
}
