use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use congregate::api::SocialApi;
use congregate::http_api::HttpSocialApi;
use congregate::models::{
    AttachmentKind, ConversationScope, OutgoingAttachment, OutgoingMessage, UserProfile,
};
use congregate::session::SessionStore;
use congregate::SyncError;

const TOKEN: &str = "tok-123";

fn api_error(status: StatusCode, message: &str, code: Option<&str>) -> Response {
    let mut body = json!({ "error": message });
    if let Some(code) = code {
        body["code"] = json!(code);
    }
    (status, Json(body)).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

fn conversation_json(id: &str, peer: &str) -> Value {
    json!({ "id": id, "participants": ["me", peer] })
}

async fn list_conversations(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return api_error(StatusCode::UNAUTHORIZED, "bad token", None);
    }
    match q.get("scope").map(String::as_str) {
        Some("pending") => Json(json!([{
            "id": "p1",
            "participants": ["me", "ana"],
            "status": "pending",
        }]))
        .into_response(),
        _ => Json(json!([conversation_json("c1", "ana"), conversation_json("c2", "bea")])).into_response(),
    }
}

async fn peer_conversation(Path(user): Path<String>) -> Json<Value> {
    Json(conversation_json(&format!("conv-{user}"), &user))
}

async fn send_message(Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    let content = body.get("content").cloned().unwrap_or(Value::Null);
    let attachment = body
        .get("attachment")
        .map(|a| json!({ "kind": a["kind"], "url": format!("/files/{}", a["data"].as_str().unwrap_or("")), "name": a["name"] }));
    Json(json!({
        "id": "m-new",
        "conversationId": id,
        "senderId": "me",
        "content": content,
        "attachment": attachment,
        "createdAt": "2026-03-01T10:00:00Z",
    }))
}

async fn accept_friendship() -> Response {
    api_error(
        StatusCode::BAD_REQUEST,
        "request already processed",
        Some("REQUEST_ALREADY_PROCESSED"),
    )
}

async fn reject_friendship() -> Response {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "database down", None)
}

async fn notifications() -> Response {
    api_error(StatusCode::UNAUTHORIZED, "session expired", None)
}

async fn mark_read() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn start_server() -> (String, oneshot::Sender<()>) {
    let app = Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/peer/:user", get(peer_conversation))
        .route("/api/conversations/:id/message", post(send_message))
        .route("/api/conversations/:id/read", put(mark_read))
        .route("/api/friendships/accept", post(accept_friendship))
        .route("/api/friendships/reject", post(reject_friendship))
        .route("/api/notifications", get(notifications));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}/api", addr), shutdown_tx)
}

fn logged_in_session() -> Arc<SessionStore> {
    let session = SessionStore::open_in_memory().expect("session");
    session
        .save_login(
            TOKEN,
            &UserProfile {
                id: "me".into(),
                display_name: None,
                avatar_url: None,
            },
        )
        .expect("save login");
    Arc::new(session)
}

#[tokio::test]
async fn lists_conversations_with_bearer_token() {
    let (base_url, shutdown_tx) = start_server().await;
    let api = HttpSocialApi::new(&base_url, logged_in_session());

    let principal = api
        .list_conversations(ConversationScope::Principal)
        .await
        .expect("principal list");
    assert_eq!(principal.len(), 2);

    let pending = api
        .list_conversations(ConversationScope::Pending)
        .await
        .expect("pending list");
    assert_eq!(pending[0].scope(), ConversationScope::Pending);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn fetch_or_create_and_send() {
    let (base_url, shutdown_tx) = start_server().await;
    let api = HttpSocialApi::new(&base_url, logged_in_session());

    let c = api.conversation_with_peer("u42").await.expect("peer conversation");
    assert_eq!(c.id, "conv-u42");

    let sent = api
        .send_message(
            &c.id,
            &OutgoingMessage {
                content: Some("hola".into()),
                attachment: Some(OutgoingAttachment {
                    kind: AttachmentKind::Image,
                    name: "a.png".into(),
                    content_type: "image/png".into(),
                    data: b"png".to_vec(),
                }),
            },
        )
        .await
        .expect("send");
    assert_eq!(sent.conversation_id, "conv-u42");
    assert_eq!(sent.content.as_deref(), Some("hola"));
    let attachment = sent.attachment.expect("attachment echoed");
    assert_eq!(attachment.kind, AttachmentKind::Image);
    assert_eq!(attachment.url, "/files/cG5n");

    api.mark_conversation_read(&c.id).await.expect("mark read");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn business_errors_are_classified() {
    let (base_url, shutdown_tx) = start_server().await;
    let api = HttpSocialApi::new(&base_url, logged_in_session());

    let err = api.accept_friendship("f1").await.unwrap_err();
    assert!(err.is_benign_race(), "unexpected {err:?}");

    let err = api.reject_friendship("f1").await.unwrap_err();
    assert!(matches!(err, SyncError::Rejected { status: 500, ref message } if message == "database down"));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn unauthorized_tears_down_the_session() {
    let (base_url, shutdown_tx) = start_server().await;
    let session = logged_in_session();
    let logged_in = session.logged_in();
    let api = HttpSocialApi::new(&base_url, session.clone());

    let err = api.list_notifications().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized));
    assert_eq!(session.token().unwrap(), None);
    assert_eq!(session.profile().unwrap(), None);
    assert!(!*logged_in.borrow());

    // Without a token the server rejects list calls too.
    let err = api
        .list_conversations(ConversationScope::Principal)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = HttpSocialApi::new(&format!("http://{addr}/api"), logged_in_session());
    let err = api.list_notifications().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
}
