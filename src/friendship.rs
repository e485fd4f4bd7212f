//! Friendship status of one viewed profile.
//!
//! The tracker lives as long as the profile view. Its state comes from one
//! status fetch, the viewer's own actions, and pushed friendship events
//! about the viewed user. Nothing is persisted.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::SocialApi;
use crate::bus::{EventBus, Subscription};
use crate::error::{Result, SyncError};
use crate::events::{FriendshipEvent, PushEvent, PushEventKind};
use crate::logging;
use crate::models::{FriendshipStatusReport, ServerFriendshipStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FriendshipState {
    /// Viewing our own profile.
    SelfProfile,
    Default,
    /// We sent a request that is still pending.
    Enviada,
    /// They sent us a request that is still pending.
    Recibida,
    Aceptado,
    Rechazado,
}

impl FriendshipState {
    pub fn from_server(status: ServerFriendshipStatus, is_sender: bool) -> Self {
        match status {
            ServerFriendshipStatus::SelfProfile => FriendshipState::SelfProfile,
            ServerFriendshipStatus::None => FriendshipState::Default,
            ServerFriendshipStatus::Pendiente if is_sender => FriendshipState::Enviada,
            ServerFriendshipStatus::Pendiente => FriendshipState::Recibida,
            ServerFriendshipStatus::Aceptada => FriendshipState::Aceptado,
            ServerFriendshipStatus::Rechazada => FriendshipState::Rechazado,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FriendshipState::SelfProfile => "self",
            FriendshipState::Default => "default",
            FriendshipState::Enviada => "enviada",
            FriendshipState::Recibida => "recibida",
            FriendshipState::Aceptado => "aceptado",
            FriendshipState::Rechazado => "rechazado",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendshipView {
    pub state: FriendshipState,
    pub friendship_id: Option<String>,
}

impl FriendshipView {
    fn from_report(report: FriendshipStatusReport) -> Self {
        let state = FriendshipState::from_server(report.status, report.is_sender);
        let friendship_id = match state {
            FriendshipState::Default | FriendshipState::SelfProfile => None,
            _ => report.friendship_id,
        };
        Self {
            state,
            friendship_id,
        }
    }
}

struct Inner {
    view: FriendshipView,
    /// Bumped on every local change so a slow status fetch cannot overwrite
    /// something newer.
    revision: u64,
    closed: bool,
}

pub struct FriendshipTracker {
    api: Arc<dyn SocialApi>,
    bus: Arc<dyn EventBus>,
    peer_id: String,
    inner: Mutex<Inner>,
}

impl FriendshipTracker {
    pub fn new(api: Arc<dyn SocialApi>, bus: Arc<dyn EventBus>, peer_id: impl Into<String>) -> Self {
        Self {
            api,
            bus,
            peer_id: peer_id.into(),
            inner: Mutex::new(Inner {
                view: FriendshipView {
                    state: FriendshipState::Default,
                    friendship_id: None,
                },
                revision: 0,
                closed: false,
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn view(&self) -> FriendshipView {
        self.inner.lock().await.view.clone()
    }

    pub async fn state(&self) -> FriendshipState {
        self.inner.lock().await.view.state
    }

    async fn set(&self, view: FriendshipView) -> FriendshipView {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return view;
        }
        if inner.view != view {
            debug!(
                peer = %logging::user_id(&self.peer_id),
                from = inner.view.state.as_str(),
                to = view.state.as_str(),
                "friendship state changed"
            );
        }
        inner.view = view.clone();
        inner.revision += 1;
        view
    }

    /// Load the current status from the server.
    pub async fn mount(&self) -> Result<FriendshipView> {
        let revision = {
            let inner = self.inner.lock().await;
            if inner.closed {
                return Err(SyncError::Closed);
            }
            inner.revision
        };

        let report = self.api.friendship_status(&self.peer_id).await?;
        let view = FriendshipView::from_report(report);

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(SyncError::Closed);
        }
        if inner.revision != revision {
            debug!(peer = %logging::user_id(&self.peer_id), "status fetch superseded");
            return Ok(inner.view.clone());
        }
        inner.view = view.clone();
        inner.revision += 1;
        Ok(view)
    }

    async fn require(&self, allowed: &[FriendshipState], action: &'static str) -> Result<FriendshipView> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(SyncError::Closed);
        }
        if !allowed.contains(&inner.view.state) {
            return Err(SyncError::InvalidTransition {
                state: inner.view.state.as_str(),
                action,
            });
        }
        Ok(inner.view.clone())
    }

    fn friendship_id(view: &FriendshipView) -> Result<String> {
        view.friendship_id
            .clone()
            .ok_or_else(|| SyncError::Validation("no friendship record id".into()))
    }

    /// `default -> enviada`.
    pub async fn send_request(&self) -> Result<FriendshipView> {
        self.require(&[FriendshipState::Default], "send request").await?;
        let friendship = self.api.send_friend_request(&self.peer_id).await?;
        info!(peer = %logging::user_id(&self.peer_id), "friend request sent");
        Ok(self
            .set(FriendshipView {
                state: FriendshipState::Enviada,
                friendship_id: Some(friendship.id),
            })
            .await)
    }

    /// `recibida -> aceptado`. If the server already settled the request,
    /// re-fetch and adopt whatever it says.
    pub async fn accept_request(&self) -> Result<FriendshipView> {
        let current = self.require(&[FriendshipState::Recibida], "accept").await?;
        let id = Self::friendship_id(&current)?;
        match self.api.accept_friendship(&id).await {
            Ok(()) => Ok(self
                .set(FriendshipView {
                    state: FriendshipState::Aceptado,
                    friendship_id: Some(id),
                })
                .await),
            Err(e) if e.is_benign_race() => self.mount().await,
            Err(e) => Err(e),
        }
    }

    /// `recibida -> default`.
    pub async fn reject_request(&self) -> Result<FriendshipView> {
        let current = self.require(&[FriendshipState::Recibida], "reject").await?;
        let id = Self::friendship_id(&current)?;
        match self.api.reject_friendship(&id).await {
            Ok(()) => Ok(self
                .set(FriendshipView {
                    state: FriendshipState::Default,
                    friendship_id: None,
                })
                .await),
            Err(e) if e.is_benign_race() => self.mount().await,
            Err(e) => Err(e),
        }
    }

    /// Cancel a sent request or remove a friend: `any -> default`.
    pub async fn cancel_or_remove(&self) -> Result<FriendshipView> {
        let current = self
            .require(
                &[
                    FriendshipState::Default,
                    FriendshipState::Enviada,
                    FriendshipState::Recibida,
                    FriendshipState::Aceptado,
                    FriendshipState::Rechazado,
                ],
                "cancel or remove",
            )
            .await?;
        if let Some(id) = &current.friendship_id {
            match self.api.delete_friendship(id).await {
                Ok(()) => {}
                // Already gone on the server.
                Err(SyncError::NotFound(_)) => {}
                Err(e) if e.is_benign_race() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(self
            .set(FriendshipView {
                state: FriendshipState::Default,
                friendship_id: None,
            })
            .await)
    }

    /// Re-derive state from a pushed friendship event about the viewed user.
    pub async fn apply_push(&self, event: &PushEvent) -> bool {
        let (ev, implied_status, implied_sender) = match event {
            PushEvent::FriendRequestReceived(ev) => {
                (ev, Some(ServerFriendshipStatus::Pendiente), Some(false))
            }
            PushEvent::FriendshipAccepted(ev) => (ev, Some(ServerFriendshipStatus::Aceptada), None),
            PushEvent::FriendshipStatusChanged(ev) => (ev, None, None),
            PushEvent::FriendshipRemoved(ev) => (ev, Some(ServerFriendshipStatus::None), None),
            _ => return false,
        };
        if ev.user_id != self.peer_id {
            return false;
        }

        let current = {
            let inner = self.inner.lock().await;
            if inner.closed || inner.view.state == FriendshipState::SelfProfile {
                return false;
            }
            inner.view.clone()
        };
        let Some(view) = derive_view(&current, ev, implied_status, implied_sender) else {
            return false;
        };
        if view == current {
            return false;
        }
        let needs_record = view.friendship_id.is_none()
            && matches!(
                view.state,
                FriendshipState::Enviada
                    | FriendshipState::Recibida
                    | FriendshipState::Aceptado
                    | FriendshipState::Rechazado
            );
        self.set(view).await;
        if needs_record {
            if let Err(e) = self.mount().await {
                warn!(peer = %logging::user_id(&self.peer_id), error = %e, "friendship refetch failed");
            }
        }
        true
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(PushEventKind::FRIENDSHIP)
    }

    pub async fn run(&self, mut events: Subscription) {
        while let Some(event) = events.next().await {
            if self.inner.lock().await.closed {
                break;
            }
            self.apply_push(&event).await;
        }
    }

    /// The profile view went away; later results are ignored.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
    }
}

fn derive_view(
    current: &FriendshipView,
    ev: &FriendshipEvent,
    implied_status: Option<ServerFriendshipStatus>,
    implied_sender: Option<bool>,
) -> Option<FriendshipView> {
    let status = ev.status.or(implied_status)?;
    let is_sender = ev
        .is_sender
        .or(implied_sender)
        .unwrap_or(current.state == FriendshipState::Enviada);
    let state = FriendshipState::from_server(status, is_sender);
    let friendship_id = match state {
        FriendshipState::Default | FriendshipState::SelfProfile => None,
        _ => ev
            .friendship_id
            .clone()
            .or_else(|| current.friendship_id.clone()),
    };
    Some(FriendshipView {
        state,
        friendship_id,
    })
}
