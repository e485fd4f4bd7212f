//! Notification list reconciliation.
//!
//! Two producers feed the list: the periodic snapshot (authoritative,
//! replaces everything) and pushed events, merged by [`reconcile`]. Each
//! rule is idempotent, so retransmitted or reordered events converge to the
//! same list.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{JoinDecision, SocialApi};
use crate::bus::{EventBus, Subscription};
use crate::config::NOTIFICATION_POLL_INTERVAL_SECS;
use crate::dedup::InFlightLock;
use crate::error::{Result, SyncError};
use crate::events::{ClientEvent, PushEvent, PushEventKind};
use crate::logging;
use crate::models::{Notification, NotificationKind, ServerFriendshipStatus};

/// Apply one pushed event to a notification list. Returns whether the list
/// changed.
pub fn reconcile(list: &mut Vec<Notification>, event: &PushEvent) -> bool {
    let before = list.len();
    match event {
        PushEvent::NotificationDeleted(ev) => {
            list.retain(|n| n.id != ev.notification_id);
        }
        PushEvent::FriendshipStatusChanged(ev)
            if matches!(
                ev.status,
                Some(ServerFriendshipStatus::Aceptada) | Some(ServerFriendshipStatus::None)
            ) =>
        {
            list.retain(|n| !(n.kind == NotificationKind::FriendRequest && n.is_from(&ev.user_id)));
        }
        PushEvent::FriendRequestCancelled(ev) => {
            list.retain(|n| !(n.kind == NotificationKind::FriendRequest && n.is_from(&ev.user_id)));
        }
        PushEvent::FriendRequestRejected(ev) => {
            list.retain(|n| !(n.kind == NotificationKind::FriendRequest && n.is_to(&ev.user_id)));
        }
        PushEvent::ChurchRequestProcessed(ev) => {
            list.retain(|n| {
                !(n.kind == NotificationKind::ChurchJoinRequest
                    && n.church_id() == Some(ev.church_id.as_str())
                    && ev
                        .applicant_id
                        .as_deref()
                        .map_or(true, |a| n.applicant_id() == Some(a)))
            });
        }
        PushEvent::GroupRequestProcessed(ev) => {
            list.retain(|n| {
                !(n.kind == NotificationKind::GroupJoinRequest
                    && n.group_id() == Some(ev.group_id.as_str())
                    && ev
                        .applicant_id
                        .as_deref()
                        .map_or(true, |a| n.applicant_id() == Some(a)))
            });
        }
        PushEvent::NewNotification(n) if n.kind == NotificationKind::Deleted => {
            // A deletion marker carries the id of the entry it retracts.
            list.retain(|existing| existing.id != n.id);
        }
        PushEvent::NewNotification(n) => {
            if list.iter().any(|existing| existing.id == n.id) {
                return false;
            }
            list.insert(0, n.clone());
            return true;
        }
        _ => return false,
    }
    list.len() != before
}

/// Result of an embedded accept/reject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddedOutcome {
    /// The request was answered (or had already been answered elsewhere) and
    /// the notification is gone.
    Done,
    /// Another call for this notification is still in flight; nothing was
    /// sent.
    AlreadyProcessing,
}

struct State {
    list: Vec<Notification>,
    snapshot_epoch: u64,
    closed: bool,
}

pub struct NotificationEngine {
    api: Arc<dyn SocialApi>,
    bus: Arc<dyn EventBus>,
    processing: InFlightLock,
    poll_interval: Duration,
    state: Mutex<State>,
}

impl NotificationEngine {
    pub fn new(api: Arc<dyn SocialApi>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            api,
            bus,
            processing: InFlightLock::new(),
            poll_interval: Duration::from_secs(NOTIFICATION_POLL_INTERVAL_SECS),
            state: Mutex::new(State {
                list: Vec::new(),
                snapshot_epoch: 0,
                closed: false,
            }),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.list.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.state
            .lock()
            .await
            .list
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    /// Join the notification room and load the first snapshot.
    pub async fn mount(&self) -> Result<Vec<Notification>> {
        if let Err(e) = self.bus.emit(ClientEvent::SubscribeNotifications) {
            warn!(error = %e, "failed to subscribe to notifications");
        }
        self.load_snapshot().await
    }

    /// Fetch the full list and replace the local one with it.
    pub async fn load_snapshot(&self) -> Result<Vec<Notification>> {
        let epoch = {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(SyncError::Closed);
            }
            st.snapshot_epoch += 1;
            st.snapshot_epoch
        };

        let list = self.api.list_notifications().await?;

        let mut st = self.state.lock().await;
        if st.closed {
            return Err(SyncError::Closed);
        }
        if st.snapshot_epoch == epoch {
            debug!(count = list.len(), "notification snapshot applied");
            st.list = list.clone();
        } else {
            debug!("discarding superseded notification snapshot");
        }
        Ok(list)
    }

    pub async fn apply_push(&self, event: &PushEvent) -> bool {
        let mut st = self.state.lock().await;
        if st.closed {
            return false;
        }
        let changed = reconcile(&mut st.list, event);
        if changed {
            debug!(kind = ?event.kind(), "notification list updated by push");
        }
        changed
    }

    /// Flip the read flag locally and tell the server in the background. A
    /// failed server call is logged and otherwise ignored; the caller never
    /// waits on the network.
    pub async fn mark_read(&self, id: &str) {
        {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            match st.list.iter_mut().find(|n| n.id == id) {
                Some(n) if n.read => return,
                Some(n) => n.read = true,
                None => return,
            }
        }
        let api = self.api.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = api.mark_notification_read(&id).await {
                warn!(notification = %logging::msg_id(&id), error = %e, "mark notification read failed");
            }
        });
    }

    pub async fn accept_embedded_request(
        &self,
        notification: &Notification,
    ) -> Result<EmbeddedOutcome> {
        self.respond(notification, JoinDecision::Accept).await
    }

    pub async fn reject_embedded_request(
        &self,
        notification: &Notification,
    ) -> Result<EmbeddedOutcome> {
        self.respond(notification, JoinDecision::Reject).await
    }

    async fn respond(
        &self,
        notification: &Notification,
        decision: JoinDecision,
    ) -> Result<EmbeddedOutcome> {
        let Some(_guard) = self.processing.try_acquire(notification.id.as_str()) else {
            debug!(
                notification = %logging::msg_id(&notification.id),
                "request already being processed"
            );
            return Ok(EmbeddedOutcome::AlreadyProcessing);
        };

        match self.answer(notification, decision).await {
            Ok(()) => {}
            Err(e) if e.is_benign_race() => {
                info!(
                    notification = %logging::msg_id(&notification.id),
                    "request was already processed, removing notification"
                );
            }
            Err(e) => return Err(e),
        }

        {
            let mut st = self.state.lock().await;
            if !st.closed {
                st.list.retain(|n| n.id != notification.id);
            }
        }
        if let Err(e) = self.api.delete_notification(&notification.id).await {
            warn!(
                notification = %logging::msg_id(&notification.id),
                error = %e,
                "server-side notification delete failed"
            );
        }
        Ok(EmbeddedOutcome::Done)
    }

    async fn answer(&self, notification: &Notification, decision: JoinDecision) -> Result<()> {
        let missing = |what: &str| {
            SyncError::Validation(format!("notification {} has no {what}", notification.id))
        };
        match notification.kind {
            NotificationKind::FriendRequest => {
                let friendship_id = notification
                    .friendship_id()
                    .ok_or_else(|| missing("friendship id"))?;
                match decision {
                    JoinDecision::Accept => self.api.accept_friendship(friendship_id).await,
                    JoinDecision::Reject => self.api.reject_friendship(friendship_id).await,
                }
            }
            NotificationKind::GroupJoinRequest => {
                let group_id = notification.group_id().ok_or_else(|| missing("group id"))?;
                let applicant = notification
                    .applicant_id()
                    .ok_or_else(|| missing("applicant"))?;
                self.api
                    .respond_group_request(group_id, applicant, decision)
                    .await
            }
            NotificationKind::ChurchJoinRequest => {
                let church_id = notification.church_id().ok_or_else(|| missing("church id"))?;
                let applicant = notification
                    .applicant_id()
                    .ok_or_else(|| missing("applicant"))?;
                self.api
                    .respond_church_request(church_id, applicant, decision)
                    .await
            }
            _ => Err(missing("embedded request")),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(PushEventKind::NOTIFICATIONS)
    }

    /// Apply pushed events until the bus goes away or the engine closes.
    pub async fn run(&self, mut events: Subscription) {
        while let Some(event) = events.next().await {
            if self.state.lock().await.closed {
                break;
            }
            self.apply_push(&event).await;
        }
        debug!("notification event pump stopped");
    }

    /// Re-pull the snapshot every poll interval until `shutdown` flips or
    /// the engine closes. The first pull happens one interval from now.
    pub async fn run_polling(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.load_snapshot().await {
                        Ok(_) => {}
                        Err(SyncError::Closed) => break,
                        Err(e) => warn!(error = %e, "notification poll failed"),
                    }
                }
            }
        }
        debug!("notification polling stopped");
    }

    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}
