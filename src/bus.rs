//! Event bus seam.
//!
//! Controllers receive an `Arc<dyn EventBus>` at construction and never
//! reach for a global connection. [`Dispatcher`] is the fan-out core shared
//! by every implementation: it owns the authentication gate and the
//! broadcast channel subscribers read from.
//!
//! The real transport lives in [`crate::ws_bus`]; [`LoopbackBus`] is an
//! in-memory implementation for tests and offline tooling.

use std::sync::Mutex;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::events::{ClientEvent, PushEvent, PushEventKind};

pub trait EventBus: Send + Sync {
    /// Receive pushed events of the given kinds. An empty slice means all
    /// kinds. Dropping the subscription unsubscribes.
    fn subscribe(&self, kinds: &[PushEventKind]) -> Subscription;

    /// Queue an event for the server.
    fn emit(&self, event: ClientEvent) -> Result<()>;

    /// Whether the server has confirmed our token on the current connection.
    fn is_authenticated(&self) -> bool;

    /// Connection-state signal. Flips to `true` on `authenticated` and back
    /// to `false` when the transport drops.
    fn auth_state(&self) -> watch::Receiver<bool>;
}

/// A filtered stream of pushed events.
pub struct Subscription {
    rx: broadcast::Receiver<PushEvent>,
    kinds: Vec<PushEventKind>,
}

impl Subscription {
    fn accepts(&self, event: &PushEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }

    /// Next matching event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<PushEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Polling snapshots cover what was skipped.
                    warn!(missed, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<PushEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

pub struct Dispatcher {
    tx: broadcast::Sender<PushEvent>,
    auth: watch::Sender<bool>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (auth, _) = watch::channel(false);
        Self { tx, auth }
    }

    /// Hand one decoded event to subscribers. Anything other than
    /// `authenticated` that arrives before authentication is dropped.
    pub fn deliver(&self, event: PushEvent) {
        match &event {
            PushEvent::Authenticated(_) => {
                self.auth.send_replace(true);
            }
            PushEvent::Unknown(name) => {
                debug!(event = %name, "ignoring unknown event");
                return;
            }
            _ if !self.is_authenticated() => {
                debug!(kind = ?event.kind(), "dropping event received before authentication");
                return;
            }
            _ => {}
        }
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Called when the transport drops; events are untrusted until the next
    /// `authenticated`.
    pub fn reset_authentication(&self) {
        self.auth.send_replace(false);
    }

    pub fn is_authenticated(&self) -> bool {
        *self.auth.borrow()
    }

    pub fn auth_state(&self) -> watch::Receiver<bool> {
        self.auth.subscribe()
    }

    pub fn subscribe(&self, kinds: &[PushEventKind]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: kinds.to_vec(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// In-memory bus. Pushed events are injected by the caller; emitted events
/// are recorded.
#[derive(Default)]
pub struct LoopbackBus {
    dispatcher: Dispatcher,
    emitted: Mutex<Vec<ClientEvent>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that has already seen `authenticated`.
    pub fn authenticated() -> Self {
        let bus = Self::new();
        bus.inject(PushEvent::Authenticated(Default::default()));
        bus
    }

    pub fn inject(&self, event: PushEvent) {
        self.dispatcher.deliver(event);
    }

    /// Simulate a transport drop.
    pub fn drop_connection(&self) {
        self.dispatcher.reset_authentication();
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.dispatcher.subscriber_count()
    }
}

impl EventBus for LoopbackBus {
    fn subscribe(&self, kinds: &[PushEventKind]) -> Subscription {
        self.dispatcher.subscribe(kinds)
    }

    fn emit(&self, event: ClientEvent) -> Result<()> {
        self.emitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.dispatcher.is_authenticated()
    }

    fn auth_state(&self) -> watch::Receiver<bool> {
        self.dispatcher.auth_state()
    }
}
