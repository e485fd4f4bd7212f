//! WebSocket transport for the event bus.
//!
//! One background task owns the connection. On every (re)connect it sends
//! `authenticate`, waits for `authenticated`, then replays the room
//! subscriptions it has seen so far. Drops are retried with exponential
//! backoff and jitter until [`WsEventBus::shutdown`] is called.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::bus::{Dispatcher, EventBus, Subscription};
use crate::config::{SyncConfig, OUTBOUND_CHANNEL_CAPACITY, WS_BACKOFF_JITTER};
use crate::error::{Result, SyncError};
use crate::events::{ClientEvent, PushEvent, PushEventKind};

pub struct WsEventBus {
    dispatcher: Arc<Dispatcher>,
    outbound: mpsc::Sender<ClientEvent>,
    shutdown: watch::Sender<bool>,
}

impl WsEventBus {
    /// Start the connection task. Returns immediately; watch
    /// [`EventBus::auth_state`] to learn when the bus is usable.
    pub fn connect(config: &SyncConfig, token: String) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::default());
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let conn = Connection {
            url: config.ws_url.clone(),
            token,
            dispatcher: dispatcher.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            rooms: Vec::new(),
            held: VecDeque::new(),
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
        };
        tokio::spawn(conn.run());

        Arc::new(Self {
            dispatcher,
            outbound,
            shutdown,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for WsEventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EventBus for WsEventBus {
    fn subscribe(&self, kinds: &[PushEventKind]) -> Subscription {
        self.dispatcher.subscribe(kinds)
    }

    fn emit(&self, event: ClientEvent) -> Result<()> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SyncError::Bus("outbound queue full".into()),
            mpsc::error::TrySendError::Closed(_) => SyncError::Bus("connection task stopped".into()),
        })
    }

    fn is_authenticated(&self) -> bool {
        self.dispatcher.is_authenticated()
    }

    fn auth_state(&self) -> watch::Receiver<bool> {
        self.dispatcher.auth_state()
    }
}

/// Apply a subscribe/unsubscribe to the set of rooms replayed on reconnect.
fn track_room(rooms: &mut Vec<ClientEvent>, event: &ClientEvent) {
    match event {
        ClientEvent::UnsubscribeConversation { conversation_id } => {
            rooms.retain(|r| {
                !matches!(r, ClientEvent::SubscribeConversation { conversation_id: c } if c == conversation_id)
            });
        }
        e if e.is_subscription() => {
            if !rooms.contains(e) {
                rooms.push(e.clone());
            }
        }
        _ => {}
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-WS_BACKOFF_JITTER..WS_BACKOFF_JITTER);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

fn is_room_event(event: &ClientEvent) -> bool {
    event.is_subscription() || matches!(event, ClientEvent::UnsubscribeConversation { .. })
}

enum Exit {
    Reconnect,
    Stop,
}

struct Connection {
    url: String,
    token: String,
    dispatcher: Arc<Dispatcher>,
    outbound: mpsc::Receiver<ClientEvent>,
    shutdown: watch::Receiver<bool>,
    rooms: Vec<ClientEvent>,
    /// Non-room frames emitted before the server confirmed our token.
    held: VecDeque<ClientEvent>,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl Connection {
    async fn run(mut self) {
        let mut backoff = self.backoff_initial;

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws_stream, _response)) => {
                    backoff = self.backoff_initial; // reset on successful connect
                    info!(url = %self.url, "event bus connected");
                    let exit = self.serve(ws_stream).await;
                    self.dispatcher.reset_authentication();
                    if let Exit::Stop = exit {
                        info!("event bus stopped");
                        return;
                    }
                    info!(retry_in = ?backoff, "event bus disconnected");
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "event bus connection failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(jittered(backoff)) => {}
            }
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    fn hold(&mut self, event: ClientEvent) {
        if self.held.len() >= OUTBOUND_CHANNEL_CAPACITY {
            warn!("too many frames waiting for authentication, dropping the oldest");
            self.held.pop_front();
        }
        self.held.push_back(event);
    }

    async fn serve<S>(&mut self, ws_stream: tokio_tungstenite::WebSocketStream<S>) -> Exit
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();

        let auth = ClientEvent::Authenticate {
            token: self.token.clone(),
        };
        match auth.encode() {
            Ok(text) => {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    warn!(error = %e, "failed to send authenticate");
                    return Exit::Reconnect;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to encode authenticate");
                return Exit::Stop;
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Exit::Stop;
                }
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match PushEvent::decode(&text) {
                        Ok(event) => {
                            let just_authenticated = matches!(event, PushEvent::Authenticated(_))
                                && !self.dispatcher.is_authenticated();
                            self.dispatcher.deliver(event);
                            if just_authenticated {
                                debug!(
                                    rooms = self.rooms.len(),
                                    held = self.held.len(),
                                    "authenticated, replaying subscriptions"
                                );
                                for room in &self.rooms {
                                    if let Ok(text) = room.encode() {
                                        if write.send(WsMessage::Text(text)).await.is_err() {
                                            return Exit::Reconnect;
                                        }
                                    }
                                }
                                while let Some(event) = self.held.pop_front() {
                                    if let Ok(text) = event.encode() {
                                        if write.send(WsMessage::Text(text)).await.is_err() {
                                            return Exit::Reconnect;
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable event frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return Exit::Reconnect,
                    Some(Err(e)) => {
                        warn!(error = %e, "event bus read error");
                        return Exit::Reconnect;
                    }
                    Some(Ok(_)) => {}
                },
                out = self.outbound.recv() => {
                    let Some(event) = out else {
                        return Exit::Stop;
                    };
                    track_room(&mut self.rooms, &event);
                    if !self.dispatcher.is_authenticated() {
                        // Rooms go out with the replay; everything else waits
                        // behind it.
                        if !is_room_event(&event) {
                            self.hold(event);
                        }
                        continue;
                    }
                    let text = match event.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode outgoing event");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        warn!(error = %e, "event bus write error");
                        return Exit::Reconnect;
                    }
                }
            }
        }
    }
}
