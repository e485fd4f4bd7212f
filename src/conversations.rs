//! Conversation list and active-thread synchronization.
//!
//! [`ConversationSync`] owns the conversation list for one scope and the
//! message list of the open thread. Three producers feed it: REST
//! snapshots, the user's own mutations, and pushed events. Every merge is
//! keyed by id so the order in which a REST response and its push echo
//! arrive does not matter.
//!
//! Read-marking is applied locally before the server confirms it; a sent
//! message only appears once the server has assigned its id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::SocialApi;
use crate::bus::{EventBus, Subscription};
use crate::dedup::{Acquire, InFlightLock};
use crate::error::{Result, SyncError};
use crate::events::{
    ClientEvent, ConversationReadEvent, MessagesReadEvent, PushEvent, PushEventKind,
};
use crate::logging;
use crate::models::{
    Conversation, ConversationScope, ConversationStatus, LastMessage, Message, OutgoingMessage,
};
use crate::validation::validate_message;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListPhase {
    Idle,
    Loading,
    Ready,
}

/// What `open_conversation` was asked to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversationTarget {
    Id(String),
    /// Fetch-or-create the one-to-one conversation with this user.
    Peer(String),
}

impl ConversationTarget {
    /// `"peer:<userId>"` or a bare conversation id.
    pub fn parse(target: &str) -> Self {
        match target.strip_prefix("peer:") {
            Some(user) => ConversationTarget::Peer(user.to_string()),
            None => ConversationTarget::Id(target.to_string()),
        }
    }
}

impl From<&str> for ConversationTarget {
    fn from(target: &str) -> Self {
        Self::parse(target)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActiveThread {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// A `send_message` call waiting on the server.
struct PendingSend {
    conversation_id: String,
    /// A read receipt for the conversation arrived while the call was out.
    read: bool,
}

struct State {
    phase: ListPhase,
    scope: ConversationScope,
    conversations: Vec<Conversation>,
    /// Ids returned by the last successful load of each scope.
    listed: HashMap<ConversationScope, HashSet<String>>,
    /// Peer user id -> conversation id, for one-to-one conversations.
    peer_index: HashMap<String, String>,
    active: Option<ActiveThread>,
    /// Own messages created at or before the watermark are read. Only
    /// built from server-stamped read times.
    read_watermarks: HashMap<String, DateTime<Utc>>,
    sends_in_flight: HashMap<u64, PendingSend>,
    next_send: u64,
    list_epoch: u64,
    active_epoch: u64,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Record a fresh snapshot of `scope`. Index entries pointing at
    /// conversations the previous snapshot listed and this one does not are
    /// dropped.
    fn index_peers(
        &mut self,
        local_user: &str,
        scope: ConversationScope,
        conversations: &[Conversation],
    ) {
        let ids: HashSet<String> = conversations.iter().map(|c| c.id.clone()).collect();
        if let Some(previous) = self.listed.insert(scope, ids.clone()) {
            self.peer_index
                .retain(|_, id| !previous.contains(id.as_str()) || ids.contains(id.as_str()));
        }
        for c in conversations {
            if c.participants.len() == 2 {
                if let Some(peer) = c.peer_of(local_user) {
                    self.peer_index.insert(peer.to_string(), c.id.clone());
                }
            }
        }
    }

    /// Replace, insert or drop `updated` depending on whether it still
    /// belongs to the scope on screen.
    fn reconcile(&mut self, updated: Conversation) {
        let belongs = updated.scope() == self.scope;
        match self.conversations.iter().position(|c| c.id == updated.id) {
            Some(pos) if belongs => self.conversations[pos] = updated.clone(),
            Some(pos) => {
                self.conversations.remove(pos);
            }
            None if belongs && self.phase == ListPhase::Ready => {
                self.conversations.insert(0, updated.clone())
            }
            None => {}
        }
        if let Some(thread) = self.active.as_mut() {
            if thread.conversation.id == updated.id {
                thread.conversation = updated;
            }
        }
    }

    fn forget(&mut self, conversation_id: &str) -> bool {
        self.conversations.retain(|c| c.id != conversation_id);
        for ids in self.listed.values_mut() {
            ids.remove(conversation_id);
        }
        self.peer_index.retain(|_, id| id != conversation_id);
        self.read_watermarks.remove(conversation_id);
        let was_active = self
            .active
            .as_ref()
            .is_some_and(|t| t.conversation.id == conversation_id);
        if was_active {
            self.active = None;
        }
        was_active
    }

    fn set_unread(&mut self, conversation_id: &str, user_id: &str, count: u32) {
        let apply = |c: &mut Conversation| {
            c.unread.insert(user_id.to_string(), count);
        };
        if let Some(c) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            apply(c);
        }
        if let Some(thread) = self.active.as_mut() {
            if thread.conversation.id == conversation_id {
                apply(&mut thread.conversation);
            }
        }
    }

    fn bump_last_message(&mut self, message: &Message) {
        let summary = LastMessage {
            content: message.content.clone(),
            sender_id: Some(message.sender_id.clone()),
            created_at: message.created_at,
        };
        let newer = |c: &Conversation| {
            c.last_message
                .as_ref()
                .map_or(true, |last| last.created_at <= message.created_at)
        };
        if let Some(c) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            if newer(c) {
                c.last_message = Some(summary.clone());
            }
        }
        if let Some(thread) = self.active.as_mut() {
            if thread.conversation.id == message.conversation_id && newer(&thread.conversation) {
                thread.conversation.last_message = Some(summary);
            }
        }
    }

    fn is_read_by_watermark(&self, message: &Message, local_user: &str) -> bool {
        message.sender_id == local_user
            && self
                .read_watermarks
                .get(&message.conversation_id)
                .is_some_and(|wm| message.created_at <= *wm)
    }

    /// Append to the open thread unless a message with this id is already
    /// there. Returns whether it was inserted.
    fn insert_message(&mut self, mut message: Message, local_user: &str) -> bool {
        if self.is_read_by_watermark(&message, local_user) {
            message.read = true;
        }
        let Some(thread) = self.active.as_mut() else {
            return false;
        };
        if thread.conversation.id != message.conversation_id {
            return false;
        }
        if let Some(existing) = thread.messages.iter_mut().find(|m| m.id == message.id) {
            // Read state only moves forward.
            existing.read |= message.read;
            return false;
        }
        let pos = thread
            .messages
            .iter()
            .rposition(|m| m.created_at <= message.created_at)
            .map_or(0, |p| p + 1);
        thread.messages.insert(pos, message);
        true
    }
}

pub struct ConversationSync {
    api: Arc<dyn SocialApi>,
    bus: Arc<dyn EventBus>,
    local_user: String,
    in_flight: InFlightLock,
    state: Mutex<State>,
}

impl ConversationSync {
    pub fn new(api: Arc<dyn SocialApi>, bus: Arc<dyn EventBus>, local_user: impl Into<String>) -> Self {
        Self {
            api,
            bus,
            local_user: local_user.into(),
            in_flight: InFlightLock::new(),
            state: Mutex::new(State {
                phase: ListPhase::Idle,
                scope: ConversationScope::Principal,
                conversations: Vec::new(),
                listed: HashMap::new(),
                peer_index: HashMap::new(),
                active: None,
                read_watermarks: HashMap::new(),
                sends_in_flight: HashMap::new(),
                next_send: 0,
                list_epoch: 0,
                active_epoch: 0,
                closed: false,
            }),
        }
    }

    pub async fn phase(&self) -> ListPhase {
        self.state.lock().await.phase
    }

    pub async fn scope(&self) -> ConversationScope {
        self.state.lock().await.scope
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().await.conversations.clone()
    }

    pub async fn active(&self) -> Option<ActiveThread> {
        self.state.lock().await.active.clone()
    }

    /// The local user's unread count for a listed conversation.
    pub async fn unread(&self, conversation_id: &str) -> Option<u32> {
        let st = self.state.lock().await;
        st.conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.unread_for(&self.local_user))
    }

    pub async fn total_unread(&self) -> u32 {
        let st = self.state.lock().await;
        st.conversations
            .iter()
            .map(|c| c.unread_for(&self.local_user))
            .sum()
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.bus.emit(event) {
            warn!(error = %e, "failed to emit conversation event");
        }
    }

    /// Fetch one scope and replace the local list with it.
    pub async fn load_conversation_list(
        &self,
        scope: ConversationScope,
    ) -> Result<Vec<Conversation>> {
        let epoch = {
            let mut st = self.state.lock().await;
            st.ensure_open()?;
            st.list_epoch += 1;
            st.phase = ListPhase::Loading;
            st.scope = scope;
            st.list_epoch
        };

        let result = self.api.list_conversations(scope).await;

        let mut st = self.state.lock().await;
        st.ensure_open()?;
        if st.list_epoch != epoch {
            debug!(scope = scope.as_str(), "discarding superseded conversation list");
            return result;
        }
        match result {
            Ok(list) => {
                st.index_peers(&self.local_user, scope, &list);
                st.conversations = list.clone();
                st.phase = ListPhase::Ready;
                debug!(scope = scope.as_str(), count = list.len(), "conversation list loaded");
                Ok(list)
            }
            Err(e) => {
                st.phase = if st.conversations.is_empty() {
                    ListPhase::Idle
                } else {
                    ListPhase::Ready
                };
                Err(e)
            }
        }
    }

    /// Resolve the conversation with `user_id`, issuing at most one
    /// fetch-or-create call at a time per peer. Concurrent callers wait for
    /// the one in flight and reuse its answer. The flag is true when the id
    /// came from the index rather than a call made here.
    async fn resolve_peer(&self, user_id: &str) -> Result<(String, bool)> {
        let key = format!("peer:{user_id}");
        loop {
            if let Some(id) = self.state.lock().await.peer_index.get(user_id).cloned() {
                return Ok((id, true));
            }
            match self.in_flight.acquire_or_wait(key.as_str()) {
                Acquire::Acquired(_guard) => {
                    if let Some(id) = self.state.lock().await.peer_index.get(user_id).cloned() {
                        return Ok((id, true));
                    }
                    let conversation = self.api.conversation_with_peer(user_id).await?;
                    info!(
                        peer = %logging::user_id(user_id),
                        conversation = %logging::conv_id(&conversation.id),
                        "resolved conversation with peer"
                    );
                    let id = conversation.id.clone();
                    let mut st = self.state.lock().await;
                    st.peer_index.insert(user_id.to_string(), id.clone());
                    if !st.closed {
                        st.reconcile(conversation);
                    }
                    return Ok((id, false));
                }
                Acquire::Busy(waiter) => {
                    debug!(key = %key, "waiting for in-flight fetch-or-create");
                    waiter.released().await;
                }
            }
        }
    }

    /// Open a thread: resolve the target, load its history, zero the unread
    /// badge locally, then tell the server it was read.
    pub async fn open_conversation(
        &self,
        target: impl Into<ConversationTarget>,
    ) -> Result<ActiveThread> {
        self.state.lock().await.ensure_open()?;

        let (conversation_id, peer, cached) = match target.into() {
            ConversationTarget::Id(id) => (id, None, false),
            ConversationTarget::Peer(user) => {
                let (id, cached) = self.resolve_peer(&user).await?;
                (id, Some(user), cached)
            }
        };

        let epoch = {
            let mut st = self.state.lock().await;
            st.ensure_open()?;
            st.active_epoch += 1;
            st.active_epoch
        };

        let (conversation_id, detail) = match (self.api.get_conversation(&conversation_id).await, peer) {
            (Ok(detail), _) => (conversation_id, detail),
            // The indexed conversation is gone on the server; fetch-or-create anew.
            (Err(SyncError::NotFound(_)), Some(user)) if cached => {
                self.evict_peer(&user, &conversation_id).await;
                let (id, _) = self.resolve_peer(&user).await?;
                let detail = self.api.get_conversation(&id).await?;
                (id, detail)
            }
            (Err(e), _) => return Err(e),
        };

        let (thread, previous) = {
            let mut st = self.state.lock().await;
            st.ensure_open()?;

            let mut conversation = detail.conversation;
            conversation.unread.insert(self.local_user.clone(), 0);

            let mut messages: Vec<Message> = Vec::with_capacity(detail.messages.len());
            for mut m in detail.messages {
                if messages.iter().any(|seen| seen.id == m.id) {
                    continue;
                }
                if st.is_read_by_watermark(&m, &self.local_user) {
                    m.read = true;
                }
                messages.push(m);
            }
            let thread = ActiveThread {
                conversation,
                messages,
            };

            if st.active_epoch != epoch {
                debug!(
                    conversation = %logging::conv_id(&conversation_id),
                    "discarding superseded thread load"
                );
                return Ok(thread);
            }

            let previous = st
                .active
                .as_ref()
                .map(|t| t.conversation.id.clone())
                .filter(|id| *id != conversation_id);
            st.active = Some(thread.clone());
            st.set_unread(&conversation_id, &self.local_user, 0);
            (thread, previous)
        };

        if let Some(previous) = previous {
            self.emit(ClientEvent::UnsubscribeConversation {
                conversation_id: previous,
            });
        }
        self.emit(ClientEvent::SubscribeConversation {
            conversation_id: conversation_id.clone(),
        });

        if let Err(e) = self.api.mark_conversation_read(&conversation_id).await {
            warn!(
                conversation = %logging::conv_id(&conversation_id),
                error = %e,
                "mark read failed"
            );
        }
        Ok(thread)
    }

    async fn evict_peer(&self, user_id: &str, dead_id: &str) {
        let mut st = self.state.lock().await;
        if st.peer_index.get(user_id).is_some_and(|id| id == dead_id) {
            st.peer_index.remove(user_id);
        }
        st.conversations.retain(|c| c.id != dead_id);
        for ids in st.listed.values_mut() {
            ids.remove(dead_id);
        }
        debug!(
            peer = %logging::user_id(user_id),
            conversation = %logging::conv_id(dead_id),
            "dropped stale peer conversation"
        );
    }

    /// Close the open thread without closing the controller.
    pub async fn leave_conversation(&self) {
        let left = self.state.lock().await.active.take();
        if let Some(thread) = left {
            self.emit(ClientEvent::UnsubscribeConversation {
                conversation_id: thread.conversation.id,
            });
        }
    }

    /// Send to the open thread. The message is added only after the server
    /// returns it, and only if its push echo has not already added it.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<Message> {
        validate_message(&message)?;

        let (conversation_id, ticket) = {
            let mut st = self.state.lock().await;
            st.ensure_open()?;
            let conversation_id = st
                .active
                .as_ref()
                .map(|t| t.conversation.id.clone())
                .ok_or_else(|| SyncError::Validation("no conversation is open".into()))?;
            st.next_send += 1;
            let ticket = st.next_send;
            st.sends_in_flight.insert(
                ticket,
                PendingSend {
                    conversation_id: conversation_id.clone(),
                    read: false,
                },
            );
            (conversation_id, ticket)
        };

        let result = self.api.send_message(&conversation_id, &message).await;

        let mut st = self.state.lock().await;
        let read_while_sending = st
            .sends_in_flight
            .remove(&ticket)
            .is_some_and(|pending| pending.read);
        let mut sent = result?;
        if read_while_sending || st.is_read_by_watermark(&sent, &self.local_user) {
            sent.read = true;
        }
        if st.closed {
            return Ok(sent);
        }
        if st.insert_message(sent.clone(), &self.local_user) {
            debug!(message = %logging::msg_id(&sent.id), "sent message added to thread");
        } else {
            debug!(message = %logging::msg_id(&sent.id), "sent message already present");
        }
        st.bump_last_message(&sent);
        Ok(sent)
    }

    pub async fn archive_conversation(&self, id: &str) -> Result<Conversation> {
        self.state.lock().await.ensure_open()?;
        let mut updated = self.api.archive_conversation(id).await?;
        updated.archived = true;
        self.apply_update(updated.clone()).await;
        Ok(updated)
    }

    pub async fn star_conversation(&self, id: &str) -> Result<Conversation> {
        self.state.lock().await.ensure_open()?;
        let updated = self.api.star_conversation(id).await?;
        self.apply_update(updated.clone()).await;
        Ok(updated)
    }

    /// Accept a first-contact request; the conversation leaves the pending
    /// scope.
    pub async fn accept_request(&self, id: &str) -> Result<Conversation> {
        self.state.lock().await.ensure_open()?;
        let mut updated = self.api.accept_conversation(id).await?;
        updated.status = ConversationStatus::Accepted;
        self.apply_update(updated.clone()).await;
        Ok(updated)
    }

    pub async fn decline_request(&self, id: &str) -> Result<()> {
        self.state.lock().await.ensure_open()?;
        self.api.decline_conversation(id).await?;
        self.drop_conversation(id).await;
        Ok(())
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.state.lock().await.ensure_open()?;
        self.api.delete_conversation(id).await?;
        self.drop_conversation(id).await;
        Ok(())
    }

    /// Remove all messages but keep the conversation.
    pub async fn clear_conversation(&self, id: &str) -> Result<()> {
        self.state.lock().await.ensure_open()?;
        self.api.clear_conversation(id).await?;

        let mut st = self.state.lock().await;
        if st.closed {
            return Ok(());
        }
        if let Some(c) = st.conversations.iter_mut().find(|c| c.id == id) {
            c.last_message = None;
        }
        if let Some(thread) = st.active.as_mut() {
            if thread.conversation.id == id {
                thread.messages.clear();
                thread.conversation.last_message = None;
            }
        }
        st.set_unread(id, &self.local_user, 0);
        Ok(())
    }

    async fn apply_update(&self, updated: Conversation) {
        let mut st = self.state.lock().await;
        if !st.closed {
            st.reconcile(updated);
        }
    }

    async fn drop_conversation(&self, id: &str) {
        let was_active = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            st.forget(id)
        };
        if was_active {
            self.emit(ClientEvent::UnsubscribeConversation {
                conversation_id: id.to_string(),
            });
        }
    }

    /// Merge one pushed event.
    pub async fn apply_push(&self, event: PushEvent) {
        match event {
            PushEvent::NewMessage(message) => self.on_new_message(message).await,
            PushEvent::ConversationRead(ev) => self.on_conversation_read(ev).await,
            PushEvent::MessagesReadUpdate(ev) => self.on_messages_read(ev).await,
            _ => {}
        }
    }

    async fn on_new_message(&self, message: Message) {
        let (in_active, refresh_scope) = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            let in_active = st
                .active
                .as_ref()
                .is_some_and(|t| t.conversation.id == message.conversation_id);
            if in_active {
                st.insert_message(message.clone(), &self.local_user);
                st.bump_last_message(&message);
                (true, None)
            } else if st.phase == ListPhase::Idle {
                (false, None)
            } else {
                (false, Some(st.scope))
            }
        };

        if in_active {
            if message.sender_id != self.local_user {
                self.emit(ClientEvent::MessageRead {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id.clone(),
                });
            }
            return;
        }

        if let Some(scope) = refresh_scope {
            debug!(
                conversation = %logging::conv_id(&message.conversation_id),
                "message for another conversation, refreshing list"
            );
            if let Err(e) = self.load_conversation_list(scope).await {
                warn!(error = %e, "conversation list refresh failed");
            }
        }
    }

    async fn on_conversation_read(&self, ev: ConversationReadEvent) {
        let mut st = self.state.lock().await;
        if st.closed {
            return;
        }
        let reader = ev.user_id.unwrap_or_else(|| self.local_user.clone());
        st.set_unread(&ev.conversation_id, &reader, 0);
    }

    async fn on_messages_read(&self, ev: MessagesReadEvent) {
        if ev.read_by.as_deref() == Some(self.local_user.as_str()) {
            // Our own reading of the peer's messages.
            return;
        }
        let mut st = self.state.lock().await;
        if st.closed {
            return;
        }
        // Without a server read time the receipt covers what we have sent
        // so far: the thread as it stands plus sends still in flight.
        let watermark = match ev.read_at {
            Some(read_at) => {
                let entry = st
                    .read_watermarks
                    .entry(ev.conversation_id.clone())
                    .or_insert(read_at);
                if *entry < read_at {
                    *entry = read_at;
                }
                Some(*entry)
            }
            None => None,
        };

        if watermark.is_none() {
            for pending in st
                .sends_in_flight
                .values_mut()
                .filter(|p| p.conversation_id == ev.conversation_id)
            {
                pending.read = true;
            }
        }

        if let Some(thread) = st.active.as_mut() {
            if thread.conversation.id == ev.conversation_id {
                for m in thread.messages.iter_mut().filter(|m| {
                    m.sender_id == self.local_user && watermark.map_or(true, |wm| m.created_at <= wm)
                }) {
                    m.read = true;
                }
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(PushEventKind::CONVERSATIONS)
    }

    /// Apply pushed events until the bus goes away or the controller closes.
    pub async fn run(&self, mut events: Subscription) {
        while let Some(event) = events.next().await {
            if self.state.lock().await.closed {
                break;
            }
            self.apply_push(event).await;
        }
        debug!("conversation event pump stopped");
    }

    /// Stop applying results. Requests still in flight resolve into nothing.
    pub async fn close(&self) {
        let active = {
            let mut st = self.state.lock().await;
            st.closed = true;
            st.active.take()
        };
        if let Some(thread) = active {
            self.emit(ClientEvent::UnsubscribeConversation {
                conversation_id: thread.conversation.id,
            });
        }
    }
}
