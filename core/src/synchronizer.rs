/// Conversation synchronizer
///
/// Holds the authoritative client-side state for one logged-in user: the
/// active conversation's ordered message list, the pending queue for
/// background conversations, the directory, presence and typing state. All
/// mutations go through a single mutex, so inbound events, page fetch
/// completions and user actions are applied one at a time.
///
/// The UI reads state through `on_active_view_change` / `on_typing_change`
/// receivers instead of holding references into it.
use crate::bridge::{BridgeAction, BridgeMessage};
use crate::directory::Directory;
use crate::error::{Result, SyncError};
use crate::ingest::{self, DirectoryChange, Route};
use crate::merge;
use crate::message_store::HistoryStore;
use crate::pending::PendingQueue;
use crate::protocol::{InboundEvent, OutboundEvent};
use crate::reconciler::{FetchTicket, PageReconciler, PageState};
use crate::session::{LocalUser, Session};
use crate::transport::Transport;
use crate::types::{
    Conversation, ConversationKey, ConversationKind, DeliveryStatus, Message, MessageId,
    MessagePage, StatusPatch, UserId,
};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Status updates kept for messages we have not seen yet
const EARLY_STATUS_LIMIT: usize = 64;

/// What the UI renders for the open conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveView {
    pub conversation: Option<ConversationKey>,
    /// Ascending by creation time, unique ids
    pub messages: Vec<Message>,
    pub state: PageState,
    /// Older history pages remain on the server
    pub has_more: bool,
}

impl Default for ActiveView {
    fn default() -> Self {
        Self {
            conversation: None,
            messages: Vec::new(),
            state: PageState::Idle,
            has_more: false,
        }
    }
}

/// Remote typing indicator for the open conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingIndicator {
    pub conversation: Option<ConversationKey>,
    /// Who is typing (peer id, or display name in groups); `None` when nobody is
    pub who: Option<String>,
}

#[derive(Debug, Clone)]
struct Settings {
    page_size: u32,
    prefetch_delay: Duration,
    typing_timeout: Duration,
}

struct SyncState {
    reconciler: Option<PageReconciler>,
    messages: Vec<Message>,
    /// Messages we already sent a read receipt for in this view
    read_acked: HashSet<MessageId>,
    pending: PendingQueue,
    directory: Directory,
    online: HashSet<UserId>,
    typing: TypingIndicator,
    /// Set while we are announcing that the local user is typing
    outgoing_typing: Option<u64>,
    typing_generation: u64,
    /// Bumped on every conversation switch
    generation: u64,
    temp_counter: u64,
    /// Receipts that matched no message, usually because the server pushed
    /// them before our `create_message` call returned
    early_status: VecDeque<StatusPatch>,
}

impl SyncState {
    fn active(&self) -> Option<&ConversationKey> {
        self.reconciler.as_ref().map(|r| r.conversation())
    }

    fn snapshot(&self) -> ActiveView {
        match &self.reconciler {
            Some(r) => ActiveView {
                conversation: Some(r.conversation().clone()),
                messages: self.messages.clone(),
                state: r.state().clone(),
                has_more: r.has_more(),
            },
            None => ActiveView::default(),
        }
    }

    /// Read receipts for every peer message in the view not yet marked read
    fn read_receipts(&mut self, local: &UserId) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        for msg in &self.messages {
            if &msg.sender == local || msg.status == DeliveryStatus::Read || msg.id.is_temporary() {
                continue;
            }
            if self.read_acked.insert(msg.id.clone()) {
                out.push(OutboundEvent::MessageRead {
                    message_id: msg.id.clone(),
                    user_id: local.clone(),
                });
            }
        }
        out
    }

    fn stop_typing(&mut self, user: &LocalUser) -> Option<OutboundEvent> {
        self.outgoing_typing.take()?;
        let key = self.active()?;
        Some(typing_event(user, key, false))
    }

    fn remember_status(&mut self, patch: StatusPatch) {
        if self.early_status.len() >= EARLY_STATUS_LIMIT {
            self.early_status.pop_front();
        }
        self.early_status.push_back(patch);
    }

    fn take_early_status(&mut self, id: &MessageId) -> Vec<StatusPatch> {
        let mut taken = Vec::new();
        self.early_status.retain(|patch| {
            if &patch.message_id == id {
                taken.push(patch.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    fn clear_view(&mut self) {
        self.generation += 1;
        self.reconciler = None;
        self.messages.clear();
        self.read_acked.clear();
    }
}

fn typing_event(user: &LocalUser, key: &ConversationKey, is_typing: bool) -> OutboundEvent {
    match key.kind {
        ConversationKind::Group => OutboundEvent::GroupTyping {
            group_id: key.id.clone(),
            sender_id: user.id.clone(),
            sender_name: user.name.clone(),
            is_typing,
        },
        ConversationKind::Direct => OutboundEvent::Typing {
            receiver_id: UserId::new(key.id.as_str()),
            sender_id: user.id.clone(),
            is_typing,
        },
    }
}

#[derive(Clone)]
pub struct Synchronizer {
    user: LocalUser,
    settings: Settings,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryStore>,
    state: Arc<Mutex<SyncState>>,
    /// Signalled whenever a page request settles
    page_done: Arc<Notify>,
    view_tx: Arc<watch::Sender<ActiveView>>,
    typing_tx: Arc<watch::Sender<TypingIndicator>>,
}

impl Synchronizer {
    pub fn new(session: &Session) -> Self {
        let config = session.config();
        let (view_tx, _) = watch::channel(ActiveView::default());
        let (typing_tx, _) = watch::channel(TypingIndicator::default());

        Self {
            user: session.user().clone(),
            settings: Settings {
                page_size: config.page_size.max(1),
                prefetch_delay: config.prefetch_delay,
                typing_timeout: config.typing_timeout,
            },
            transport: session.transport(),
            history: session.history(),
            state: Arc::new(Mutex::new(SyncState {
                reconciler: None,
                messages: Vec::new(),
                read_acked: HashSet::new(),
                pending: PendingQueue::new(
                    config.pending_max_per_conversation,
                    config.pending_max_age,
                ),
                directory: Directory::default(),
                online: HashSet::new(),
                typing: TypingIndicator::default(),
                outgoing_typing: None,
                typing_generation: 0,
                generation: 0,
                temp_counter: 0,
                early_status: VecDeque::new(),
            })),
            page_done: Arc::new(Notify::new()),
            view_tx: Arc::new(view_tx),
            typing_tx: Arc::new(typing_tx),
        }
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    // ─── UI surface ──────────────────────────────────────────────────────────

    /// Receiver that sees every change of the active view
    pub fn on_active_view_change(&self) -> watch::Receiver<ActiveView> {
        self.view_tx.subscribe()
    }

    pub fn on_typing_change(&self) -> watch::Receiver<TypingIndicator> {
        self.typing_tx.subscribe()
    }

    /// Current active view snapshot
    pub fn active_view(&self) -> ActiveView {
        self.view_tx.borrow().clone()
    }

    /// Open a conversation: reset the view, merge queued messages, load page
    /// 1 and start prefetching older pages in the background.
    ///
    /// Returns `SyncError::Fetch` if page 1 fails; the view stays open in
    /// `Failed` with whatever was queued, and calling this again retries.
    pub async fn open_conversation(&self, key: ConversationKey) -> Result<()> {
        let (ticket, outbound) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            // Reopening after a failed first page retries in place
            let retry = state
                .reconciler
                .as_mut()
                .filter(|r| r.conversation() == &key)
                .and_then(|r| r.begin_open());
            if let Some(ticket) = retry {
                self.publish(state);
                (ticket, Vec::new())
            } else {
                self.reset_view(state, &key)
            }
        };

        let task = self.spawn_page(ticket.clone(), outbound);
        info!("Opening {}", key);
        join_page(&ticket, task).await.map(|_| ())
    }

    /// Switch the view to `key`: drop the old conversation, start a fresh
    /// reconciler and merge whatever was queued for `key`.
    fn reset_view(
        &self,
        state: &mut SyncState,
        key: &ConversationKey,
    ) -> (FetchTicket, Vec<OutboundEvent>) {
        let mut outbound = Vec::new();
        outbound.extend(state.stop_typing(&self.user));
        if state.reconciler.is_some() {
            outbound.push(OutboundEvent::ChatClosed);
        }

        state.clear_view();
        let (reconciler, ticket) = PageReconciler::opening(key.clone(), state.generation);
        state.reconciler = Some(reconciler);

        let drained = state.pending.drain(key);
        if !drained.is_empty() {
            debug!("Merging {} pending messages into {}", drained.len(), key);
        }
        merge::merge_into(&mut state.messages, drained);

        outbound.push(OutboundEvent::chat_opened(key));
        outbound.extend(state.read_receipts(&self.user.id));

        self.set_typing(
            state,
            TypingIndicator {
                conversation: Some(key.clone()),
                who: None,
            },
        );
        self.publish(state);
        (ticket, outbound)
    }

    /// Load the next older page on demand (user scrolled to the top).
    /// Returns `Ok(false)` without fetching if a request is already in flight
    /// or no pages remain.
    pub async fn load_more_messages(&self) -> Result<bool> {
        let ticket = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let reconciler = state
                .reconciler
                .as_mut()
                .ok_or(SyncError::NoActiveConversation)?;
            let Some(ticket) = reconciler.begin_next() else {
                debug!(
                    "Load more ignored for {} ({:?}, has_more={})",
                    reconciler.conversation(),
                    reconciler.state(),
                    reconciler.has_more()
                );
                return Ok(false);
            };
            self.publish(state);
            ticket
        };

        let task = self.spawn_page(ticket.clone(), Vec::new());
        join_page(&ticket, task).await
    }

    /// Send a message to the open conversation with an optimistic local copy.
    ///
    /// On failure the optimistic copy is removed and the error carries the
    /// original body (`SyncError::returned_body`). There is no automatic retry.
    pub async fn send(&self, body: &str) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let (key, temp_id, outbound) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let key = state
                .active()
                .cloned()
                .ok_or(SyncError::NoActiveConversation)?;

            state.temp_counter += 1;
            let temp_id = MessageId::temporary(state.temp_counter);
            let optimistic = Message {
                id: temp_id.clone(),
                conversation: key.clone(),
                sender: self.user.id.clone(),
                receiver: (!key.is_group()).then(|| UserId::new(key.id.as_str())),
                body: body.to_string(),
                created_at: Utc::now(),
                status: DeliveryStatus::Sent,
                delivered_to: Vec::new(),
                read_by: Vec::new(),
            };
            merge::insert(&mut state.messages, optimistic);

            let outbound: Vec<_> = state.stop_typing(&self.user).into_iter().collect();
            self.publish(state);
            (key, temp_id, outbound)
        };

        // The request runs to completion even if the caller stops waiting,
        // so the optimistic copy is always confirmed or removed.
        let this = self.clone();
        let owned = body.to_string();
        let task = tokio::spawn(async move {
            this.emit_all(outbound).await;
            this.deliver(key, temp_id, owned).await
        });
        task.await.map_err(|e| SyncError::Send {
            body: body.to_string(),
            reason: e.to_string(),
        })?
    }

    async fn deliver(&self, key: ConversationKey, temp_id: MessageId, body: String) -> Result<Message> {
        match self.history.create_message(&key, &body).await {
            Ok(mut confirmed) => {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                for patch in state.take_early_status(&confirmed.id) {
                    debug!("Applying early {:?} receipt to {}", patch.status, confirmed.id);
                    confirmed.apply_patch(&patch);
                }
                if merge::replace_temporary(&mut state.messages, &temp_id, confirmed.clone()) {
                    self.publish(state);
                } else {
                    debug!("{} acknowledged after {} was closed", temp_id, key);
                }
                debug!("Sent {} to {} (was {})", confirmed.id, key, temp_id);
                Ok(confirmed)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                if merge::remove(&mut state.messages, &temp_id).is_some() {
                    self.publish(&state);
                }
                warn!("Send to {} failed: {}", key, e);
                Err(SyncError::Send {
                    body,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Record a keystroke in the composer. Announces typing once, then
    /// announces "stopped" after the typing timeout passes without another
    /// keystroke.
    pub async fn notify_typing(&self) {
        let (start, generation) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(key) = state.active().cloned() else {
                return;
            };
            state.typing_generation += 1;
            let generation = state.typing_generation;
            let start = state
                .outgoing_typing
                .replace(generation)
                .is_none()
                .then(|| typing_event(&self.user, &key, true));
            (start, generation)
        };
        self.emit_all(start.into_iter().collect()).await;

        let this = self.clone();
        tokio::spawn(async move {
            sleep(this.settings.typing_timeout).await;
            let stop = {
                let mut state = this.state.lock().await;
                if state.outgoing_typing == Some(generation) {
                    state.stop_typing(&this.user)
                } else {
                    None
                }
            };
            this.emit_all(stop.into_iter().collect()).await;
        });
    }

    /// Close the open conversation, if any
    pub async fn close_conversation(&self) {
        let outbound = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.reconciler.is_none() {
                return;
            }
            let mut outbound: Vec<_> = state.stop_typing(&self.user).into_iter().collect();
            outbound.push(OutboundEvent::ChatClosed);
            state.clear_view();
            self.set_typing(state, TypingIndicator::default());
            self.publish(state);
            outbound
        };
        self.emit_all(outbound).await;
    }

    /// Handle a message posted by the notification bridge
    pub async fn handle_bridge_message(&self, raw: &[u8]) -> Result<bool> {
        let msg = BridgeMessage::from_bytes(raw)?;
        match msg.action()? {
            BridgeAction::OpenChat(key) => {
                info!("Notification bridge requested {}", key);
                self.open_conversation(key).await?;
                Ok(true)
            }
            BridgeAction::Unsupported(action) => {
                debug!("Ignoring bridge action '{}'", action);
                Ok(false)
            }
        }
    }

    // ─── Directory & presence ────────────────────────────────────────────────

    /// Install the initial user/group listing
    pub async fn load_directory(&self, users: Vec<Conversation>, groups: Vec<Conversation>) {
        self.state.lock().await.directory.load(users, groups);
    }

    pub async fn directory(&self) -> Directory {
        self.state.lock().await.directory.clone()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.state.lock().await.online.contains(user)
    }

    /// Messages queued for a conversation that is not open
    pub async fn pending_count(&self, key: &ConversationKey) -> usize {
        self.state.lock().await.pending.len(key)
    }

    /// Queued message counts per background conversation
    pub async fn unread_counts(&self) -> Vec<(ConversationKey, usize)> {
        self.state.lock().await.pending.counts()
    }

    // ─── Live events ─────────────────────────────────────────────────────────

    /// Process inbound events in delivery order until the stream ends
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundEvent>) {
        info!("Processing live events for {}", self.user.id);
        while let Some(event) = inbound.recv().await {
            self.handle_event(event).await;
        }
        info!("Live event stream for {} ended", self.user.id);
    }

    /// Apply one inbound event
    pub async fn handle_event(&self, event: InboundEvent) {
        let name = event.event_name();
        let outbound = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut outbound = Vec::new();

            match ingest::route(event, &self.user.id, state.active()) {
                Route::Foreground {
                    conversation,
                    message,
                } => {
                    let ack = ingest::delivery_ack(&message, &self.user.id);
                    let id = message.id.clone();
                    if merge::insert(&mut state.messages, message) {
                        debug!("{} added to open conversation {}", id, conversation);
                        outbound.extend(ack);
                        outbound.extend(state.read_receipts(&self.user.id));
                        self.publish(state);
                    } else {
                        debug!("Duplicate {} ignored", id);
                    }
                }
                Route::Background {
                    conversation,
                    message,
                } => {
                    let ack = ingest::delivery_ack(&message, &self.user.id);
                    if state.pending.enqueue(conversation, message) {
                        outbound.extend(ack);
                    }
                }
                Route::Status(patch) => {
                    let in_view = merge::patch_status(&mut state.messages, &patch);
                    let queued = state.pending.patch_status(&patch);
                    if in_view {
                        self.publish(state);
                    } else if !queued {
                        debug!("Holding status update for unknown message {}", patch.message_id);
                        state.remember_status(patch);
                    }
                }
                Route::Typing {
                    conversation,
                    who,
                    is_typing,
                } => {
                    self.set_typing(
                        state,
                        TypingIndicator {
                            conversation: Some(conversation),
                            who: is_typing.then_some(who),
                        },
                    );
                }
                Route::Presence(users) => {
                    debug!("{} users online", users.len());
                    state.online = users.into_iter().collect();
                }
                Route::Directory(change) => {
                    outbound.extend(self.apply_directory_change(state, change));
                }
                Route::Ignore(reason) => {
                    debug!("Ignored {}: {}", name, reason);
                }
            }
            outbound
        };
        self.emit_all(outbound).await;
    }

    fn apply_directory_change(
        &self,
        state: &mut SyncState,
        change: DirectoryChange,
    ) -> Vec<OutboundEvent> {
        match change {
            DirectoryChange::NewUser(user) => {
                state.directory.add_user(user);
            }
            DirectoryChange::NewGroup(group) => {
                state.directory.add_group(group);
            }
            DirectoryChange::GroupUpdated(group) => {
                state.directory.update_group(group);
            }
            DirectoryChange::RemovedFromGroup(group_id) => {
                state.directory.remove_group(&group_id);
                let key = ConversationKey::group(group_id);
                if state.active() == Some(&key) {
                    info!("Removed from {}, closing it", key);
                    let mut outbound: Vec<_> = state.stop_typing(&self.user).into_iter().collect();
                    outbound.push(OutboundEvent::ChatClosed);
                    state.clear_view();
                    self.set_typing(state, TypingIndicator::default());
                    self.publish(state);
                    return outbound;
                }
                state.pending.drain(&key);
            }
        }
        Vec::new()
    }

    // ─── History pages ───────────────────────────────────────────────────────

    /// Run a page request on its own task. Dropping the caller's future
    /// then never strands the reconciler in a loading state. A first page
    /// that leaves older history starts the background prefetch.
    fn spawn_page(&self, ticket: FetchTicket, outbound: Vec<OutboundEvent>) -> JoinHandle<Result<bool>> {
        let this = self.clone();
        tokio::spawn(async move {
            this.emit_all(outbound).await;
            let result = this.fetch(&ticket).await;
            let applied = this.apply_page(&ticket, result).await?;
            if applied && ticket.page == 1 {
                this.start_prefetch(ticket.generation).await;
            }
            Ok(applied)
        })
    }

    async fn start_prefetch(&self, generation: u64) {
        let more = {
            let state = self.state.lock().await;
            state
                .reconciler
                .as_ref()
                .is_some_and(|r| r.generation() == generation && r.has_more())
        };
        if more {
            tokio::spawn(self.clone().prefetch(generation));
        }
    }

    async fn fetch(&self, ticket: &FetchTicket) -> Result<MessagePage> {
        debug!("Fetching page {} of {}", ticket.page, ticket.conversation);
        self.history
            .get_messages(&ticket.conversation, ticket.page, self.settings.page_size)
            .await
    }

    /// Apply a settled page request. Returns `Ok(false)` if the response was
    /// stale (conversation switched, or a newer request owns the state).
    async fn apply_page(&self, ticket: &FetchTicket, result: Result<MessagePage>) -> Result<bool> {
        let outcome = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(reconciler) = state.reconciler.as_mut().filter(|r| r.accepts(ticket)) else {
                debug!(
                    "Discarding page {} of {}: no longer active",
                    ticket.page, ticket.conversation
                );
                self.page_done.notify_waiters();
                return Ok(false);
            };

            match result {
                Ok(page) => {
                    reconciler.complete(ticket, &page);
                    let total = reconciler.total_pages();
                    let added = if ticket.page == 1 {
                        merge::merge_into(&mut state.messages, page.messages)
                    } else {
                        merge::prepend_page(&mut state.messages, page.messages)
                    };
                    info!(
                        "Loaded page {}/{} of {} ({} new, {} total)",
                        ticket.page,
                        total,
                        ticket.conversation,
                        added,
                        state.messages.len()
                    );
                    let receipts = state.read_receipts(&self.user.id);
                    self.publish(state);
                    Ok(receipts)
                }
                Err(e) => {
                    let reason = e.to_string();
                    reconciler.fail(ticket, reason.clone());
                    warn!(
                        "Page {} of {} failed: {}",
                        ticket.page, ticket.conversation, reason
                    );
                    self.publish(state);
                    Err(SyncError::Fetch {
                        conversation: ticket.conversation.to_string(),
                        page: ticket.page,
                        reason,
                    })
                }
            }
        };
        self.page_done.notify_waiters();

        let receipts = outcome?;
        self.emit_all(receipts).await;
        Ok(true)
    }

    /// Fetch the remaining older pages one at a time. Stops when the
    /// conversation is switched, a page fails, or history is complete.
    async fn prefetch(self, generation: u64) {
        sleep(self.settings.prefetch_delay).await;

        loop {
            let ticket = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let Some(reconciler) = state
                    .reconciler
                    .as_mut()
                    .filter(|r| r.generation() == generation)
                else {
                    debug!("Prefetch abandoned: conversation switched");
                    return;
                };

                if reconciler.state().is_loading() {
                    // A user-triggered load is in flight; wait for it to settle
                    let settled = self.page_done.notified();
                    drop(guard);
                    settled.await;
                    continue;
                }
                if matches!(reconciler.state(), PageState::Failed { .. }) {
                    return;
                }

                match reconciler.begin_next() {
                    Some(ticket) => {
                        self.publish(state);
                        ticket
                    }
                    None => {
                        debug!(
                            "History of {} complete at page {}",
                            reconciler.conversation(),
                            reconciler.loaded_page()
                        );
                        return;
                    }
                }
            };

            let result = self.fetch(&ticket).await;
            match self.apply_page(&ticket, result).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return,
            }
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn publish(&self, state: &SyncState) {
        self.view_tx.send_replace(state.snapshot());
    }

    fn set_typing(&self, state: &mut SyncState, indicator: TypingIndicator) {
        if state.typing != indicator {
            state.typing = indicator.clone();
            self.typing_tx.send_replace(indicator);
        }
    }

    async fn emit_all(&self, events: Vec<OutboundEvent>) {
        for event in events {
            let name = event.event_name();
            if let Err(e) = self.transport.emit(event).await {
                warn!("Failed to emit {}: {}", name, e);
            }
        }
    }
}

async fn join_page(ticket: &FetchTicket, task: JoinHandle<Result<bool>>) -> Result<bool> {
    task.await.map_err(|e| SyncError::Fetch {
        conversation: ticket.conversation.to_string(),
        page: ticket.page,
        reason: e.to_string(),
    })?
}
