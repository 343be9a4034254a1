//! Chat session - the sync engine for one open conversation
//!
//! Each open conversation runs as a single task that owns the conversation
//! log and presence state. Everything that touches them arrives as a message:
//! UI commands, channel events, completions of spawned backend calls, and
//! presence deadlines. The UI reads a `ChatView` snapshot published over a
//! `watch` channel after every change.

use crate::backend::{
    insert_message, Backend, ChannelEvent, EventSpec, MessageQuery, Mutation, ReadScope, RowFilter,
};
use crate::channel::Subscription;
use crate::config::{Config, TYPING_EVENT};
use crate::conversation::{Accepted, ConversationLog};
use crate::error::{Error, Result};
use crate::messages::{ConversationKey, Message, NewMessage, TypingPayload, UserId};
use crate::presence::{PresenceSignal, PresenceView};
use crate::registry::OpenGuard;
use crate::retry::{with_retry, RetryPolicy};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Side effect for messages arriving from the other participant
pub trait Notifier: Send + Sync {
    fn incoming(&self, key: &ConversationKey, message: &Message);
}

/// Logs incoming messages
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn incoming(&self, key: &ConversationKey, message: &Message) {
        info!(channel = %key, from = %message.sender_id, "New message");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum HistoryState {
    Loading,
    Loaded,
    /// Retries exhausted; the log is shown empty
    Failed(String),
}

/// Snapshot of everything the chat window renders
#[derive(Debug, Clone, Serialize)]
pub struct ChatView {
    pub key: ConversationKey,
    pub messages: Vec<Message>,
    pub presence: PresenceView,
    pub input: String,
    pub sending: bool,
    pub history: HistoryState,
    /// User-visible error from the last failed send
    pub error: Option<String>,
    pub closed: bool,
}

impl ChatView {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            messages: Vec::new(),
            presence: PresenceView::default(),
            input: String::new(),
            sending: false,
            history: HistoryState::Loading,
            error: None,
            closed: false,
        }
    }
}

/// Result of asking to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Optimistic entry shown under this temporary id
    Started(u64),
    /// Blank after trimming, nothing done
    Empty,
    /// Another send is still pending, nothing done
    InFlight,
}

/// Shared collaborators for sessions of one local user
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn Backend>,
    pub config: Config,
    pub me: UserId,
    pub notifier: Arc<dyn Notifier>,
}

enum Command {
    Input(String),
    Send(String, oneshot::Sender<SendOutcome>),
    MarkRead(oneshot::Sender<usize>),
    DismissError,
    Close(oneshot::Sender<()>),
}

enum Internal {
    History(Result<Vec<Message>>),
    SendDone {
        temp_id: u64,
        content: String,
        result: Result<Message>,
    },
    MarkedRead(Vec<Message>),
}

/// Fetch a conversation, oldest first, with retry
pub async fn load_history(
    backend: &dyn Backend,
    key: &ConversationKey,
    policy: &RetryPolicy,
) -> Result<Vec<Message>> {
    let query = MessageQuery::conversation(key);
    let query = &query;
    let context = format!("Load history for {}", key);

    with_retry(policy, &context, move || backend.query(query))
        .await
        .map_err(|e| Error::HistoryLoadFailed {
            attempts: policy.max_attempts.max(1),
            source: Box::new(e),
        })
}

/// Flag every unread row addressed to `reader` in this conversation as read
pub async fn mark_conversation_read(
    backend: &dyn Backend,
    key: &ConversationKey,
    reader: &UserId,
) -> Result<Vec<Message>> {
    let scope = ReadScope::Conversation {
        key: key.clone(),
        reader: reader.clone(),
    };
    backend
        .mutate(Mutation::MarkRead(scope))
        .await
        .map_err(|e| Error::MarkReadFailed(e.to_string()))
}

/// Client side of an open session
pub struct ChatHandle {
    key: ConversationKey,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<ChatView>,
}

impl ChatHandle {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed)
    }

    /// Input box changed
    pub fn input(&self, text: impl Into<String>) -> Result<()> {
        self.command(Command::Input(text.into()))
    }

    /// Send a message; returns once the optimistic entry is visible
    pub async fn send(&self, text: impl Into<String>) -> Result<SendOutcome> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Send(text.into(), tx))?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Mark the conversation read; returns the number of rows flipped
    pub async fn mark_read(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::MarkRead(tx))?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    pub fn dismiss_error(&self) -> Result<()> {
        self.command(Command::DismissError)
    }

    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn visible_log(&self) -> Vec<Message> {
        self.view.borrow().messages.clone()
    }

    pub fn presence(&self) -> PresenceView {
        self.view.borrow().presence.clone()
    }

    /// Receiver notified on every log or presence change
    pub fn watch(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Wait for the next published change
    pub async fn changed(&mut self) -> Result<ChatView> {
        self.view.changed().await.map_err(|_| Error::SessionClosed)?;
        Ok(self.view.borrow_and_update().clone())
    }

    /// Wait until the view satisfies `pred`
    pub async fn wait_until(&mut self, pred: impl FnMut(&ChatView) -> bool) -> Result<ChatView> {
        let view = self
            .view
            .wait_for(pred)
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(view.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed() || self.view.borrow().closed
    }

    /// Tear the session down and wait until its subscription is released
    pub async fn close(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Close(tx)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// Event loop state of one open conversation
pub struct ChatSession {
    ctx: SessionContext,
    key: ConversationKey,
    other: UserId,
    log: ConversationLog,
    presence: PresenceSignal,
    input: String,
    sending: bool,
    history: HistoryState,
    error: Option<String>,
    next_temp_id: u64,
    subscription: Subscription,
    feed_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    typing_tx: mpsc::UnboundedSender<TypingPayload>,
    view_tx: watch::Sender<ChatView>,
    _guard: OpenGuard,
}

impl ChatSession {
    /// Subscribe to the conversation channel, start loading history, and spawn the loop
    pub async fn open(ctx: SessionContext, key: ConversationKey, guard: OpenGuard) -> Result<ChatHandle> {
        if key.is_self_conversation() {
            return Err(Error::InvalidConversationKey(format!(
                "{}: participants must differ",
                key
            )));
        }
        let other = key.other_participant(&ctx.me).cloned().ok_or_else(|| {
            Error::InvalidConversationKey(format!("{} is not a participant of {}", ctx.me, key))
        })?;

        let channel = key.channel_name();
        let subscription = ctx
            .backend
            .subscribe(
                &channel,
                vec![
                    EventSpec::message_changes(RowFilter::Ad(key.ad_id().clone())),
                    EventSpec::broadcast(TYPING_EVENT),
                ],
            )
            .await?;
        info!(channel = %channel, user = %ctx.me, "Opened conversation");

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ChatView::new(key.clone()));
        let typing_tx = spawn_typing_broadcaster(ctx.backend.clone(), channel);

        let presence = PresenceSignal::new(
            ctx.me.clone(),
            other.clone(),
            ctx.config.typing_quiet_period,
            ctx.config.typing_expiry,
        );

        let session = ChatSession {
            log: ConversationLog::new(ctx.config.dedup_window),
            presence,
            key: key.clone(),
            other,
            input: String::new(),
            sending: false,
            history: HistoryState::Loading,
            error: None,
            next_temp_id: 0,
            subscription,
            feed_open: true,
            commands,
            internal_tx,
            internal_rx,
            typing_tx,
            view_tx,
            _guard: guard,
            ctx,
        };

        session.spawn_initial_load();
        tokio::spawn(session.run());

        Ok(ChatHandle {
            key,
            commands: command_tx,
            view: view_rx,
        })
    }

    /// History first, then the bulk read receipt
    fn spawn_initial_load(&self) {
        let backend = self.ctx.backend.clone();
        let key = self.key.clone();
        let me = self.ctx.me.clone();
        let policy = self.ctx.config.retry.clone();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let history = load_history(backend.as_ref(), &key, &policy).await;
            let loaded = history.is_ok();
            if internal.send(Internal::History(history)).is_err() || !loaded {
                return;
            }

            match mark_conversation_read(backend.as_ref(), &key, &me).await {
                Ok(rows) => {
                    let _ = internal.send(Internal::MarkedRead(rows));
                }
                Err(e) => warn!("Failed to mark {} read: {}", key, e),
            }
        });
    }

    async fn run(mut self) {
        let mut close_ack = None;

        loop {
            let deadline = self.presence.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close(ack)) => {
                        close_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = self.subscription.recv(), if self.feed_open => match event {
                    Some(event) => self.on_channel_event(event),
                    None => {
                        warn!(channel = %self.key, "Change feed ended");
                        self.feed_open = false;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timers(Instant::now());
                }
            }
        }

        self.teardown();
        // The claim is released before the close is acknowledged
        drop(self);
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Input(text) => {
                let payload = self
                    .presence
                    .on_local_input(!text.trim().is_empty(), Instant::now());
                self.input = text;
                self.broadcast_typing(payload);
                self.publish();
            }
            Command::Send(text, reply) => {
                let outcome = self.start_send(&text);
                let _ = reply.send(outcome);
            }
            Command::MarkRead(reply) => self.spawn_mark_read(reply),
            Command::DismissError => {
                if self.error.take().is_some() {
                    self.publish();
                }
            }
            // Handled by the loop
            Command::Close(_) => {}
        }
    }

    fn start_send(&mut self, text: &str) -> SendOutcome {
        if self.sending {
            debug!(channel = %self.key, "Send ignored, another send in flight");
            return SendOutcome::InFlight;
        }
        let draft = match NewMessage::new(&self.key, &self.ctx.me, text) {
            Ok(draft) => draft,
            Err(_) => return SendOutcome::Empty,
        };

        let stop = self.presence.on_send();
        self.broadcast_typing(stop);

        self.next_temp_id += 1;
        let temp_id = self.next_temp_id;
        self.log
            .push_optimistic(Message::optimistic(temp_id, &draft, Utc::now()));
        self.input.clear();
        self.sending = true;
        self.error = None;
        self.publish();

        let backend = self.ctx.backend.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let content = draft.content.clone();
            // Single attempt; a retried insert could post twice
            let result = insert_message(backend.as_ref(), draft).await;
            let _ = internal.send(Internal::SendDone {
                temp_id,
                content,
                result,
            });
        });

        SendOutcome::Started(temp_id)
    }

    fn spawn_mark_read(&self, reply: oneshot::Sender<usize>) {
        let backend = self.ctx.backend.clone();
        let key = self.key.clone();
        let me = self.ctx.me.clone();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let changed = match mark_conversation_read(backend.as_ref(), &key, &me).await {
                Ok(rows) => {
                    let count = rows.len();
                    let _ = internal.send(Internal::MarkedRead(rows));
                    count
                }
                Err(e) => {
                    warn!("Failed to mark {} read: {}", key, e);
                    0
                }
            };
            let _ = reply.send(changed);
        });
    }

    fn spawn_mark_one_read(&self, id: i64) {
        let backend = self.ctx.backend.clone();
        let scope = ReadScope::Message {
            id,
            reader: self.ctx.me.clone(),
        };
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            match backend.mutate(Mutation::MarkRead(scope)).await {
                Ok(rows) => {
                    let _ = internal.send(Internal::MarkedRead(rows));
                }
                Err(e) => warn!("Failed to mark message {} read: {}", id, e),
            }
        });
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Insert(row) => self.on_remote_insert(row),
            ChannelEvent::Update(row) => {
                if self.key.matches(&row) && self.log.apply_update(&row) {
                    self.publish();
                }
            }
            ChannelEvent::Delete(row) => {
                if self.key.matches(&row) && self.log.remove(row.id).is_some() {
                    self.publish();
                }
            }
            ChannelEvent::Broadcast { event, payload } => {
                if event != TYPING_EVENT {
                    return;
                }
                match serde_json::from_value::<TypingPayload>(payload) {
                    Ok(typing) => {
                        if self.presence.on_remote_typing(&typing, Instant::now()) {
                            self.publish();
                        }
                    }
                    Err(e) => debug!("Ignoring malformed typing payload: {}", e),
                }
            }
        }
    }

    fn on_remote_insert(&mut self, row: Message) {
        if !self.key.matches(&row) {
            return;
        }

        let from_other = row.sender_id == self.other;
        let to_me = row.receiver_id == self.ctx.me;
        let server_id = row.server_id();

        if self.log.accept_remote(row.clone()) == Accepted::Duplicate {
            debug!(channel = %self.key, id = ?server_id, "Dropped echo of visible message");
            return;
        }

        if from_other {
            self.ctx.notifier.incoming(&self.key, &row);
        }
        if to_me && !row.is_read {
            if let Some(id) = server_id {
                self.spawn_mark_one_read(id);
            }
        }
        self.publish();
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::History(Ok(rows)) => {
                let added = self.log.merge_history(rows);
                debug!(channel = %self.key, added, "History loaded");
                self.history = HistoryState::Loaded;
            }
            Internal::History(Err(e)) => {
                error!("Failed to load history for {}: {}", self.key, e);
                self.history = HistoryState::Failed(e.to_string());
            }
            Internal::SendDone {
                temp_id,
                content,
                result,
            } => {
                self.sending = false;
                match result {
                    Ok(row) => {
                        let outcome = self.log.confirm(temp_id, row);
                        debug!(channel = %self.key, temp_id, ?outcome, "Send confirmed");
                    }
                    Err(e) => {
                        error!("Failed to send message in {}: {}", self.key, e);
                        self.log.rollback(temp_id);
                        self.input = content;
                        self.error = Some(Error::SendFailed(e.to_string()).to_string());
                    }
                }
            }
            Internal::MarkedRead(rows) => {
                for row in &rows {
                    self.log.apply_update(row);
                }
            }
        }
        self.publish();
    }

    fn on_timers(&mut self, now: Instant) {
        let fired = self.presence.fire_due(now);
        if let Some(stop) = fired.stop_broadcast {
            self.broadcast_typing(stop);
        }
        if fired.remote_expired {
            self.publish();
        }
    }

    fn broadcast_typing(&self, payload: TypingPayload) {
        let _ = self.typing_tx.send(payload);
    }

    fn snapshot(&self, closed: bool) -> ChatView {
        ChatView {
            key: self.key.clone(),
            messages: self.log.entries().to_vec(),
            presence: self.presence.view(),
            input: self.input.clone(),
            sending: self.sending,
            history: self.history.clone(),
            error: self.error.clone(),
            closed,
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.snapshot(false));
    }

    fn teardown(&mut self) {
        self.subscription.unsubscribe();
        if self.presence.local_typing() {
            let stop = self.presence.on_send();
            self.broadcast_typing(stop);
        }
        self.presence.reset();
        self.view_tx.send_replace(self.snapshot(true));
        info!(channel = %self.key, "Closed conversation");
    }
}

/// Serialises typing broadcasts for one channel so they go out in order
fn spawn_typing_broadcaster(
    backend: Arc<dyn Backend>,
    channel: String,
) -> mpsc::UnboundedSender<TypingPayload> {
    let (tx, mut rx) = mpsc::unbounded_channel::<TypingPayload>();

    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let value = match serde_json::to_value(&payload) {
                Ok(value) => value,
                Err(e) => {
                    debug!("Unencodable typing payload: {}", e);
                    continue;
                }
            };
            if let Err(e) = backend.broadcast(&channel, TYPING_EVENT, value).await {
                debug!(channel = %channel, "Typing broadcast failed: {}", e);
            }
        }
    });

    tx
}
