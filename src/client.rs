//! Client entry points
//!
//! `ChatClient` bundles the backend, config and local user, and opens
//! sessions. `ChatWindow` is the single-pane chat UI: it shows at most one
//! conversation and closes the current one before switching.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::inbox::{self, ConversationSummary, UnreadWatcher};
use crate::messages::{ConversationKey, Message, UserId};
use crate::presence::PresenceView;
use crate::registry::SessionRegistry;
use crate::session::{ChatHandle, ChatSession, ChatView, Notifier, SendOutcome, SessionContext, TracingNotifier};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Entry point for one local user
///
/// Each client starts with its own `SessionRegistry`, so the one-open-session
/// rule holds per client. Clients that must not open the same conversation
/// side by side should share a registry via `with_registry`.
#[derive(Clone)]
pub struct ChatClient {
    ctx: SessionContext,
    registry: SessionRegistry,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn Backend>, config: Config, me: UserId) -> Self {
        Self::with_notifier(backend, config, me, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(
        backend: Arc<dyn Backend>,
        config: Config,
        me: UserId,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ctx: SessionContext {
                backend,
                config,
                me,
                notifier,
            },
            registry: SessionRegistry::new(),
        }
    }

    /// Use `registry` for open-session bookkeeping instead of a private one
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn me(&self) -> &UserId {
        &self.ctx.me
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.ctx.backend
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open a live session on `key`; fails if it is already open
    pub async fn open(&self, key: &ConversationKey) -> Result<ChatHandle> {
        let guard = self.registry.claim(key)?;
        ChatSession::open(self.ctx.clone(), key.clone(), guard).await
    }

    pub async fn inbox(&self) -> Result<Vec<ConversationSummary>> {
        inbox::load_inbox(self.ctx.backend.as_ref(), &self.ctx.me, &self.ctx.config.retry).await
    }

    pub async fn unread_count(&self) -> Result<usize> {
        inbox::unread_count(self.ctx.backend.as_ref(), &self.ctx.me).await
    }

    pub async fn watch_unread(&self) -> Result<UnreadWatcher> {
        UnreadWatcher::spawn(self.ctx.backend.clone(), self.ctx.me.clone()).await
    }
}

/// Chat pane showing at most one conversation
pub struct ChatWindow {
    client: ChatClient,
    current: Option<ChatHandle>,
}

impl ChatWindow {
    pub fn new(client: ChatClient) -> Self {
        Self {
            client,
            current: None,
        }
    }

    /// Show `key`, tearing down whatever was open before
    pub async fn open(&mut self, key: &ConversationKey) -> Result<()> {
        if self.current.as_ref().is_some_and(|c| c.key() == key && !c.is_closed()) {
            return Ok(());
        }
        self.close().await?;

        let handle = self.client.open(key).await?;
        info!(channel = %key, "Chat window switched");
        self.current = Some(handle);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.current.take() {
            Some(handle) => handle.close().await,
            None => Ok(()),
        }
    }

    pub fn current(&self) -> Option<&ChatHandle> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut ChatHandle> {
        self.current.as_mut()
    }

    fn active(&self) -> Result<&ChatHandle> {
        self.current.as_ref().ok_or(Error::SessionClosed)
    }

    pub fn input(&self, text: impl Into<String>) -> Result<()> {
        self.active()?.input(text)
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<SendOutcome> {
        self.active()?.send(text).await
    }

    /// Empty while nothing is open
    pub fn visible_log(&self) -> Vec<Message> {
        self.current
            .as_ref()
            .map(|c| c.visible_log())
            .unwrap_or_default()
    }

    pub fn presence(&self) -> PresenceView {
        self.current
            .as_ref()
            .map(|c| c.presence())
            .unwrap_or_default()
    }

    /// Change notifications for the open conversation
    pub fn changes(&self) -> Option<watch::Receiver<ChatView>> {
        self.current.as_ref().map(|c| c.watch())
    }
}
