//! Open-conversation registry
//!
//! At most one session may be open per conversation key. Opening claims the
//! key and returns an `OpenGuard`; the key is free again once the guard drops.

use crate::error::{Error, Result};
use crate::messages::ConversationKey;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    open: Mutex<HashSet<ConversationKey>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashSet<ConversationKey>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Tracks which conversations currently have a live session
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`; fails if a session for it is already open
    pub fn claim(&self, key: &ConversationKey) -> Result<OpenGuard> {
        if !self.inner.lock().insert(key.clone()) {
            return Err(Error::ConversationAlreadyOpen(key.to_string()));
        }
        debug!(channel = %key, "claimed");

        Ok(OpenGuard {
            key: key.clone(),
            inner: self.inner.clone(),
        })
    }

    pub fn is_open(&self, key: &ConversationKey) -> bool {
        self.inner.lock().contains(key)
    }

    /// Currently open keys, in no particular order
    pub fn open_keys(&self) -> Vec<ConversationKey> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Claim on one conversation key, released on drop
#[derive(Debug)]
pub struct OpenGuard {
    key: ConversationKey,
    inner: Arc<Inner>,
}

impl OpenGuard {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.inner.lock().remove(&self.key);
        debug!(channel = %self.key, "released");
    }
}
