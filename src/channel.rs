//! Realtime channel fan-out
//!
//! `ChannelHub` keeps one entry per live subscription and pushes events into
//! per-subscriber queues. A `Subscription` owns its queue; dropping it or
//! calling `unsubscribe` removes the entry, and repeated unsubscribes are no-ops.

use crate::backend::{ChangeKind, ChannelEvent, EventSpec};
use crate::messages::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    channel: String,
    specs: Vec<EventSpec>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

/// Registry of live subscriptions, shared by a backend and its handles
#[derive(Default)]
pub struct ChannelHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register one subscriber on `channel` listening for any of `specs`
    pub fn subscribe(self: &Arc<Self>, channel: &str, specs: Vec<EventSpec>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        self.lock().insert(
            id,
            Subscriber {
                channel: channel.to_string(),
                specs,
                tx,
            },
        );
        debug!(channel = %channel, id, "subscribed");

        Subscription {
            events: rx,
            handle: SubscriptionHandle {
                inner: Arc::new(HandleInner {
                    id,
                    channel: channel.to_string(),
                    active: AtomicBool::new(true),
                    hub: Arc::downgrade(self),
                }),
            },
        }
    }

    /// Deliver a row change to every matching change subscriber, returns deliveries
    pub fn publish_change(&self, table: &str, kind: ChangeKind, row: &Message) -> usize {
        let event = match kind {
            ChangeKind::Insert => ChannelEvent::Insert(row.clone()),
            ChangeKind::Update => ChannelEvent::Update(row.clone()),
            ChangeKind::Delete => ChannelEvent::Delete(row.clone()),
            ChangeKind::All => return 0,
        };

        self.deliver(&event, |_, spec| match spec {
            EventSpec::Changes {
                table: t,
                event,
                filter,
            } => t == table && event.accepts(kind) && filter.matches(row),
            EventSpec::Broadcast { .. } => false,
        })
    }

    /// Deliver a broadcast to subscribers of `channel` listening for `event`
    pub fn publish_broadcast(&self, channel: &str, event: &str, payload: serde_json::Value) -> usize {
        let message = ChannelEvent::Broadcast {
            event: event.to_string(),
            payload,
        };

        self.deliver(&message, |sub_channel, spec| {
            sub_channel == channel
                && matches!(spec, EventSpec::Broadcast { event: e } if e == event)
        })
    }

    fn deliver(&self, event: &ChannelEvent, wanted: impl Fn(&str, &EventSpec) -> bool) -> usize {
        let mut subscribers = self.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, sub) in subscribers.iter() {
            if !sub.specs.iter().any(|spec| wanted(&sub.channel, spec)) {
                continue;
            }
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        // Receivers dropped without unsubscribing
        for id in dead {
            subscribers.remove(&id);
        }

        delivered
    }

    /// Live subscriptions registered on `channel`
    pub fn live_count(&self, channel: &str) -> usize {
        self.lock()
            .values()
            .filter(|sub| sub.channel == channel)
            .count()
    }

    pub fn total_live(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, id: u64) {
        if let Some(sub) = self.lock().remove(&id) {
            debug!(channel = %sub.channel, id, "unsubscribed");
        }
    }
}

struct HandleInner {
    id: u64,
    channel: String,
    active: AtomicBool,
    hub: Weak<ChannelHub>,
}

/// Cloneable reference to one channel registration
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Release the registration. Returns true only for the call that released it.
    pub fn unsubscribe(&self) -> bool {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(hub) = self.inner.hub.upgrade() {
            hub.release(self.inner.id);
        }
        true
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live channel registration and its event queue
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Next event; `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) -> bool {
        self.handle.unsubscribe()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}
