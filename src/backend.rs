//! Backend collaborator contract
//!
//! The managed store is reached through three primitives: `query`, `mutate`
//! and `subscribe` (plus `broadcast` to publish on an ephemeral channel).
//! Sessions hold an `Arc<dyn Backend>` so tests can swap in a fake.

use crate::channel::Subscription;
use crate::config::MESSAGES_TABLE;
use crate::error::{Error, Result};
use crate::messages::{AdId, ConversationKey, Message, NewMessage, UserId};
use async_trait::async_trait;

/// Which rows a query selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Both directions of one conversation
    Conversation(ConversationKey),
    /// Unread rows addressed to a user
    UnreadFor(UserId),
    /// Every row a user sent or received
    Involving(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Query against the messages table, ordered by `created_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub scope: QueryScope,
    pub order: SortOrder,
}

impl MessageQuery {
    pub fn conversation(key: &ConversationKey) -> Self {
        Self {
            scope: QueryScope::Conversation(key.clone()),
            order: SortOrder::Ascending,
        }
    }

    pub fn unread_for(user: &UserId) -> Self {
        Self {
            scope: QueryScope::UnreadFor(user.clone()),
            order: SortOrder::Ascending,
        }
    }

    pub fn involving(user: &UserId) -> Self {
        Self {
            scope: QueryScope::Involving(user.clone()),
            order: SortOrder::Descending,
        }
    }
}

/// Rows to flip to read; only rows addressed to `reader` are touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    Message { id: i64, reader: UserId },
    Conversation { key: ConversationKey, reader: UserId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(NewMessage),
    MarkRead(ReadScope),
    Delete(i64),
}

/// Row-level change kinds a subscriber can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    All,
}

impl ChangeKind {
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        *self == ChangeKind::All || *self == kind
    }
}

/// Row predicate of a change subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    Ad(AdId),
    Receiver(UserId),
    Any,
}

impl RowFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            RowFilter::Ad(ad) => &message.ad_id == ad,
            RowFilter::Receiver(user) => &message.receiver_id == user,
            RowFilter::Any => true,
        }
    }
}

/// What a subscription listens to on its channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSpec {
    Changes {
        table: String,
        event: ChangeKind,
        filter: RowFilter,
    },
    Broadcast {
        event: String,
    },
}

impl EventSpec {
    /// Inserts on the messages table matching `filter`
    pub fn message_inserts(filter: RowFilter) -> Self {
        EventSpec::Changes {
            table: MESSAGES_TABLE.to_string(),
            event: ChangeKind::Insert,
            filter,
        }
    }

    /// Every change on the messages table matching `filter`
    pub fn message_changes(filter: RowFilter) -> Self {
        EventSpec::Changes {
            table: MESSAGES_TABLE.to_string(),
            event: ChangeKind::All,
            filter,
        }
    }

    pub fn broadcast(event: &str) -> Self {
        EventSpec::Broadcast {
            event: event.to_string(),
        }
    }
}

/// Event delivered to a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Insert(Message),
    Update(Message),
    Delete(Message),
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Rows matching the query, in the requested `created_at` order
    async fn query(&self, query: &MessageQuery) -> Result<Vec<Message>>;

    /// Apply a mutation and return the affected rows
    async fn mutate(&self, mutation: Mutation) -> Result<Vec<Message>>;

    /// Register on a named channel for one or more event kinds; the subscription
    /// is live until unsubscribed or dropped
    async fn subscribe(&self, channel: &str, specs: Vec<EventSpec>) -> Result<Subscription>;

    /// Fire-and-forget publish on a broadcast channel
    async fn broadcast(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()>;
}

/// Insert one message and return the stored row
pub async fn insert_message(backend: &dyn Backend, draft: NewMessage) -> Result<Message> {
    backend
        .mutate(Mutation::Insert(draft))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::TransientBackend("insert returned no row".to_string()))
}
