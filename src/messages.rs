//! Chat data model
//!
//! Messages, participants, and the order-independent conversation key that
//! both sides of a chat derive to agree on one subscription scope.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authenticated user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Listing identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AdId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for AdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// (ad, lower participant, higher participant)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    ad_id: AdId,
    low: UserId,
    high: UserId,
}

static CHANNEL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^chat:([^:\s]+):([^:\s]+):([^:\s]+)$").expect("Invalid channel regex")
});

impl ConversationKey {
    pub fn new(ad_id: AdId, a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self { ad_id, low, high }
    }

    /// Like `new`, but rejects a conversation of a user with themselves
    pub fn between(ad_id: AdId, a: UserId, b: UserId) -> Result<Self> {
        let key = Self::new(ad_id, a, b);
        if key.is_self_conversation() {
            return Err(Error::InvalidConversationKey(format!(
                "{}: participants must differ",
                key
            )));
        }
        Ok(key)
    }

    pub fn is_self_conversation(&self) -> bool {
        self.low == self.high
    }

    pub fn ad_id(&self) -> &AdId {
        &self.ad_id
    }

    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    pub fn includes(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that isn't `me`, if `me` belongs to this conversation
    pub fn other_participant(&self, me: &UserId) -> Option<&UserId> {
        if &self.low == me {
            Some(&self.high)
        } else if &self.high == me {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Name of the realtime channel carrying this conversation's events
    pub fn channel_name(&self) -> String {
        format!("chat:{}:{}:{}", self.ad_id, self.low, self.high)
    }

    /// Whether a row belongs to this conversation (either direction)
    pub fn matches(&self, message: &Message) -> bool {
        message.ad_id == self.ad_id
            && ((message.sender_id == self.low && message.receiver_id == self.high)
                || (message.sender_id == self.high && message.receiver_id == self.low))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

impl FromStr for ConversationKey {
    type Err = Error;

    /// Parse a channel name of the form `chat:<ad>:<user>:<user>`
    fn from_str(s: &str) -> Result<Self> {
        let caps = CHANNEL_PATTERN
            .captures(s.trim())
            .ok_or_else(|| Error::InvalidConversationKey(s.to_string()))?;

        let ad = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let a = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let b = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

        Self::between(AdId::new(ad), UserId::new(a), UserId::new(b))
    }
}

/// Identity of a visible log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageId {
    /// Client-assigned placeholder, never persisted
    Pending(u64),
    /// Server-assigned row id
    Server(i64),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Pending(n) => write!(f, "temp-{}", n),
            MessageId::Server(id) => write!(f, "{}", id),
        }
    }
}

/// A chat message, either confirmed by the backend or still optimistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub ad_id: AdId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    /// Client idempotency reference, persisted with the row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Message {
    /// Local placeholder for a send that hasn't been confirmed yet
    pub fn optimistic(temp_id: u64, draft: &NewMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::Pending(temp_id),
            ad_id: draft.ad_id.clone(),
            sender_id: draft.sender_id.clone(),
            receiver_id: draft.receiver_id.clone(),
            content: draft.content.clone(),
            created_at,
            is_read: false,
            client_ref: draft.client_ref.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.id, MessageId::Pending(_))
    }

    pub fn server_id(&self) -> Option<i64> {
        match self.id {
            MessageId::Server(id) => Some(id),
            MessageId::Pending(_) => None,
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(
            self.ad_id.clone(),
            self.sender_id.clone(),
            self.receiver_id.clone(),
        )
    }
}

/// Insert payload for a new message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub ad_id: AdId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl NewMessage {
    /// Build a message from `sender` to the other participant of `key`
    pub fn new(key: &ConversationKey, sender: &UserId, content: &str) -> Result<Self> {
        let content = validate_content(content)?;
        let receiver = key.other_participant(sender).ok_or_else(|| {
            Error::InvalidMessage(format!("{} is not a participant of {}", sender, key))
        })?;

        Ok(Self {
            ad_id: key.ad_id().clone(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content,
            client_ref: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}

/// Trimmed content, rejecting blank text
pub fn validate_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidMessage("content is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Broadcast payload of the typing event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: UserId,
    pub is_typing: bool,
}
