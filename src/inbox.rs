//! Inbox views - per-conversation summaries and the unread badge

use crate::backend::{Backend, EventSpec, MessageQuery, RowFilter};
use crate::config::{BADGE_CAP, UNREAD_CHANNEL};
use crate::error::Result;
use crate::messages::{ConversationKey, Message, UserId};
use crate::retry::{with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One row of the inbox
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub other_user: UserId,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: usize,
}

/// Group `rows` involving `me` into conversations, most recent first
pub fn summarize(rows: &[Message], me: &UserId) -> Vec<ConversationSummary> {
    let mut by_key: HashMap<ConversationKey, ConversationSummary> = HashMap::new();

    for row in rows {
        if &row.sender_id != me && &row.receiver_id != me {
            continue;
        }
        let key = row.conversation_key();
        let unread = usize::from(&row.receiver_id == me && !row.is_read);

        match by_key.get_mut(&key) {
            Some(summary) => {
                summary.unread_count += unread;
                if row.created_at > summary.last_message_at {
                    summary.last_message = row.content.clone();
                    summary.last_message_at = row.created_at;
                }
            }
            None => {
                let other_user = if &row.sender_id == me {
                    row.receiver_id.clone()
                } else {
                    row.sender_id.clone()
                };
                by_key.insert(
                    key.clone(),
                    ConversationSummary {
                        key,
                        other_user,
                        last_message: row.content.clone(),
                        last_message_at: row.created_at,
                        unread_count: unread,
                    },
                );
            }
        }
    }

    let mut summaries: Vec<_> = by_key.into_values().collect();
    summaries.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.key.channel_name().cmp(&b.key.channel_name()))
    });
    summaries
}

/// Every conversation `me` takes part in, with retry on the read
pub async fn load_inbox(
    backend: &dyn Backend,
    me: &UserId,
    policy: &RetryPolicy,
) -> Result<Vec<ConversationSummary>> {
    let query = MessageQuery::involving(me);
    let query = &query;
    let context = format!("Load inbox for {}", me);
    let rows = with_retry(policy, &context, move || backend.query(query)).await?;
    Ok(summarize(&rows, me))
}

/// Unread messages addressed to `me` across all conversations
pub async fn unread_count(backend: &dyn Backend, me: &UserId) -> Result<usize> {
    Ok(backend.query(&MessageQuery::unread_for(me)).await?.len())
}

/// Badge text: empty for zero, capped at "9+"
pub fn badge_label(count: usize) -> String {
    match count {
        0 => String::new(),
        n if n > BADGE_CAP => format!("{}+", BADGE_CAP),
        n => n.to_string(),
    }
}

/// Live unread count for one user, recounted on every change addressed to them
pub struct UnreadWatcher {
    count: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl UnreadWatcher {
    pub async fn spawn(backend: Arc<dyn Backend>, me: UserId) -> Result<Self> {
        let mut subscription = backend
            .subscribe(
                UNREAD_CHANNEL,
                vec![EventSpec::message_changes(RowFilter::Receiver(me.clone()))],
            )
            .await?;
        let initial = unread_count(backend.as_ref(), &me).await?;
        let (tx, count) = watch::channel(initial);

        let task = tokio::spawn(async move {
            while subscription.recv().await.is_some() {
                match unread_count(backend.as_ref(), &me).await {
                    Ok(n) => {
                        debug!(user = %me, unread = n, "Unread count refreshed");
                        tx.send_replace(n);
                    }
                    Err(e) => warn!("Failed to refresh unread count for {}: {}", me, e),
                }
            }
        });

        Ok(Self { count, task })
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn badge(&self) -> String {
        badge_label(self.count())
    }

    pub fn watch(&self) -> watch::Receiver<usize> {
        self.count.clone()
    }

    /// Wait until the count satisfies `pred`
    pub async fn wait_until(&mut self, pred: impl FnMut(&usize) -> bool) -> Option<usize> {
        self.count.wait_for(pred).await.ok().map(|n| *n)
    }
}

impl Drop for UnreadWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{insert_message, Mutation, ReadScope};
    use crate::messages::{AdId, MessageId, NewMessage};
    use crate::store::SqliteBackend;
    use chrono::TimeZone;

    fn row(id: i64, ad: &str, from: &str, to: &str, text: &str, secs: i64, read: bool) -> Message {
        Message {
            id: MessageId::Server(id),
            ad_id: AdId::new(ad),
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            content: text.to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            is_read: read,
            client_ref: None,
        }
    }

    #[test]
    fn test_badge_label() {
        assert_eq!(badge_label(0), "");
        assert_eq!(badge_label(1), "1");
        assert_eq!(badge_label(9), "9");
        assert_eq!(badge_label(10), "9+");
        assert_eq!(badge_label(250), "9+");
    }

    #[test]
    fn test_summarize_groups_and_orders() {
        let me = UserId::new("alice");
        let rows = vec![
            row(1, "bike", "bob", "alice", "still for sale?", 10, true),
            row(2, "bike", "alice", "bob", "yes", 20, false),
            row(3, "sofa", "carol", "alice", "price?", 30, false),
            row(4, "bike", "bob", "alice", "I'll take it", 40, false),
            row(5, "sofa", "carol", "alice", "hello?", 35, false),
            // Not ours
            row(6, "lamp", "bob", "carol", "hi", 50, false),
        ];

        let inbox = summarize(&rows, &me);
        assert_eq!(inbox.len(), 2);

        assert_eq!(inbox[0].other_user, UserId::new("bob"));
        assert_eq!(inbox[0].last_message, "I'll take it");
        assert_eq!(inbox[0].unread_count, 1);

        assert_eq!(inbox[1].other_user, UserId::new("carol"));
        assert_eq!(inbox[1].last_message, "hello?");
        assert_eq!(inbox[1].unread_count, 2);
    }

    #[test]
    fn test_summarize_separates_ads() {
        let me = UserId::new("alice");
        let rows = vec![
            row(1, "bike", "bob", "alice", "a", 1, false),
            row(2, "sofa", "bob", "alice", "b", 2, false),
        ];
        let inbox = summarize(&rows, &me);
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].key.ad_id(), &AdId::new("sofa"));
    }

    #[tokio::test]
    async fn test_load_inbox_and_unread_count() {
        let store = SqliteBackend::open_in_memory().unwrap();
        let key = ConversationKey::new(AdId::new("bike"), UserId::new("alice"), UserId::new("bob"));
        let alice = UserId::new("alice");

        for (from, text) in [("bob", "hi"), ("alice", "hello"), ("bob", "price?")] {
            let draft = NewMessage::new(&key, &UserId::new(from), text).unwrap();
            insert_message(&store, draft).await.unwrap();
        }

        let inbox = load_inbox(&store, &alice, &RetryPolicy::default()).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].last_message, "price?");
        assert_eq!(inbox[0].unread_count, 2);
        assert_eq!(unread_count(&store, &alice).await.unwrap(), 2);
        assert_eq!(unread_count(&store, &UserId::new("bob")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unread_watcher_follows_changes() {
        let store = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let key = ConversationKey::new(AdId::new("bike"), UserId::new("alice"), UserId::new("bob"));
        let alice = UserId::new("alice");

        let mut watcher = UnreadWatcher::spawn(store.clone(), alice.clone()).await.unwrap();
        assert_eq!(watcher.count(), 0);
        assert_eq!(watcher.badge(), "");

        let draft = NewMessage::new(&key, &UserId::new("bob"), "hi").unwrap();
        insert_message(&*store, draft).await.unwrap();
        assert_eq!(watcher.wait_until(|n| *n == 1).await, Some(1));
        assert_eq!(watcher.badge(), "1");

        // Our own outgoing messages do not count
        let draft = NewMessage::new(&key, &alice, "hello").unwrap();
        insert_message(&*store, draft).await.unwrap();

        store
            .mutate(Mutation::MarkRead(ReadScope::Conversation {
                key: key.clone(),
                reader: alice.clone(),
            }))
            .await
            .unwrap();
        assert_eq!(watcher.wait_until(|n| *n == 0).await, Some(0));
    }
}
