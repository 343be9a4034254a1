//! SQLite-backed message store
//!
//! A local relational store implementing `Backend`. Every committed change is
//! published through a `ChannelHub` while the connection lock is still held, so
//! subscribers observe changes in commit order.

use crate::backend::{
    Backend, ChangeKind, EventSpec, MessageQuery, Mutation, QueryScope, ReadScope, SortOrder,
};
use crate::channel::{ChannelHub, Subscription};
use crate::config::MESSAGES_TABLE;
use crate::error::{Error, Result};
use crate::messages::{validate_content, AdId, Message, MessageId, NewMessage, UserId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ad_id       TEXT NOT NULL,
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    content     TEXT NOT NULL CHECK (length(trim(content)) > 0),
    created_at  TEXT NOT NULL,
    is_read     INTEGER NOT NULL DEFAULT 0,
    client_ref  TEXT UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_messages_ad ON messages (ad_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages (receiver_id, is_read);
"#;

const COLUMNS: &str = "id, ad_id, sender_id, receiver_id, content, created_at, is_read, client_ref";

/// Backend over a SQLite database file (or memory)
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    hub: Arc<ChannelHub>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened message store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hub: ChannelHub::new(),
        })
    }

    /// Fan-out hub shared by all subscriptions on this store
    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total rows stored
    pub fn message_count(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count)
    }

    fn select(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let (clause, args): (&str, Vec<String>) = match &query.scope {
            QueryScope::Conversation(key) => {
                let (a, b) = key.participants();
                (
                    "ad_id = ?1 AND ((sender_id = ?2 AND receiver_id = ?3) OR (sender_id = ?3 AND receiver_id = ?2))",
                    vec![key.ad_id().0.clone(), a.0.clone(), b.0.clone()],
                )
            }
            QueryScope::UnreadFor(user) => {
                ("receiver_id = ?1 AND is_read = 0", vec![user.0.clone()])
            }
            QueryScope::Involving(user) => {
                ("sender_id = ?1 OR receiver_id = ?1", vec![user.0.clone()])
            }
        };
        let order = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };

        let sql = format!(
            "SELECT {} FROM messages WHERE {} ORDER BY created_at {}, id {}",
            COLUMNS, clause, order, order
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), read_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert(&self, draft: NewMessage) -> Result<Vec<Message>> {
        let content = validate_content(&draft.content)?;
        if draft.sender_id == draft.receiver_id {
            return Err(Error::InvalidMessage(
                "sender and receiver must differ".to_string(),
            ));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        // Same client reference means the same logical message
        if let Some(client_ref) = &draft.client_ref {
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM messages WHERE client_ref = ?1", COLUMNS),
                    [client_ref],
                    read_message,
                )
                .optional()?;
            if let Some(row) = existing {
                debug!(client_ref = %client_ref, "insert replayed, returning stored row");
                return Ok(vec![row]);
            }
        }

        tx.execute(
            "INSERT INTO messages (ad_id, sender_id, receiver_id, content, created_at, is_read, client_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                draft.ad_id.0,
                draft.sender_id.0,
                draft.receiver_id.0,
                content,
                format_timestamp(&Utc::now()),
                draft.client_ref,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let row = tx.query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", COLUMNS),
            [id],
            read_message,
        )?;
        tx.commit()?;

        self.hub
            .publish_change(MESSAGES_TABLE, ChangeKind::Insert, &row);
        Ok(vec![row])
    }

    fn mark_read(&self, scope: ReadScope) -> Result<Vec<Message>> {
        let (clause, args): (&str, Vec<String>) = match &scope {
            ReadScope::Message { id, reader } => (
                "id = ?1 AND receiver_id = ?2 AND is_read = 0",
                vec![id.to_string(), reader.0.clone()],
            ),
            ReadScope::Conversation { key, reader } => {
                let sender = key.other_participant(reader).ok_or_else(|| {
                    Error::InvalidMessage(format!("{} is not a participant of {}", reader, key))
                })?;
                (
                    "ad_id = ?1 AND receiver_id = ?2 AND sender_id = ?3 AND is_read = 0",
                    vec![key.ad_id().0.clone(), reader.0.clone(), sender.0.clone()],
                )
            }
        };

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM messages WHERE {} ORDER BY created_at ASC, id ASC",
                COLUMNS, clause
            ))?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), read_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for row in rows.iter_mut() {
            if let Some(id) = row.server_id() {
                tx.execute("UPDATE messages SET is_read = 1 WHERE id = ?1", [id])?;
            }
            row.is_read = true;
        }
        tx.commit()?;

        for row in &rows {
            self.hub
                .publish_change(MESSAGES_TABLE, ChangeKind::Update, row);
        }
        Ok(rows)
    }

    fn delete(&self, id: i64) -> Result<Vec<Message>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", COLUMNS),
                [id],
                read_message,
            )
            .optional()?;

        let Some(row) = existing else {
            return Ok(Vec::new());
        };
        tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
        tx.commit()?;

        self.hub
            .publish_change(MESSAGES_TABLE, ChangeKind::Delete, &row);
        Ok(vec![row])
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn query(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        self.select(query)
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Vec<Message>> {
        match mutation {
            Mutation::Insert(draft) => self.insert(draft),
            Mutation::MarkRead(scope) => self.mark_read(scope),
            Mutation::Delete(id) => self.delete(id),
        }
    }

    async fn subscribe(&self, channel: &str, specs: Vec<EventSpec>) -> Result<Subscription> {
        Ok(self.hub.subscribe(channel, specs))
    }

    async fn broadcast(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        self.hub.publish_broadcast(channel, event, payload);
        Ok(())
    }
}

/// Fixed-width RFC 3339 so text order equals time order
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let created_at: String = row.get(5)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Message {
        id: MessageId::Server(row.get(0)?),
        ad_id: AdId(row.get(1)?),
        sender_id: UserId(row.get(2)?),
        receiver_id: UserId(row.get(3)?),
        content: row.get(4)?,
        created_at,
        is_read: row.get::<_, i32>(6)? != 0,
        client_ref: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{insert_message, ChannelEvent, RowFilter};
    use crate::messages::ConversationKey;
    use tempfile::TempDir;

    fn key() -> ConversationKey {
        ConversationKey::new(AdId::new("ad-1"), UserId::new("alice"), UserId::new("bob"))
    }

    fn draft(from: &str, text: &str) -> NewMessage {
        NewMessage::new(&key(), &UserId::new(from), text).unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_timestamp() {
        let store = SqliteBackend::open_in_memory().unwrap();
        let row = insert_message(&store, draft("alice", "hello")).await.unwrap();

        assert!(row.server_id().is_some());
        assert_eq!(row.receiver_id, UserId::new("bob"));
        assert!(!row.is_read);
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conversation_query_is_ascending_and_scoped() {
        let store = SqliteBackend::open_in_memory().unwrap();
        insert_message(&store, draft("alice", "one")).await.unwrap();
        insert_message(&store, draft("bob", "two")).await.unwrap();

        let elsewhere = ConversationKey::new(AdId::new("ad-2"), UserId::new("alice"), UserId::new("bob"));
        let other = NewMessage::new(&elsewhere, &UserId::new("alice"), "other ad").unwrap();
        insert_message(&store, other).await.unwrap();

        let rows = store.query(&MessageQuery::conversation(&key())).await.unwrap();
        let texts: Vec<_> = rows.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(rows.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_replayed_client_ref_is_not_duplicated() {
        let store = SqliteBackend::open_in_memory().unwrap();
        let mut sub = store
            .subscribe("feed", vec![EventSpec::message_inserts(RowFilter::Any)])
            .await
            .unwrap();

        let d = draft("alice", "once");
        let first = insert_message(&store, d.clone()).await.unwrap();
        let second = insert_message(&store, d).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.message_count().unwrap(), 1);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_rejects_blank_content() {
        let store = SqliteBackend::open_in_memory().unwrap();
        let mut d = draft("alice", "x");
        d.content = "   ".to_string();
        assert!(matches!(
            store.mutate(Mutation::Insert(d)).await,
            Err(Error::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_incoming_unread() {
        let store = SqliteBackend::open_in_memory().unwrap();
        insert_message(&store, draft("alice", "a1")).await.unwrap();
        insert_message(&store, draft("alice", "a2")).await.unwrap();
        insert_message(&store, draft("bob", "b1")).await.unwrap();

        let bob = UserId::new("bob");
        let scope = ReadScope::Conversation { key: key(), reader: bob.clone() };
        let changed = store.mutate(Mutation::MarkRead(scope.clone())).await.unwrap();
        assert_eq!(changed.len(), 2);
        assert!(changed.iter().all(|m| m.is_read && m.receiver_id == bob));

        // Second call has nothing left to do
        let changed = store.mutate(Mutation::MarkRead(scope)).await.unwrap();
        assert!(changed.is_empty());

        let alice_unread = store
            .query(&MessageQuery::unread_for(&UserId::new("alice")))
            .await
            .unwrap();
        assert_eq!(alice_unread.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_single_message_requires_receiver() {
        let store = SqliteBackend::open_in_memory().unwrap();
        let row = insert_message(&store, draft("alice", "hi")).await.unwrap();
        let id = row.server_id().unwrap();

        let wrong = ReadScope::Message { id, reader: UserId::new("alice") };
        assert!(store.mutate(Mutation::MarkRead(wrong)).await.unwrap().is_empty());

        let right = ReadScope::Message { id, reader: UserId::new("bob") };
        assert_eq!(store.mutate(Mutation::MarkRead(right)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_publishes() {
        let store = SqliteBackend::open_in_memory().unwrap();
        let mut sub = store
            .subscribe("feed", vec![EventSpec::message_changes(RowFilter::Ad(AdId::new("ad-1")))])
            .await
            .unwrap();
        let row = insert_message(&store, draft("alice", "spam")).await.unwrap();

        let deleted = store
            .mutate(Mutation::Delete(row.server_id().unwrap()))
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(store.message_count().unwrap(), 0);

        assert!(matches!(sub.try_recv(), Some(ChannelEvent::Insert(_))));
        assert!(matches!(sub.try_recv(), Some(ChannelEvent::Delete(_))));

        // Deleting again is a no-op
        assert!(store.mutate(Mutation::Delete(row.server_id().unwrap())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/chat.db");
        {
            let store = SqliteBackend::open(&path).unwrap();
            insert_message(&store, draft("alice", "kept")).await.unwrap();
        }
        let store = SqliteBackend::open(&path).unwrap();
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn test_timestamp_format_sorts_lexically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T10:00:00.5Z").unwrap().with_timezone(&Utc);
        assert!(format_timestamp(&early) < format_timestamp(&late));
    }
}
