//! Conversation store - the ordered visible log of one chat
//!
//! Two sources race to put the same logical message here: the optimistic local
//! entry and the server echo on the change feed. At most one of them survives.
//!
//! Echo detection, in order:
//! 1. same server id
//! 2. same client reference (exact, when both sides carry one)
//! 3. same sender, same text, timestamps within the dedup window
//!
//! Rule 3 only applies when one side has no client reference. It can merge two
//! genuinely distinct messages with identical text sent within the window.

use crate::messages::{Message, MessageId};
use chrono::Duration;

/// What happened to a remote row offered to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Appended,
    Duplicate,
}

/// Result of resolving a pending send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmed {
    /// Placeholder swapped for the server row, re-sorted by server time
    Replaced,
    /// The echo was already visible; placeholder dropped
    Collapsed,
    /// Placeholder was gone; row added
    Inserted,
    /// Nothing to do
    AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct ConversationLog {
    entries: Vec<Message>,
    dedup_window: Duration,
}

impl ConversationLog {
    pub fn new(dedup_window: std::time::Duration) -> Self {
        Self {
            entries: Vec::new(),
            dedup_window: Duration::from_std(dedup_window).unwrap_or_else(|_| Duration::seconds(2)),
        }
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index after every entry not newer than `msg`
    fn position_for(&self, msg: &Message) -> usize {
        self.entries
            .partition_point(|e| e.created_at <= msg.created_at)
    }

    fn insert_sorted(&mut self, msg: Message) {
        let at = self.position_for(&msg);
        self.entries.insert(at, msg);
    }

    fn contains_id(&self, id: MessageId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Whether `row` is already represented by a visible entry
    pub fn is_duplicate(&self, row: &Message) -> bool {
        self.entries.iter().any(|e| self.same_message(e, row))
    }

    fn same_message(&self, local: &Message, row: &Message) -> bool {
        if local.id == row.id {
            return true;
        }
        match (&local.client_ref, &row.client_ref) {
            (Some(a), Some(b)) => a == b,
            _ => {
                let skew = local.created_at - row.created_at;
                local.sender_id == row.sender_id
                    && local.content == row.content
                    && skew < self.dedup_window
                    && skew > -self.dedup_window
            }
        }
    }

    /// Load confirmed history; rows already visible by id or client reference are skipped
    pub fn merge_history(&mut self, rows: Vec<Message>) -> usize {
        let mut added = 0;
        for row in rows {
            let known = self.entries.iter().any(|e| {
                e.id == row.id
                    || matches!((&e.client_ref, &row.client_ref), (Some(a), Some(b)) if a == b)
            });
            if !known {
                self.insert_sorted(row);
                added += 1;
            }
        }
        added
    }

    /// Show a not-yet-confirmed send
    pub fn push_optimistic(&mut self, msg: Message) {
        self.insert_sorted(msg);
    }

    /// Offer a row from the change feed
    pub fn accept_remote(&mut self, row: Message) -> Accepted {
        if self.is_duplicate(&row) {
            return Accepted::Duplicate;
        }
        self.insert_sorted(row);
        Accepted::Appended
    }

    /// Resolve the placeholder `temp_id` with the stored row
    pub fn confirm(&mut self, temp_id: u64, row: Message) -> Confirmed {
        let placeholder = self
            .entries
            .iter()
            .position(|e| e.id == MessageId::Pending(temp_id));
        let echoed = self.contains_id(row.id);

        match (placeholder, echoed) {
            (Some(idx), false) => {
                let after_prev = idx == 0 || self.entries[idx - 1].created_at <= row.created_at;
                let before_next = self
                    .entries
                    .get(idx + 1)
                    .map_or(true, |next| row.created_at <= next.created_at);
                if after_prev && before_next {
                    self.entries[idx] = row;
                } else {
                    // Server time moved the row past a neighbour
                    self.entries.remove(idx);
                    self.insert_sorted(row);
                }
                Confirmed::Replaced
            }
            (Some(idx), true) => {
                self.entries.remove(idx);
                Confirmed::Collapsed
            }
            (None, false) => {
                self.insert_sorted(row);
                Confirmed::Inserted
            }
            (None, true) => Confirmed::AlreadyPresent,
        }
    }

    /// Drop a failed send's placeholder
    pub fn rollback(&mut self, temp_id: u64) -> Option<Message> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.id == MessageId::Pending(temp_id))?;
        Some(self.entries.remove(idx))
    }

    /// Apply an updated row (read receipts); returns false if it isn't visible
    pub fn apply_update(&mut self, row: &Message) -> bool {
        match self.entries.iter_mut().find(|e| e.id == row.id) {
            Some(entry) => {
                entry.is_read = row.is_read;
                true
            }
            None => false,
        }
    }

    /// Remove a deleted row
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AdId, ConversationKey, NewMessage, UserId};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn key() -> ConversationKey {
        ConversationKey::new(AdId::new("ad-1"), UserId::new("a"), UserId::new("b"))
    }

    fn row(id: i64, from: &str, text: &str, secs: i64) -> Message {
        let to = if from == "a" { "b" } else { "a" };
        Message {
            id: MessageId::Server(id),
            ad_id: AdId::new("ad-1"),
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            content: text.to_string(),
            created_at: at(secs),
            is_read: false,
            client_ref: None,
        }
    }

    fn log() -> ConversationLog {
        ConversationLog::new(std::time::Duration::from_secs(2))
    }

    fn ids(log: &ConversationLog) -> Vec<String> {
        log.entries().iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn test_optimistic_then_confirm_keeps_position() {
        let mut log = log();
        log.merge_history(vec![row(1, "a", "hello", 0), row(2, "b", "hey", 5)]);

        let draft = NewMessage::new(&key(), &UserId::new("a"), "hi").unwrap();
        log.push_optimistic(Message::optimistic(1, &draft, at(10)));
        assert_eq!(ids(&log), vec!["1", "2", "temp-1"]);

        let mut confirmed = row(3, "a", "hi", 10);
        confirmed.client_ref = draft.client_ref.clone();
        assert_eq!(log.confirm(1, confirmed), Confirmed::Replaced);
        assert_eq!(ids(&log), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_confirm_moves_row_past_interleaved_remote() {
        let mut log = log();
        let draft = NewMessage::new(&key(), &UserId::new("a"), "mine").unwrap();
        log.push_optimistic(Message::optimistic(1, &draft, at(10)));
        log.accept_remote(row(5, "b", "theirs", 11));
        assert_eq!(ids(&log), vec!["temp-1", "5"]);

        let mut confirmed = row(6, "a", "mine", 12);
        confirmed.client_ref = draft.client_ref.clone();
        assert_eq!(log.confirm(1, confirmed), Confirmed::Replaced);
        assert_eq!(ids(&log), vec!["5", "6"]);
        assert!(log
            .entries()
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_echo_before_confirmation_collapses() {
        let mut log = log();
        let draft = NewMessage::new(&key(), &UserId::new("a"), "hi").unwrap();
        log.push_optimistic(Message::optimistic(7, &draft, at(10)));

        let mut echo = row(3, "a", "hi", 11);
        echo.client_ref = draft.client_ref.clone();
        assert_eq!(log.accept_remote(echo.clone()), Accepted::Duplicate);
        assert_eq!(log.confirm(7, echo), Confirmed::Replaced);
        assert_eq!(ids(&log), vec!["3"]);
    }

    #[test]
    fn test_echo_appended_then_confirm_drops_placeholder() {
        let mut log = log();
        let draft = NewMessage::new(&key(), &UserId::new("a"), "hi").unwrap();
        log.push_optimistic(Message::optimistic(7, &draft, at(10)));

        // Server clock far enough off that the heuristic misses and no ref came back
        let echo = row(3, "a", "hi", 30);
        assert_eq!(log.accept_remote(echo.clone()), Accepted::Appended);
        assert_eq!(log.len(), 2);

        assert_eq!(log.confirm(7, echo), Confirmed::Collapsed);
        assert_eq!(ids(&log), vec!["3"]);
    }

    #[test]
    fn test_heuristic_without_refs() {
        let mut log = log();
        log.merge_history(vec![row(1, "a", "ok", 0)]);

        assert_eq!(log.accept_remote(row(2, "a", "ok", 1)), Accepted::Duplicate);
        assert_eq!(log.accept_remote(row(3, "a", "ok", 5)), Accepted::Appended);
        assert_eq!(log.accept_remote(row(4, "b", "ok", 5)), Accepted::Appended);
    }

    #[test]
    fn test_distinct_refs_are_not_merged() {
        let mut log = log();
        let mut first = row(1, "a", "ok", 0);
        first.client_ref = Some("r1".to_string());
        log.merge_history(vec![first]);

        let mut second = row(2, "a", "ok", 1);
        second.client_ref = Some("r2".to_string());
        assert_eq!(log.accept_remote(second), Accepted::Appended);
    }

    #[test]
    fn test_rollback_restores_length() {
        let mut log = log();
        log.merge_history(vec![row(1, "a", "hello", 0)]);
        let draft = NewMessage::new(&key(), &UserId::new("a"), "lost").unwrap();
        log.push_optimistic(Message::optimistic(2, &draft, at(3)));

        let removed = log.rollback(2).unwrap();
        assert_eq!(removed.content, "lost");
        assert_eq!(ids(&log), vec!["1"]);
        assert!(log.rollback(2).is_none());
    }

    #[test]
    fn test_remote_rows_are_kept_sorted() {
        let mut log = log();
        log.merge_history(vec![row(1, "a", "x", 0), row(3, "a", "z", 20)]);
        log.accept_remote(row(2, "b", "y", 10));
        assert_eq!(ids(&log), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_merge_history_skips_known_ids() {
        let mut log = log();
        log.accept_remote(row(2, "b", "early echo", 5));
        let added = log.merge_history(vec![row(1, "a", "x", 0), row(2, "b", "early echo", 5)]);
        assert_eq!(added, 1);
        assert_eq!(ids(&log), vec!["1", "2"]);
    }

    #[test]
    fn test_merge_history_keeps_identical_texts() {
        let mut log = log();
        let added = log.merge_history(vec![row(1, "a", "ok", 0), row(2, "a", "ok", 1)]);
        assert_eq!(added, 2);
    }

    #[test]
    fn test_update_and_remove() {
        let mut log = log();
        log.merge_history(vec![row(1, "a", "x", 0)]);

        let mut read = row(1, "a", "x", 0);
        read.is_read = true;
        assert!(log.apply_update(&read));
        assert!(log.entries()[0].is_read);
        assert!(!log.apply_update(&row(9, "a", "x", 0)));

        assert!(log.remove(MessageId::Server(1)).is_some());
        assert!(log.is_empty());
    }
}
