//! Configuration and constants

use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// All configurable paths and timings
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub retry: RetryPolicy,
    /// Remote rows within this distance of a local entry (same sender, same text) are echoes
    pub dedup_window: Duration,
    /// Quiet time after the last keystroke before "stopped typing" is broadcast
    pub typing_quiet_period: Duration,
    /// Forced expiry of a remote "typing" indicator
    pub typing_expiry: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            database: data_dir.join("marketplace-chat/chat.db"),
            retry: RetryPolicy::default(),
            dedup_window: Duration::from_millis(DEDUP_WINDOW_MS),
            typing_quiet_period: Duration::from_millis(TYPING_QUIET_PERIOD_MS),
            typing_expiry: Duration::from_millis(TYPING_EXPIRY_MS),
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            database: temp_dir.join("chat.db"),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2,
            },
            dedup_window: Duration::from_millis(DEDUP_WINDOW_MS),
            typing_quiet_period: Duration::from_millis(TYPING_QUIET_PERIOD_MS),
            typing_expiry: Duration::from_millis(TYPING_EXPIRY_MS),
        }
    }

    /// Same config pointed at a different database file
    pub fn with_database(mut self, database: impl Into<PathBuf>) -> Self {
        self.database = database.into();
        self
    }
}

pub const DEDUP_WINDOW_MS: u64 = 2000;
pub const TYPING_QUIET_PERIOD_MS: u64 = 1000;
pub const TYPING_EXPIRY_MS: u64 = 3000;

/// Table holding chat rows
pub const MESSAGES_TABLE: &str = "messages";

/// Broadcast event name for typing presence
pub const TYPING_EVENT: &str = "typing";

/// Channel used by the unread badge watcher
pub const UNREAD_CHANNEL: &str = "unread_messages";

/// Unread counts above this render as "9+"
pub const BADGE_CAP: usize = 9;
