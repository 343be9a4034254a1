//! Error types for marketplace-chat

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    TransientBackend(String),

    #[error("History load failed after {attempts} attempts: {source}")]
    HistoryLoadFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Mark read failed: {0}")]
    MarkReadFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid conversation key: {0}")]
    InvalidConversationKey(String),

    #[error("Conversation already open: {0}")]
    ConversationAlreadyOpen(String),

    #[error("Chat session closed")]
    SessionClosed,
}

impl Error {
    /// Whether the failure is a backend hiccup worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientBackend(_) => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConversationAlreadyOpen("chat:ad-1:alice:bob".to_string());
        assert!(err.to_string().contains("chat:ad-1:alice:bob"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_history_load_failed_keeps_source() {
        let err = Error::HistoryLoadFailed {
            attempts: 3,
            source: Box::new(Error::TransientBackend("timeout".to_string())),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientBackend("503".to_string()).is_transient());
        assert!(!Error::SendFailed("nope".to_string()).is_transient());
        assert!(!Error::SessionClosed.is_transient());
    }
}
