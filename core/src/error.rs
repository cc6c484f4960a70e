/// Error types for the conversation synchronizer
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Live event stream dropped or refused an emission.
    /// Recovered by reconnect + re-join; never fatal.
    #[error("Transport error: {0}")]
    Transport(String),

    /// History page fetch failed. The reconciler moves to `Failed` and the
    /// same page can be requested again.
    #[error("Failed to fetch page {page} of {conversation}: {reason}")]
    Fetch {
        conversation: String,
        page: u32,
        reason: String,
    },

    /// Create-message request failed. The optimistic message has already been
    /// rolled back; `body` is handed back so the user can edit or retry.
    #[error("Failed to send message: {reason}")]
    Send { body: String, reason: String },

    #[error("No conversation is open")]
    NoActiveConversation,

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Invalid conversation key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Text to put back into the composer after a failed send.
    pub fn returned_body(&self) -> Option<&str> {
        match self {
            SyncError::Send { body, .. } => Some(body),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
