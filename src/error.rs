//! Error types for the sync layer

use thiserror::Error;

/// Sync layer error
#[derive(Debug, Error)]
pub enum SyncError {
    /// No response was obtained from the server
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server rejected the request
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Credential refresh failed, the session has been cleared
    #[error("Session expired")]
    SessionExpired,

    /// Local precondition for a move was violated; nothing was sent
    #[error("Invalid move: {0}")]
    InvalidMove(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Durable token storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Message suitable for a transient user notification
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Api { message, .. } => message.clone(),
            SyncError::SessionExpired => "Session expired".to_string(),
            SyncError::Network(_) => "Could not reach the server".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the user must be sent back to an unauthenticated state
    pub fn requires_login(&self) -> bool {
        matches!(self, SyncError::SessionExpired)
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
