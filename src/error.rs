//! Error types for agent-mcp

use std::io;

use thiserror::Error;

/// Result type alias for agent-mcp
pub type Result<T> = std::result::Result<T, Error>;

/// agent-mcp errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The authorization server redirected back with `error=...`
    #[error("{0}")]
    Callback(String),

    /// Discovery, registration, authorization or token exchange failed
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// The handshake finished without error but nothing was persisted
    #[error("OAuth flow completed but no token was stored for {0}")]
    NoTokenStored(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error came out of the interactive handshake rather than
    /// local configuration or persistence.
    #[must_use]
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::Callback(_) | Self::OAuth(_) | Self::Http(_) | Self::NoTokenStored(_)
        )
    }
}
