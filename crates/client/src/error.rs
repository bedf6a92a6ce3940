//! Error types for the relay client.

/// Result type for relay client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the relay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Dialing or talking to the relay failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The relay never completed the hello/welcome exchange.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The relay refused the tunnel.
    #[error("Relay rejected the connection: {0}")]
    Rejected(String),

    /// Reconnected, but under a different public endpoint.
    #[error("Public endpoint changed from {old} to {new}")]
    EndpointChanged { old: String, new: String },

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Check if reconnecting could get past this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Handshake(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}
