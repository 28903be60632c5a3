use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::handlers::ValidationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error ({relay}): {reason}")]
    Transport { relay: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("decryption error: {0}")]
    Decryption(#[from] EnvelopeError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("entity client error: {0}")]
    Downstream(#[from] ha_client::HaError),
    #[error("nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::nostr::key::Error),
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    pub(crate) fn transport(relay: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            relay: relay.to_string(),
            reason: reason.into(),
        }
    }
}
