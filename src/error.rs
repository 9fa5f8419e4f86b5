//! Error taxonomy shared by connectors, transformers and the pipeline.
//!
//! Setup-time failures (`ConnectionError`) are retried by the pipeline and
//! end the process if they can never be resolved. Per-message failures
//! (`WriteError`, `TransformError`) are logged and absorbed.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failure to establish or prepare a connector's transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("handshake with {url} timed out")]
    Timeout { url: String },

    #[error("connector is not connected")]
    NotConnected,

    #[error("connector is already being read from")]
    AlreadyReading,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A destination rejected a single message.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("connector is not connected")]
    NotConnected,

    #[error("transport rejected message: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A transformer could not rewrite a message.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("message is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),
}
