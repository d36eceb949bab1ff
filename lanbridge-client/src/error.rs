use std::path::PathBuf;

use lanbridge_core::EnvelopeError;
use tokio_tungstenite::tungstenite;

/// Errors surfaced to callers of [`crate::BridgeClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to hub")]
    NotConnected,
    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
