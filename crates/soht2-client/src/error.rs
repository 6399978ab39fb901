use soht2_proto::CompressError;
use thiserror::Error;

/// Error code the server uses when the target closed its side
pub const PEER_CLOSED_CODE: &str = "PEER_CLOSED";

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server no longer knows the tunnel (HTTP 410)
    #[error("Tunnel gone: {message}")]
    Gone {
        code: Option<String>,
        message: String,
    },

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Compression(#[from] CompressError),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn is_gone(&self) -> bool {
        matches!(self, ClientError::Gone { .. })
    }

    /// Gone because the target hung up; the tunnel itself still exists
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, ClientError::Gone { code: Some(code), .. } if code == PEER_CLOSED_CODE)
    }
}
