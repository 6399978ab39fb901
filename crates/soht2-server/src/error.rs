//! Tunnel error taxonomy

use soht2_proto::{CompressError, ConnectionId};
use thiserror::Error;

/// Errors surfaced by the connection registry.
///
/// Raw socket errors are translated here; callers never see transport
/// exceptions except through [`TunnelError::Io`].
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Tunnel id unknown or already closed. Terminal for the session.
    #[error("Connection {id} {reason}")]
    Gone {
        id: ConnectionId,
        reason: &'static str,
    },

    /// The target closed its side of the stream
    #[error("Connection {0} was closed by the target")]
    PeerClosed(ConnectionId),

    #[error("Failed to connect to {target}: {source}")]
    OpenFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Compression(#[from] CompressError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn not_found(id: ConnectionId) -> Self {
        TunnelError::Gone {
            id,
            reason: "not found",
        }
    }

    pub fn closed(id: ConnectionId) -> Self {
        TunnelError::Gone {
            id,
            reason: "is closed",
        }
    }

    /// Whether the client must stop exchanging on this tunnel
    pub fn is_gone(&self) -> bool {
        matches!(self, TunnelError::Gone { .. } | TunnelError::PeerClosed(_))
    }
}
