use std::time::Duration;

use crate::peer::PeerState;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] topicmesh_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] topicmesh_frame::FrameError),

    /// The registry already holds this name for another address.
    #[error("duplicate peer name: {0}")]
    DuplicateNameConflict(String),

    /// The registry does not know this peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The registry did not acknowledge in time.
    #[error("registration not acknowledged within {0:?}")]
    RegistrationTimeout(Duration),

    /// The registry did not answer an inspection query in time.
    #[error("registry query not answered within {0:?}")]
    QueryTimeout(Duration),

    /// A subscriber did not send its hello in time.
    #[error("no hello received within {0:?}")]
    HelloTimeout(Duration),

    /// A link could not be re-established within the retry budget.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A frame could not be decoded; the connection has been closed.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The registry refused the request.
    #[error("rejected by registry: {0}")]
    Rejected(String),

    /// Operation not allowed in the current state.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PeerState,
    },

    /// Peer or topic name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The peer or connection has been closed.
    #[error("closed")]
    Closed,
}

impl PeerError {
    /// Returns true if retrying on a fresh connection could help.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            PeerError::ConnectionLost(_) => true,
            PeerError::Transport(err) => err.is_connection_lost(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
