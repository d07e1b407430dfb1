use std::net::SocketAddr;

use topicmesh_frame::RejectCode;

/// Errors that can occur in registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An active peer already holds this name at a different address.
    #[error("peer name '{peer_name}' already registered at {existing}")]
    DuplicateNameConflict {
        peer_name: String,
        existing: SocketAddr,
    },

    /// The peer has not registered yet.
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] topicmesh_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] topicmesh_frame::FrameError),
}

impl RegistryError {
    /// Wire code used when this error is reported back to a peer.
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            RegistryError::DuplicateNameConflict { .. } => Some(RejectCode::DuplicateName),
            RegistryError::UnknownPeer(_) => Some(RejectCode::UnknownPeer),
            RegistryError::Frame(err) if err.is_malformed() => Some(RejectCode::Malformed),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
