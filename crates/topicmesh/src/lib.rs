//! Topic-based publish/subscribe over TCP with a discovery registry.
//!
//! Peers register with a registry, which tells subscribers where the
//! publishers of a topic live. Data then flows over direct peer-to-peer
//! links, never through the registry.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP endpoints and the bounded-retry dialer
//! - [`frame`]: envelope types and length-prefixed framing
//! - [`registry`]: discovery bookkeeping and the registry server
//! - [`peer`]: the publish/subscribe peer and inspection client

/// Re-export transport types.
pub mod transport {
    pub use topicmesh_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use topicmesh_frame::*;
}

/// Re-export registry types.
pub mod registry {
    pub use topicmesh_registry::*;
}

/// Re-export peer types.
pub mod peer {
    pub use topicmesh_peer::*;
}
