//! Discovery broker for topicmesh.
//!
//! The registry tracks which peers publish or subscribe to which topics and
//! tells subscribers where publishers live. It never relays data: once a
//! subscriber knows a publisher's address the two talk directly.
//!
//! [`Registry`] is the in-memory bookkeeping; [`RegistryServer`] owns the
//! listening socket and the single event loop that mutates a `Registry`.

pub mod error;
pub mod registry;
pub mod server;

pub use error::{RegistryError, Result};
pub use registry::{ConnId, PeerRecord, Push, Registry};
pub use server::{RegistryConfig, RegistryServer};
pub use topicmesh_frame::DEFAULT_REGISTRY_PORT;
