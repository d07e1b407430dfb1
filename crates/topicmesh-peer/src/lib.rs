//! Publish/subscribe peers for topicmesh.
//!
//! A [`Peer`] registers with the registry, advertises the topics it
//! publishes and subscribes to others. Data never flows through the
//! registry: subscribers dial publishers directly and each link is a
//! reconnecting [`Connection`].

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod peer;
pub mod query;

pub use config::PeerConfig;
pub use connection::Connection;
pub use error::{PeerError, Result};
pub use handshake::{read_hello, subscribe_hello, validate_name, Hello};
pub use peer::{LinkInfo, Peer, PeerState, Subscription};
pub use query::RegistryClient;
