//! TCP transport for topicmesh.
//!
//! This is the lowest layer. It knows how to bind a listener, accept
//! connections, and dial a remote address with a bounded exponential
//! backoff. Everything else builds on the [`TcpStream`]s handed out here.
//!
//! [`TcpStream`]: tokio::net::TcpStream

pub mod error;
pub mod retry;
pub mod tcp;

pub use error::{Result, TransportError};
pub use retry::{Dialer, LinkState, RetryPolicy};
pub use tcp::TcpEndpoint;
