use std::net::SocketAddr;
use std::time::Duration;

use topicmesh_frame::{FrameConfig, DEFAULT_REGISTRY_PORT};
use topicmesh_transport::RetryPolicy;

/// Default time to wait for the registry to acknowledge a request.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`Peer`](crate::Peer).
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Unique name within the registry.
    pub name: String,
    /// Where the peer accepts subscriber connections. Port 0 picks one.
    pub listen_addr: SocketAddr,
    pub registry_addr: SocketAddr,
    /// Also bounds how long a publisher waits for a subscriber's hello.
    pub registration_timeout: Duration,
    /// Applies to the registry link and every subscriber link.
    pub retry: RetryPolicy,
    /// Send `heartbeat` to the registry this often. `None` disables it.
    pub heartbeat_interval: Option<Duration>,
    pub frame: FrameConfig,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            registry_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_REGISTRY_PORT)),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            retry: RetryPolicy::default(),
            heartbeat_interval: None,
            frame: FrameConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry_addr: SocketAddr) -> Self {
        self.registry_addr = registry_addr;
        self
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }
}
