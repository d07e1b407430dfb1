use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::tcp::TcpEndpoint;

/// Bounded exponential backoff policy for (re)connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. Zero means one attempt total.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Total connection attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Observable state of a [`Dialer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected, no attempt in progress.
    Idle,
    /// Attempt number `attempt` (1-based) is in flight.
    Connecting { attempt: u32 },
    /// The last attempt succeeded.
    Connected,
    /// Waiting `delay` after failed attempt number `attempt`.
    Backoff { attempt: u32, delay: Duration },
    /// Retries exhausted. Terminal until [`Dialer::reset`].
    Lost,
}

/// Dials one remote address with a bounded retry budget.
///
/// `Idle -> Connecting -> Connected`, and on failure
/// `Connecting -> Backoff -> Connecting ...` until the policy runs out,
/// which ends in `Lost` and [`TransportError::ConnectionLost`].
#[derive(Debug)]
pub struct Dialer {
    addr: SocketAddr,
    policy: RetryPolicy,
    state: LinkState,
    attempts: u64,
}

impl Dialer {
    pub fn new(addr: SocketAddr, policy: RetryPolicy) -> Self {
        Self {
            addr,
            policy,
            state: LinkState::Idle,
            attempts: 0,
        }
    }

    /// Remote address being dialed.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connection attempts made over the lifetime of this dialer.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Record that an established connection went away.
    pub fn disconnected(&mut self) {
        if self.state == LinkState::Connected {
            self.state = LinkState::Idle;
        }
    }

    /// Give up on the remote without dialing again.
    pub fn abandon(&mut self) {
        self.state = LinkState::Lost;
    }

    /// Dial until connected or the retry budget is spent.
    pub async fn connect(&mut self) -> Result<TcpStream> {
        if self.state == LinkState::Lost {
            return Err(TransportError::ConnectionLost {
                addr: self.addr,
                attempts: 0,
            });
        }

        let mut retry = 0u32;
        loop {
            let attempt = retry + 1;
            self.state = LinkState::Connecting { attempt };
            self.attempts += 1;

            match TcpEndpoint::connect(self.addr).await {
                Ok(stream) => {
                    self.state = LinkState::Connected;
                    return Ok(stream);
                }
                Err(err) if retry < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry);
                    debug!(addr = %self.addr, attempt, ?delay, error = %err, "connect failed, backing off");
                    self.state = LinkState::Backoff { attempt, delay };
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => {
                    warn!(addr = %self.addr, attempts = attempt, error = %err, "giving up on connection");
                    self.state = LinkState::Lost;
                    return Err(TransportError::ConnectionLost {
                        addr: self.addr,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    async fn closed_port() -> SocketAddr {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        endpoint.local_addr()
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(700));
        assert_eq!(policy.delay_for(40), Duration::from_millis(700));
    }

    #[test]
    fn none_policy_allows_single_attempt() {
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
    }

    #[tokio::test]
    async fn connects_to_listening_endpoint() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut dialer = Dialer::new(endpoint.local_addr(), fast_policy(0));
        assert_eq!(dialer.state(), LinkState::Idle);

        let _stream = dialer.connect().await.unwrap();
        assert_eq!(dialer.state(), LinkState::Connected);
        assert_eq!(dialer.attempts(), 1);

        dialer.disconnected();
        assert_eq!(dialer.state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_lost() {
        let addr = closed_port().await;
        let mut dialer = Dialer::new(addr, fast_policy(2));

        let err = dialer.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionLost { attempts: 3, .. }
        ));
        assert_eq!(dialer.state(), LinkState::Lost);
        assert_eq!(dialer.attempts(), 3);

        // Lost is terminal: no further dialing.
        assert!(dialer.connect().await.unwrap_err().is_connection_lost());
        assert_eq!(dialer.attempts(), 3);
        assert_eq!(dialer.state(), LinkState::Lost);
    }
}
