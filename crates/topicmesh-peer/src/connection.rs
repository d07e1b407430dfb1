use std::net::SocketAddr;

use futures_util::Stream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use topicmesh_frame::{Envelope, EnvelopeReader, EnvelopeWriter, FrameConfig, FrameError};
use topicmesh_transport::{Dialer, LinkState, RetryPolicy, TransportError};

use crate::error::{PeerError, Result};

struct Link {
    reader: EnvelopeReader<OwnedReadHalf>,
    writer: EnvelopeWriter<OwnedWriteHalf>,
}

/// A dialed, full-duplex envelope link that reconnects on I/O failure.
///
/// Reconnects follow the [`RetryPolicy`]; once it is spent the link is
/// `Lost` and every call fails with [`PeerError::ConnectionLost`]. An
/// optional hello envelope is replayed after each successful connect. A
/// malformed frame closes the link for good.
pub struct Connection {
    dialer: Dialer,
    hello: Option<Envelope>,
    frame: FrameConfig,
    link: Option<Link>,
    /// Reconnects since the last envelope moved in either direction.
    redials: u32,
    closed: bool,
}

impl Connection {
    /// Create an unconnected link. The first `send`/`recv` dials.
    pub fn new(
        addr: SocketAddr,
        policy: RetryPolicy,
        frame: FrameConfig,
        hello: Option<Envelope>,
    ) -> Self {
        Self {
            dialer: Dialer::new(addr, policy),
            hello,
            frame,
            link: None,
            redials: 0,
            closed: false,
        }
    }

    /// Dial `addr` (with retries) and send `hello` if given.
    pub async fn open(
        addr: SocketAddr,
        policy: RetryPolicy,
        frame: FrameConfig,
        hello: Option<Envelope>,
    ) -> Result<Self> {
        let mut conn = Self::new(addr, policy, frame, hello);
        conn.establish().await?;
        Ok(conn)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.dialer.addr()
    }

    pub fn state(&self) -> LinkState {
        self.dialer.state()
    }

    /// Dial attempts made over the lifetime of this connection.
    pub fn attempts(&self) -> u64 {
        self.dialer.attempts()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Send one envelope, reconnecting and re-sending on I/O failure.
    pub async fn send(&mut self, envelope: Envelope) -> Result<()> {
        loop {
            self.ensure_open().await?;
            let Some(link) = self.link.as_mut() else {
                continue;
            };

            match link.writer.send(envelope.clone()).await {
                Ok(()) => {
                    self.redials = 0;
                    return Ok(());
                }
                Err(err) if err.is_malformed() => return Err(PeerError::Frame(err)),
                Err(err) => {
                    debug!(addr = %self.remote_addr(), error = %err, "send failed, reconnecting");
                    self.drop_link();
                }
            }
        }
    }

    /// Receive the next envelope, reconnecting when the remote goes away.
    pub async fn recv(&mut self) -> Result<Envelope> {
        loop {
            self.ensure_open().await?;
            let Some(link) = self.link.as_mut() else {
                continue;
            };

            match link.reader.recv().await {
                Ok(envelope) => {
                    self.redials = 0;
                    return Ok(envelope);
                }
                Err(err) if err.is_malformed() => {
                    warn!(addr = %self.remote_addr(), error = %err, "malformed envelope, closing link");
                    self.close().await;
                    return Err(PeerError::MalformedEnvelope(err.to_string()));
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!(addr = %self.remote_addr(), "remote closed link, reconnecting");
                    self.drop_link();
                }
                Err(err) => {
                    debug!(addr = %self.remote_addr(), error = %err, "receive failed, reconnecting");
                    self.drop_link();
                }
            }
        }
    }

    /// Turn the connection into a stream of envelopes.
    ///
    /// The stream yields the first error and then ends; a clean `close`
    /// ends it without an error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Envelope>> {
        futures_util::stream::unfold(Some(self), |conn| async move {
            let mut conn = conn?;
            match conn.recv().await {
                Ok(envelope) => Some((Ok(envelope), Some(conn))),
                Err(PeerError::Closed) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Shut the link down. Later calls fail with [`PeerError::Closed`].
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(mut link) = self.link.take() {
            let _ = link.writer.close().await;
        }
        self.dialer.disconnected();
    }

    async fn ensure_open(&mut self) -> Result<()> {
        if self.closed {
            return Err(PeerError::Closed);
        }
        if self.link.is_some() {
            return Ok(());
        }
        if self.redials > self.dialer.policy().max_retries {
            self.dialer.abandon();
            return Err(PeerError::ConnectionLost(format!(
                "{} dropped {} times without progress",
                self.remote_addr(),
                self.redials
            )));
        }
        self.redials += 1;
        self.establish().await
    }

    async fn establish(&mut self) -> Result<()> {
        let stream = self.dialer.connect().await.map_err(dial_error)?;
        let (read_half, write_half) = stream.into_split();
        let mut link = Link {
            reader: EnvelopeReader::with_config(read_half, self.frame.clone()),
            writer: EnvelopeWriter::with_config(write_half, self.frame.clone()),
        };

        if let Some(hello) = &self.hello {
            match link.writer.send(hello.clone()).await {
                Ok(()) => {}
                Err(err) if err.is_malformed() => return Err(PeerError::Frame(err)),
                Err(err) => {
                    // Leave the link down; the caller's loop redials.
                    debug!(addr = %self.remote_addr(), error = %err, "hello failed");
                    self.dialer.disconnected();
                    return Ok(());
                }
            }
        }

        debug!(addr = %self.remote_addr(), attempts = self.dialer.attempts(), "link established");
        self.link = Some(link);
        Ok(())
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.dialer.disconnected();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.remote_addr())
            .field("state", &self.state())
            .field("connected", &self.link.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

fn dial_error(err: TransportError) -> PeerError {
    if err.is_connection_lost() {
        PeerError::ConnectionLost(err.to_string())
    } else {
        PeerError::Transport(err)
    }
}
