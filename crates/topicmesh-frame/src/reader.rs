use std::io::ErrorKind;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::codec::{EnvelopeCodec, FrameConfig};
use crate::envelope::Envelope;
use crate::error::{FrameError, Result};

/// Reads complete envelopes from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get whole envelopes.
pub struct EnvelopeReader<R> {
    inner: FramedRead<R, EnvelopeCodec>,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    /// Create a new envelope reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new envelope reader with explicit configuration.
    pub fn with_config(inner: R, config: FrameConfig) -> Self {
        let codec = EnvelopeCodec::new(config.max_payload_size);
        Self {
            inner: FramedRead::new(inner, codec),
            config,
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached and
    /// `Err(FrameError::Io(TimedOut))` when `read_timeout` elapses first.
    pub async fn recv(&mut self) -> Result<Envelope> {
        let next = match self.config.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.next())
                .await
                .map_err(|_| FrameError::Io(std::io::Error::from(ErrorKind::TimedOut)))?,
            None => self.inner.next().await,
        };

        match next {
            Some(result) => result,
            None => Err(FrameError::ConnectionClosed),
        }
    }

    /// Current reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
