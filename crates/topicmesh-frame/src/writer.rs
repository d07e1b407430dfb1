use std::io::ErrorKind;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::codec::{EnvelopeCodec, FrameConfig};
use crate::envelope::Envelope;
use crate::error::{FrameError, Result};

/// Writes complete envelopes to any `AsyncWrite` stream.
pub struct EnvelopeWriter<W> {
    inner: FramedWrite<W, EnvelopeCodec>,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    /// Create a new envelope writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new envelope writer with explicit configuration.
    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        let codec = EnvelopeCodec::new(config.max_payload_size);
        Self {
            inner: FramedWrite::new(inner, codec),
            config,
        }
    }

    /// Encode, frame, write and flush one envelope.
    ///
    /// Resolves once the bytes are handed to the OS, or fails.
    pub async fn send(&mut self, envelope: Envelope) -> Result<()> {
        match self.config.write_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.send(envelope))
                .await
                .map_err(|_| FrameError::Io(std::io::Error::from(ErrorKind::TimedOut)))?,
            None => self.inner.send(envelope).await,
        }
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
