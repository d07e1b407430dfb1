/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x544D \"TM\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame arrived intact but its body is not a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Returns true if the byte stream can no longer be trusted.
    ///
    /// Byte-stream framing cannot skip corrupt data, so the connection must
    /// be closed rather than resynchronized.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic
                | FrameError::PayloadTooLarge { .. }
                | FrameError::MalformedEnvelope(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
