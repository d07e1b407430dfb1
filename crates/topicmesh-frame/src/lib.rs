//! Envelopes and length-prefixed framing for topicmesh.
//!
//! Every envelope is framed with:
//! - A 2-byte magic number ("TM") for stream sanity checks
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID (control, data, heartbeat)
//!
//! followed by the JSON encoding of the [`Envelope`]. Callers always get
//! whole envelopes; partial reads are handled by the codec.

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{CONTROL, DATA, HEARTBEAT};
pub use codec::{
    decode_frame, encode_frame, EnvelopeCodec, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE,
};
pub use envelope::{
    DataEnvelope, Envelope, PeerSummary, PublisherAddr, RejectCode, Role, TopicSummary,
};
pub use error::{FrameError, Result};
pub use reader::EnvelopeReader;
pub use writer::EnvelopeWriter;

/// Well-known port the registry listens on.
pub const DEFAULT_REGISTRY_PORT: u16 = 11511;
