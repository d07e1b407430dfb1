use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::channel::{is_known, CONTROL, DATA, HEARTBEAT};
use crate::codec::Frame;
use crate::error::{FrameError, Result};

/// Role a peer plays for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Subscriber,
}

/// Why the registry refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// An active peer already holds this name at another address.
    DuplicateName,
    /// The peer has not sent `register` yet.
    UnknownPeer,
    /// The request could not be decoded.
    Malformed,
}

/// One publisher location inside a `publisher_info` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherAddr {
    pub peer_name: String,
    pub address: SocketAddr,
}

/// Read-only view of a registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_name: String,
    pub address: SocketAddr,
    pub roles: Vec<Role>,
    pub topics: Vec<String>,
}

/// Read-only view of one topic's membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic: String,
    pub publishers: Vec<String>,
    pub subscribers: Vec<String>,
}

/// A published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub topic: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch at the sender.
    pub send_timestamp: u64,
    /// Random 128-bit token, unique per message instance.
    pub message_id: String,
    pub source_peer: String,
}

impl DataEnvelope {
    /// Build a data envelope stamped with a fresh id and the current time.
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Value,
        source_peer: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            send_timestamp: now_unix_millis(),
            message_id: uuid::Uuid::new_v4().to_string(),
            source_peer: source_peer.into(),
        }
    }
}

/// The unit of wire exchange.
///
/// A closed set of kinds, tagged by `kind` on the wire. Anything outside
/// this set fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Register {
        peer_name: String,
        address: SocketAddr,
    },
    RegisterPublisher {
        peer_name: String,
        topic: String,
    },
    RegisterSubscriber {
        peer_name: String,
        topic: String,
    },
    PublisherInfo {
        topic: String,
        publishers: Vec<PublisherAddr>,
    },
    Data(DataEnvelope),
    Ack,
    Reject {
        code: RejectCode,
        reason: String,
    },
    Unregister {
        peer_name: String,
    },
    /// First envelope a subscriber sends on a direct connection.
    Subscribe {
        topic: String,
        subscriber: String,
    },
    Heartbeat,
    ListPeers,
    ListTopics,
    PeerList {
        peers: Vec<PeerSummary>,
    },
    TopicList {
        topics: Vec<TopicSummary>,
    },
}

impl Envelope {
    /// Wire name of this envelope's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::RegisterPublisher { .. } => "register_publisher",
            Envelope::RegisterSubscriber { .. } => "register_subscriber",
            Envelope::PublisherInfo { .. } => "publisher_info",
            Envelope::Data(_) => "data",
            Envelope::Ack => "ack",
            Envelope::Reject { .. } => "reject",
            Envelope::Unregister { .. } => "unregister",
            Envelope::Subscribe { .. } => "subscribe",
            Envelope::Heartbeat => "heartbeat",
            Envelope::ListPeers => "list_peers",
            Envelope::ListTopics => "list_topics",
            Envelope::PeerList { .. } => "peer_list",
            Envelope::TopicList { .. } => "topic_list",
        }
    }

    /// Channel this envelope travels on.
    pub fn channel(&self) -> u16 {
        match self {
            Envelope::Data(_) => DATA,
            Envelope::Heartbeat => HEARTBEAT,
            _ => CONTROL,
        }
    }

    /// Serialize to the frame body.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| FrameError::MalformedEnvelope(err.to_string()))
    }

    /// Parse a frame body. Unknown kinds and bad fields fail closed.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|err| FrameError::MalformedEnvelope(err.to_string()))
    }

    /// Decode a frame, checking that its channel matches the envelope kind.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if !is_known(frame.channel) {
            return Err(FrameError::MalformedEnvelope(format!(
                "unknown channel {}",
                frame.channel
            )));
        }
        let envelope = Self::from_json(frame.payload.as_ref())?;
        if envelope.channel() != frame.channel {
            return Err(FrameError::MalformedEnvelope(format!(
                "{} envelope on channel {}",
                envelope.kind(),
                frame.channel
            )));
        }
        Ok(envelope)
    }
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
