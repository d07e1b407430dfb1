//! Subscriber hello on a direct publisher link.
//!
//! The subscriber opens the connection and sends one `subscribe` envelope
//! naming the topic and itself. The publisher answers nothing; the link is
//! a data sink from then on.

use std::time::Duration;

use tokio::io::AsyncRead;
use topicmesh_frame::{Envelope, EnvelopeReader, FrameError};

use crate::error::{PeerError, Result};

const MAX_PEER_NAME_LEN: usize = 128;
const MAX_TOPIC_LEN: usize = 256;

/// A validated subscriber hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub topic: String,
    pub subscriber: String,
}

/// Build the hello a subscriber sends after every (re)connect.
pub fn subscribe_hello(topic: &str, subscriber: &str) -> Envelope {
    Envelope::Subscribe {
        topic: topic.to_string(),
        subscriber: subscriber.to_string(),
    }
}

/// Read the first envelope of an accepted link and check it is a hello.
pub async fn read_hello<R>(reader: &mut EnvelopeReader<R>, timeout: Duration) -> Result<Hello>
where
    R: AsyncRead + Unpin,
{
    let envelope = match tokio::time::timeout(timeout, reader.recv()).await {
        Ok(received) => received.map_err(hello_error)?,
        Err(_) => return Err(PeerError::HelloTimeout(timeout)),
    };

    match envelope {
        Envelope::Subscribe { topic, subscriber } => {
            validate_name("topic", &topic, MAX_TOPIC_LEN)?;
            validate_name("subscriber", &subscriber, MAX_PEER_NAME_LEN)?;
            Ok(Hello { topic, subscriber })
        }
        other => Err(PeerError::MalformedEnvelope(format!(
            "expected subscribe hello, got {}",
            other.kind()
        ))),
    }
}

/// Check a peer or topic name: non-empty, bounded, no control characters.
pub fn validate_name(what: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(PeerError::InvalidName(format!("{what} must not be empty")));
    }
    if value.len() > max_len {
        return Err(PeerError::InvalidName(format!(
            "{what} exceeds {max_len} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(PeerError::InvalidName(format!(
            "{what} contains control characters"
        )));
    }
    Ok(())
}

pub(crate) fn validate_peer_name(name: &str) -> Result<()> {
    validate_name("peer name", name, MAX_PEER_NAME_LEN)
}

pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    validate_name("topic", topic, MAX_TOPIC_LEN)
}

fn hello_error(err: FrameError) -> PeerError {
    if err.is_malformed() {
        PeerError::MalformedEnvelope(err.to_string())
    } else {
        PeerError::Frame(err)
    }
}
