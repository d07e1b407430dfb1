use std::fmt;
use std::io;

use topicmesh_frame::FrameError;
use topicmesh_peer::PeerError;
use topicmesh_registry::RegistryError;
use topicmesh_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrInUse => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. }
        | FrameError::MalformedEnvelope(_)
        | FrameError::InvalidMagic => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn registry_error(context: &str, err: RegistryError) -> CliError {
    match err {
        RegistryError::Transport(err) => transport_error(context, err),
        RegistryError::Frame(err) => frame_error(context, err),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn peer_error(context: &str, err: PeerError) -> CliError {
    match err {
        PeerError::Transport(err) => transport_error(context, err),
        PeerError::Frame(err) => frame_error(context, err),
        PeerError::ConnectionLost(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        PeerError::RegistrationTimeout(_)
        | PeerError::QueryTimeout(_)
        | PeerError::HelloTimeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        PeerError::MalformedEnvelope(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        PeerError::InvalidName(_) => CliError::new(USAGE, format!("{context}: {err}")),
        PeerError::InvalidState { .. } => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lost_links_map_to_transport_code() {
        let err = peer_error("connect", PeerError::ConnectionLost("gone".into()));
        assert_eq!(err.code, TRANSPORT_ERROR);

        let err = peer_error(
            "connect",
            PeerError::Transport(TransportError::ConnectionLost {
                addr: "127.0.0.1:1".parse().unwrap(),
                attempts: 4,
            }),
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn timeouts_and_bad_data_have_own_codes() {
        assert_eq!(
            peer_error("register", PeerError::RegistrationTimeout(Duration::from_secs(5))).code,
            TIMEOUT
        );
        assert_eq!(
            peer_error("peers", PeerError::QueryTimeout(Duration::from_secs(2))).code,
            TIMEOUT
        );
        assert_eq!(
            peer_error("recv", PeerError::MalformedEnvelope("bad".into())).code,
            DATA_INVALID
        );
        assert_eq!(
            peer_error("register", PeerError::InvalidName("empty".into())).code,
            USAGE
        );
    }

    #[test]
    fn duplicate_name_is_plain_failure() {
        let err = peer_error("register", PeerError::DuplicateNameConflict("cam".into()));
        assert_eq!(err.code, FAILURE);
        assert!(err.message.starts_with("register: "));
    }
}
