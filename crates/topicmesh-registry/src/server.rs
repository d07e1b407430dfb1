use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use topicmesh_frame::{
    Envelope, EnvelopeReader, EnvelopeWriter, FrameConfig, FrameError, RejectCode,
    DEFAULT_REGISTRY_PORT,
};
use topicmesh_transport::TcpEndpoint;

use crate::error::Result;
use crate::registry::{ConnId, Push, Registry};

/// Reap period used when no heartbeat timeout is configured.
const IDLE_REAP_PERIOD: Duration = Duration::from_secs(60);

/// Registry server configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub listen_addr: SocketAddr,
    /// Records silent for longer than this are expired. `None` keeps
    /// records until their connection closes.
    pub heartbeat_timeout: Option<Duration>,
    pub frame: FrameConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_REGISTRY_PORT)),
            heartbeat_timeout: None,
            frame: FrameConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Build the empty registry this configuration describes.
    pub fn registry(&self) -> Registry {
        Registry::with_stale_after(self.heartbeat_timeout)
    }
}

enum Event {
    Inbound { conn: ConnId, envelope: Envelope },
    Closed { conn: ConnId, reason: Option<String> },
}

struct ConnHandle {
    outbox: mpsc::UnboundedSender<Envelope>,
    token: CancellationToken,
    remote: SocketAddr,
}

/// Listening socket plus the event loop that owns a [`Registry`].
#[derive(Debug)]
pub struct RegistryServer {
    endpoint: TcpEndpoint,
    config: RegistryConfig,
}

impl RegistryServer {
    pub async fn bind(config: RegistryConfig) -> Result<Self> {
        let endpoint = TcpEndpoint::bind(config.listen_addr).await?;
        info!(addr = %endpoint.local_addr(), "registry listening");
        Ok(Self { endpoint, config })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// All table mutation happens on this task; connection tasks only decode
    /// and encode.
    pub async fn run(self, registry: &mut Registry, shutdown: CancellationToken) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut conns: HashMap<ConnId, ConnHandle> = HashMap::new();
        let mut next_conn: ConnId = 1;

        let reap_period = self
            .config
            .heartbeat_timeout
            .map(|limit| (limit / 2).max(Duration::from_millis(10)))
            .unwrap_or(IDLE_REAP_PERIOD);
        let mut reap = tokio::time::interval(reap_period);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.endpoint.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let conn = next_conn;
                        next_conn += 1;
                        let token = shutdown.child_token();
                        let outbox = spawn_connection(
                            conn,
                            stream,
                            remote,
                            events_tx.clone(),
                            self.config.frame.clone(),
                            token.clone(),
                        );
                        debug!(conn, %remote, "connection accepted");
                        conns.insert(conn, ConnHandle { outbox, token, remote });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                Some(event) = events_rx.recv() => handle_event(registry, &mut conns, event),
                _ = reap.tick() => {
                    for (peer_name, owner) in registry.expire_stale(Instant::now()) {
                        warn!(peer = %peer_name, conn = owner, "peer missed heartbeats, expiring");
                        if let Some(handle) = conns.remove(&owner) {
                            handle.token.cancel();
                        }
                    }
                }
            }
        }

        for handle in conns.values() {
            handle.token.cancel();
        }
        info!(peers = registry.len(), "registry stopped");
        Ok(())
    }
}

fn handle_event(registry: &mut Registry, conns: &mut HashMap<ConnId, ConnHandle>, event: Event) {
    match event {
        Event::Closed { conn, reason } => {
            let remote = conns.remove(&conn).map(|h| h.remote);
            let released = registry.release(conn);
            match reason {
                Some(reason) => debug!(conn, ?remote, %reason, ?released, "connection closed"),
                None => debug!(conn, ?remote, ?released, "connection closed"),
            }
        }
        Event::Inbound { conn, envelope } => {
            registry.touch(conn, Instant::now());
            handle_envelope(registry, conns, conn, envelope);
        }
    }
}

fn handle_envelope(
    registry: &mut Registry,
    conns: &HashMap<ConnId, ConnHandle>,
    conn: ConnId,
    envelope: Envelope,
) {
    let outcome = match envelope {
        Envelope::Register { peer_name, address } => registry
            .register(&peer_name, address, conn, Instant::now())
            .map(|()| Vec::new()),
        Envelope::RegisterPublisher { peer_name, topic } => {
            registry.register_publisher(&peer_name, &topic)
        }
        Envelope::RegisterSubscriber { peer_name, topic } => {
            registry.register_subscriber(&peer_name, &topic)
        }
        Envelope::Unregister { peer_name } => {
            if !registry.unregister(&peer_name, conn) {
                debug!(conn, peer = %peer_name, "unregister for unowned peer ignored");
            }
            return;
        }
        Envelope::Heartbeat => return,
        Envelope::ListPeers => {
            deliver(conns, conn, Envelope::PeerList { peers: registry.peers() });
            return;
        }
        Envelope::ListTopics => {
            deliver(conns, conn, Envelope::TopicList { topics: registry.topics() });
            return;
        }
        other => {
            debug!(conn, kind = other.kind(), "ignoring envelope not addressed to the registry");
            return;
        }
    };

    match outcome {
        Ok(pushes) => {
            deliver(conns, conn, Envelope::Ack);
            route(registry, conns, pushes);
        }
        Err(err) => {
            warn!(conn, error = %err, "registration rejected");
            let code = err.reject_code().unwrap_or(RejectCode::Malformed);
            deliver(
                conns,
                conn,
                Envelope::Reject {
                    code,
                    reason: err.to_string(),
                },
            );
        }
    }
}

fn route(registry: &Registry, conns: &HashMap<ConnId, ConnHandle>, pushes: Vec<Push>) {
    for push in pushes {
        match registry.owner_of(&push.to) {
            Some(owner) => deliver(conns, owner, push.envelope),
            None => debug!(peer = %push.to, "push target vanished"),
        }
    }
}

fn deliver(conns: &HashMap<ConnId, ConnHandle>, conn: ConnId, envelope: Envelope) {
    let sent = conns
        .get(&conn)
        .is_some_and(|handle| handle.outbox.send(envelope).is_ok());
    if !sent {
        debug!(conn, "outbox closed, dropping envelope");
    }
}

/// Spawn the reader and writer tasks for one accepted connection and return
/// the writer's outbox.
fn spawn_connection(
    conn: ConnId,
    stream: TcpStream,
    remote: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    frame: FrameConfig,
    token: CancellationToken,
) -> mpsc::UnboundedSender<Envelope> {
    let (read_half, write_half) = stream.into_split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();

    let mut writer = EnvelopeWriter::with_config(write_half, frame.clone());
    let writer_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_token.cancelled() => break,
                next = outbox_rx.recv() => match next {
                    Some(envelope) => {
                        if let Err(err) = writer.send(envelope).await {
                            debug!(conn, error = %err, "write failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.close().await;
    });

    let reject_tx = outbox_tx.clone();
    tokio::spawn(async move {
        let mut reader = EnvelopeReader::with_config(read_half, frame);
        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => break None,
                received = reader.recv() => match received {
                    Ok(envelope) => {
                        if events.send(Event::Inbound { conn, envelope }).is_err() {
                            break None;
                        }
                    }
                    Err(FrameError::ConnectionClosed) => break None,
                    Err(err) if err.is_malformed() => {
                        warn!(conn, %remote, error = %err, "malformed envelope, closing connection");
                        let _ = reject_tx.send(Envelope::Reject {
                            code: RejectCode::Malformed,
                            reason: err.to_string(),
                        });
                        break Some(err.to_string());
                    }
                    Err(err) => break Some(err.to_string()),
                },
            }
        };
        drop(reject_tx);
        let _ = events.send(Event::Closed { conn, reason });
    });

    outbox_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use topicmesh_frame::{PublisherAddr, Role};

    struct Client {
        reader: EnvelopeReader<OwnedReadHalf>,
        writer: EnvelopeWriter<OwnedWriteHalf>,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (r, w) = stream.into_split();
            let config = FrameConfig {
                read_timeout: Some(Duration::from_secs(5)),
                ..FrameConfig::default()
            };
            Self {
                reader: EnvelopeReader::with_config(r, config),
                writer: EnvelopeWriter::new(w),
            }
        }

        async fn request(&mut self, envelope: Envelope) -> Envelope {
            self.writer.send(envelope).await.unwrap();
            self.reader.recv().await.unwrap()
        }

        async fn register(&mut self, name: &str, port: u16) {
            let reply = self
                .request(Envelope::Register {
                    peer_name: name.into(),
                    address: SocketAddr::from(([127, 0, 0, 1], port)),
                })
                .await;
            assert_eq!(reply, Envelope::Ack);
        }
    }

    async fn start(config: RegistryConfig) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Registry>) {
        let server = RegistryServer::bind(config.clone()).await.unwrap();
        let addr = server.local_addr();
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let mut registry = config.registry();
            server.run(&mut registry, shutdown).await.unwrap();
            registry
        });
        (addr, token, handle)
    }

    fn ephemeral() -> RegistryConfig {
        RegistryConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn register_then_publish_is_acked() {
        let (addr, token, handle) = start(ephemeral()).await;
        let mut a = Client::connect(addr).await;
        a.register("a", 4000).await;

        let reply = a
            .request(Envelope::RegisterPublisher {
                peer_name: "a".into(),
                topic: "pose".into(),
            })
            .await;
        assert_eq!(reply, Envelope::Ack);

        token.cancel();
        let registry = handle.await.unwrap();
        assert_eq!(registry.lookup_publishers("pose").len(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected() {
        let (addr, token, _handle) = start(ephemeral()).await;
        let mut c = Client::connect(addr).await;

        let reply = c
            .request(Envelope::RegisterSubscriber {
                peer_name: "ghost".into(),
                topic: "pose".into(),
            })
            .await;
        assert!(matches!(
            reply,
            Envelope::Reject { code: RejectCode::UnknownPeer, .. }
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let (addr, token, _handle) = start(ephemeral()).await;
        let mut first = Client::connect(addr).await;
        first.register("x", 4000).await;

        let mut second = Client::connect(addr).await;
        let reply = second
            .request(Envelope::Register {
                peer_name: "x".into(),
                address: "127.0.0.1:4001".parse().unwrap(),
            })
            .await;
        assert!(matches!(
            reply,
            Envelope::Reject { code: RejectCode::DuplicateName, .. }
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn early_subscriber_receives_later_publisher() {
        let (addr, token, _handle) = start(ephemeral()).await;

        let mut b = Client::connect(addr).await;
        b.register("b", 4001).await;
        let reply = b
            .request(Envelope::RegisterSubscriber {
                peer_name: "b".into(),
                topic: "pose".into(),
            })
            .await;
        assert_eq!(reply, Envelope::Ack);
        assert_eq!(
            b.reader.recv().await.unwrap(),
            Envelope::PublisherInfo {
                topic: "pose".into(),
                publishers: vec![],
            }
        );

        let mut a = Client::connect(addr).await;
        a.register("a", 4000).await;
        let reply = a
            .request(Envelope::RegisterPublisher {
                peer_name: "a".into(),
                topic: "pose".into(),
            })
            .await;
        assert_eq!(reply, Envelope::Ack);

        assert_eq!(
            b.reader.recv().await.unwrap(),
            Envelope::PublisherInfo {
                topic: "pose".into(),
                publishers: vec![PublisherAddr {
                    peer_name: "a".into(),
                    address: "127.0.0.1:4000".parse().unwrap(),
                }],
            }
        );
        token.cancel();
    }

    #[tokio::test]
    async fn closed_connection_is_purged() {
        let (addr, token, _handle) = start(ephemeral()).await;

        let mut a = Client::connect(addr).await;
        a.register("a", 4000).await;
        a.request(Envelope::RegisterPublisher {
            peer_name: "a".into(),
            topic: "pose".into(),
        })
        .await;
        drop(a);

        let mut observer = Client::connect(addr).await;
        let mut purged = false;
        for _ in 0..50 {
            match observer.request(Envelope::ListTopics).await {
                Envelope::TopicList { topics } if topics.is_empty() => {
                    purged = true;
                    break;
                }
                Envelope::TopicList { .. } => tokio::time::sleep(Duration::from_millis(20)).await,
                other => panic!("unexpected reply {other:?}"),
            }
        }
        assert!(purged, "publisher record survived its connection");
        token.cancel();
    }

    #[tokio::test]
    async fn list_peers_reports_roles() {
        let (addr, token, _handle) = start(ephemeral()).await;
        let mut a = Client::connect(addr).await;
        a.register("a", 4000).await;
        a.request(Envelope::RegisterPublisher {
            peer_name: "a".into(),
            topic: "pose".into(),
        })
        .await;

        match a.request(Envelope::ListPeers).await {
            Envelope::PeerList { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_name, "a");
                assert_eq!(peers[0].roles, vec![Role::Publisher]);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn malformed_frame_closes_only_that_connection() {
        let (addr, token, _handle) = start(ephemeral()).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        let body = br#"{"kind":"teleport"}"#;
        let mut wire = Vec::new();
        wire.extend_from_slice(b"TM");
        wire.extend_from_slice(&(body.len() as u32).to_le_bytes());
        wire.extend_from_slice(&0u16.to_le_bytes());
        wire.extend_from_slice(body);
        bad.write_all(&wire).await.unwrap();

        let (r, _w) = bad.into_split();
        let mut reader = EnvelopeReader::new(r);
        assert!(matches!(
            reader.recv().await.unwrap(),
            Envelope::Reject { code: RejectCode::Malformed, .. }
        ));
        assert!(matches!(
            reader.recv().await,
            Err(FrameError::ConnectionClosed)
        ));

        let mut good = Client::connect(addr).await;
        good.register("good", 4002).await;
        token.cancel();
    }

    #[tokio::test]
    async fn silent_peer_is_expired() {
        let config = RegistryConfig {
            heartbeat_timeout: Some(Duration::from_millis(100)),
            ..ephemeral()
        };
        let (addr, token, handle) = start(config).await;

        let mut a = Client::connect(addr).await;
        a.register("a", 4000).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        token.cancel();
        let registry = handle.await.unwrap();
        assert!(registry.peer("a").is_none());
    }
}
