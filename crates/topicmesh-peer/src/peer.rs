use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use topicmesh_frame::{
    DataEnvelope, Envelope, EnvelopeReader, EnvelopeWriter, PublisherAddr, RejectCode,
};
use topicmesh_transport::{Dialer, LinkState, TcpEndpoint, TransportError};

use crate::config::PeerConfig;
use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::handshake;

/// Lifecycle of a [`Peer`].
///
/// `Unregistered -> Registering -> Registered -> {Publishing, Subscribing,
/// Both} -> Disconnecting -> Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unregistered,
    Registering,
    Registered,
    Publishing,
    Subscribing,
    Both,
    Disconnecting,
    Closed,
}

impl PeerState {
    /// Registered with the registry, in any role.
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            PeerState::Registered
                | PeerState::Publishing
                | PeerState::Subscribing
                | PeerState::Both
        )
    }
}

/// Snapshot of one subscriber-side link to a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: u64,
    pub topic: String,
    pub publisher: String,
    pub address: SocketAddr,
    pub state: LinkState,
    /// Dial attempts made by this link.
    pub attempts: u64,
    /// Data envelopes handed to the subscription handler.
    pub received: u64,
    /// False once the link task has given up.
    pub active: bool,
}

type Handler = Arc<dyn Fn(&DataEnvelope) + Send + Sync>;
type SinkWriter = Arc<tokio::sync::Mutex<EnvelopeWriter<OwnedWriteHalf>>>;
type LinkKey = (String, String);

struct SubscriptionEntry {
    id: u64,
    handler: Handler,
    token: CancellationToken,
}

struct LinkEntry {
    info: LinkInfo,
    /// Subscription that opened the link.
    subscription: u64,
    token: CancellationToken,
}

#[derive(Clone)]
struct Sink {
    id: u64,
    subscriber: String,
    writer: SinkWriter,
}

struct Shared {
    config: PeerConfig,
    state: Mutex<PeerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    registry: tokio::sync::Mutex<Option<EnvelopeWriter<OwnedWriteHalf>>>,
    /// Reply slots for registry requests, in send order.
    pending: Mutex<VecDeque<oneshot::Sender<Envelope>>>,
    advertised: Mutex<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    links: Mutex<HashMap<LinkKey, LinkEntry>>,
    sinks: Mutex<HashMap<String, Vec<Sink>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    root: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named participant that publishes and subscribes to topics.
///
/// Methods take `&self`; a `Peer` can be shared behind an `Arc`. Dropping it
/// cancels every background task; [`Peer::close`] also tells the registry.
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    /// Create an unregistered peer.
    pub fn new(config: PeerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PeerState::Unregistered),
                local_addr: Mutex::new(None),
                registry: tokio::sync::Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                advertised: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                sinks: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Create a peer and register it.
    pub async fn connect(config: PeerConfig) -> Result<Self> {
        let peer = Self::new(config);
        peer.register().await?;
        Ok(peer)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PeerState {
        *lock(&self.shared.state)
    }

    /// Address subscribers dial, once registered.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Bind the listener, connect to the registry and wait for its `ack`.
    ///
    /// A failed registration leaves the peer `Closed`.
    pub async fn register(&self) -> Result<()> {
        handshake::validate_peer_name(self.name())?;
        self.shared
            .transition("register", PeerState::Unregistered, PeerState::Registering)?;

        match self.shared.establish().await {
            Ok(address) => {
                self.shared.set_state(PeerState::Registered);
                info!(peer = self.name(), %address, "registered");
                Ok(())
            }
            Err(err) => {
                warn!(peer = self.name(), error = %err, "registration failed");
                self.shared.shutdown().await;
                Err(err)
            }
        }
    }

    /// Register as publisher of `topic` without sending data.
    pub async fn advertise(&self, topic: &str) -> Result<()> {
        handshake::validate_topic(topic)?;
        self.shared.ensure_registered("advertise")?;
        if lock(&self.shared.advertised).contains(topic) {
            return Ok(());
        }

        self.shared
            .request(Envelope::RegisterPublisher {
                peer_name: self.name().to_string(),
                topic: topic.to_string(),
            })
            .await?;
        lock(&self.shared.advertised).insert(topic.to_string());
        self.shared.refresh_role();
        info!(peer = self.name(), topic, "advertising");
        Ok(())
    }

    /// Send `payload` to every subscriber currently linked for `topic`.
    ///
    /// The first publish on a topic advertises it. Returns the number of
    /// subscribers the message was written to; with none it is 0 and the
    /// message is gone.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<usize> {
        self.advertise(topic).await?;

        let envelope = Envelope::Data(DataEnvelope::new(topic, payload, self.name()));
        let sinks: Vec<Sink> = lock(&self.shared.sinks)
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for sink in sinks {
            let sent = sink.writer.lock().await.send(envelope.clone()).await;
            match sent {
                Ok(()) => delivered += 1,
                Err(err) if err.is_malformed() => return Err(PeerError::Frame(err)),
                Err(err) => {
                    debug!(topic, subscriber = %sink.subscriber, error = %err, "dropping subscriber");
                    self.shared.remove_sink(topic, sink.id);
                }
            }
        }

        debug!(topic, delivered, "published");
        Ok(delivered)
    }

    /// Receive every data envelope published on `topic`.
    ///
    /// One link is opened per publisher the registry announces, now or
    /// later. Subscribing again to the same topic replaces the handler once
    /// the registry accepts; on failure the previous subscription stays.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&DataEnvelope) + Send + Sync + 'static,
    {
        handshake::validate_topic(topic)?;
        self.shared.ensure_registered("subscribe")?;

        // Installed before the request: the publisher list follows the ack.
        let id = self.shared.next_id();
        let token = self.shared.root.child_token();
        let previous = lock(&self.shared.subscriptions).insert(
            topic.to_string(),
            SubscriptionEntry {
                id,
                handler: Arc::new(handler),
                token: token.clone(),
            },
        );

        let registered = self
            .shared
            .request(Envelope::RegisterSubscriber {
                peer_name: self.name().to_string(),
                topic: topic.to_string(),
            })
            .await;
        if let Err(err) = registered {
            token.cancel();
            self.shared.restore_subscription(topic, id, previous);
            return Err(err);
        }

        if let Some(previous) = previous {
            previous.token.cancel();
            self.shared.forget_links(topic, previous.id);
            debug!(peer = self.name(), topic, "previous subscription replaced");
        }

        self.shared.refresh_role();
        info!(peer = self.name(), topic, "subscribed");
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            token,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Subscribers currently attached for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.shared.sinks).get(topic).map_or(0, Vec::len)
    }

    /// Links opened for a subscription on `topic`, sorted by publisher.
    pub fn links(&self, topic: &str) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = lock(&self.shared.links)
            .values()
            .filter(|entry| entry.info.topic == topic)
            .map(|entry| entry.info.clone())
            .collect();
        links.sort_by(|a, b| a.publisher.cmp(&b.publisher));
        links
    }

    /// Unregister, stop every task and close every connection.
    pub async fn close(&self) -> Result<()> {
        let was_registered = {
            let mut state = lock(&self.shared.state);
            if matches!(*state, PeerState::Disconnecting | PeerState::Closed) {
                return Ok(());
            }
            let was_registered = state.is_registered();
            *state = PeerState::Disconnecting;
            was_registered
        };

        if was_registered {
            let mut registry = self.shared.registry.lock().await;
            if let Some(writer) = registry.as_mut() {
                let unregister = Envelope::Unregister {
                    peer_name: self.name().to_string(),
                };
                if let Err(err) = writer.send(unregister).await {
                    debug!(peer = self.name(), error = %err, "unregister not delivered");
                }
            }
        }

        self.shared.shutdown().await;
        info!(peer = self.name(), "closed");
        Ok(())
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shared.root.cancel();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Handle to an active subscription.
///
/// Dropping the handle leaves the subscription running; call
/// [`Subscription::cancel`] to stop it.
pub struct Subscription {
    id: u64,
    topic: String,
    token: CancellationToken,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop every link of this subscription and remove the handler.
    pub fn cancel(&self) {
        self.token.cancel();
        self.shared.drop_subscription(&self.topic);
        self.shared.forget_links(&self.topic, self.id);
        self.shared.refresh_role();
        debug!(topic = %self.topic, "subscription cancelled");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Shared {
    fn set_state(&self, next: PeerState) {
        *lock(&self.state) = next;
    }

    fn transition(&self, operation: &'static str, from: PeerState, to: PeerState) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(PeerError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn ensure_registered(&self, operation: &'static str) -> Result<()> {
        let state = *lock(&self.state);
        match state {
            s if s.is_registered() => Ok(()),
            PeerState::Disconnecting | PeerState::Closed => Err(PeerError::Closed),
            _ => Err(PeerError::InvalidState { operation, state }),
        }
    }

    fn refresh_role(&self) {
        let publishing = !lock(&self.advertised).is_empty();
        let subscribing = !lock(&self.subscriptions).is_empty();
        let mut state = lock(&self.state);
        if state.is_registered() {
            *state = match (publishing, subscribing) {
                (false, false) => PeerState::Registered,
                (true, false) => PeerState::Publishing,
                (false, true) => PeerState::Subscribing,
                (true, true) => PeerState::Both,
            };
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Bind, dial the registry, start background tasks and register.
    async fn establish(self: &Arc<Self>) -> Result<SocketAddr> {
        let config = &self.config;
        let endpoint = TcpEndpoint::bind(config.listen_addr).await?;

        let mut dialer = Dialer::new(config.registry_addr, config.retry);
        let stream = dialer
            .connect()
            .await
            .map_err(|err| PeerError::ConnectionLost(err.to_string()))?;

        let mut address = endpoint.local_addr();
        if address.ip().is_unspecified() {
            address.set_ip(stream.local_addr().map_err(TransportError::from)?.ip());
        }
        *lock(&self.local_addr) = Some(address);

        let (read_half, write_half) = stream.into_split();
        *self.registry.lock().await =
            Some(EnvelopeWriter::with_config(write_half, config.frame.clone()));
        let reader = EnvelopeReader::with_config(read_half, config.frame.clone());

        self.spawn(registry_loop(Arc::clone(self), reader));
        self.spawn(accept_loop(Arc::clone(self), endpoint));
        if let Some(every) = config.heartbeat_interval {
            self.spawn(heartbeat_loop(Arc::clone(self), every));
        }

        self.request(Envelope::Register {
            peer_name: config.name.clone(),
            address,
        })
        .await?;
        Ok(address)
    }

    /// Send a registry request and wait for its `ack` or `reject`.
    async fn request(&self, envelope: Envelope) -> Result<()> {
        let timeout = self.config.registration_timeout;
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry.lock().await;
            let writer = registry
                .as_mut()
                .ok_or_else(|| PeerError::ConnectionLost("registry link is down".into()))?;
            lock(&self.pending).push_back(tx);
            if let Err(err) = writer.send(envelope).await {
                *registry = None;
                lock(&self.pending).clear();
                return Err(PeerError::ConnectionLost(format!("registry write failed: {err}")));
            }
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(PeerError::ConnectionLost(
                    "registry closed before replying".into(),
                ))
            }
            Err(_) => return Err(PeerError::RegistrationTimeout(timeout)),
        };

        match reply {
            Envelope::Ack => Ok(()),
            Envelope::Reject { code, reason } => Err(match code {
                RejectCode::DuplicateName => PeerError::DuplicateNameConflict(reason),
                RejectCode::UnknownPeer => PeerError::UnknownPeer(reason),
                RejectCode::Malformed => PeerError::Rejected(reason),
            }),
            other => Err(PeerError::MalformedEnvelope(format!(
                "unexpected registry reply {}",
                other.kind()
            ))),
        }
    }

    fn complete(&self, reply: Envelope) {
        match lock(&self.pending).pop_front() {
            Some(slot) => {
                let _ = slot.send(reply);
            }
            None => debug!(kind = reply.kind(), "unsolicited registry reply"),
        }
    }

    /// Open a link per announced publisher. An active link is kept only if
    /// it belongs to the current subscription and targets the announced
    /// address; otherwise it is cancelled and replaced.
    fn on_publisher_info(self: &Arc<Self>, topic: &str, publishers: Vec<PublisherAddr>) {
        let (subscription, handler, token) = match lock(&self.subscriptions).get(topic) {
            Some(entry) => (entry.id, Arc::clone(&entry.handler), entry.token.clone()),
            None => {
                debug!(topic, "publisher_info for topic without subscription");
                return;
            }
        };

        for publisher in publishers {
            let key = (topic.to_string(), publisher.peer_name.clone());
            let id = self.next_id();
            let link_token = token.child_token();
            {
                let mut links = lock(&self.links);
                if let Some(existing) = links.get(&key) {
                    if existing.info.active
                        && existing.subscription == subscription
                        && existing.info.address == publisher.address
                    {
                        continue;
                    }
                    if existing.info.active {
                        info!(
                            topic,
                            publisher = %publisher.peer_name,
                            old = %existing.info.address,
                            new = %publisher.address,
                            "replacing publisher link"
                        );
                    }
                    existing.token.cancel();
                }
                links.insert(
                    key.clone(),
                    LinkEntry {
                        info: LinkInfo {
                            id,
                            topic: topic.to_string(),
                            publisher: publisher.peer_name.clone(),
                            address: publisher.address,
                            state: LinkState::Idle,
                            attempts: 0,
                            received: 0,
                            active: true,
                        },
                        subscription,
                        token: link_token.clone(),
                    },
                );
            }
            self.spawn(link_loop(
                Arc::clone(self),
                LinkTarget { key, id, publisher },
                Arc::clone(&handler),
                link_token,
            ));
        }
    }

    /// Apply `update` to a link entry if it still belongs to link `id`.
    fn update_link(&self, key: &LinkKey, id: u64, update: impl FnOnce(&mut LinkInfo)) {
        if let Some(entry) = lock(&self.links).get_mut(key) {
            if entry.info.id == id {
                update(&mut entry.info);
            }
        }
    }

    fn remove_link(&self, key: &LinkKey, id: u64) {
        let mut links = lock(&self.links);
        if links.get(key).is_some_and(|entry| entry.info.id == id) {
            links.remove(key);
        }
    }

    /// Drop every link entry opened by `subscription` on `topic`.
    fn forget_links(&self, topic: &str, subscription: u64) {
        lock(&self.links)
            .retain(|(t, _), entry| !(t == topic && entry.subscription == subscription));
    }

    /// Undo a failed re-subscribe: put back the previous entry unless it was
    /// cancelled meanwhile.
    fn restore_subscription(
        &self,
        topic: &str,
        id: u64,
        previous: Option<SubscriptionEntry>,
    ) {
        {
            let mut subscriptions = lock(&self.subscriptions);
            if subscriptions.get(topic).is_some_and(|entry| entry.id == id) {
                match previous.filter(|entry| !entry.token.is_cancelled()) {
                    Some(entry) => {
                        subscriptions.insert(topic.to_string(), entry);
                    }
                    None => {
                        subscriptions.remove(topic);
                    }
                }
            }
        }
        self.forget_links(topic, id);
    }

    fn drop_subscription(&self, topic: &str) {
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions
            .get(topic)
            .is_some_and(|entry| entry.token.is_cancelled())
        {
            subscriptions.remove(topic);
        }
    }

    fn add_sink(&self, topic: &str, subscriber: &str, writer: EnvelopeWriter<OwnedWriteHalf>) -> u64 {
        let id = self.next_id();
        lock(&self.sinks)
            .entry(topic.to_string())
            .or_default()
            .push(Sink {
                id,
                subscriber: subscriber.to_string(),
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
            });
        id
    }

    fn remove_sink(&self, topic: &str, id: u64) -> bool {
        let mut sinks = lock(&self.sinks);
        let Some(list) = sinks.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|sink| sink.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            sinks.remove(topic);
        }
        removed
    }

    /// Cancel everything, close owned connections and wait for tasks.
    async fn shutdown(&self) {
        self.root.cancel();

        if let Some(mut writer) = self.registry.lock().await.take() {
            let _ = writer.close().await;
        }

        let sinks: Vec<Sink> = lock(&self.sinks).drain().flat_map(|(_, list)| list).collect();
        for sink in sinks {
            let _ = sink.writer.lock().await.close().await;
        }

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }

        lock(&self.pending).clear();
        self.set_state(PeerState::Closed);
    }
}

async fn registry_loop(shared: Arc<Shared>, mut reader: EnvelopeReader<OwnedReadHalf>) {
    loop {
        let received = tokio::select! {
            _ = shared.root.cancelled() => return,
            received = reader.recv() => received,
        };

        match received {
            Ok(reply @ (Envelope::Ack | Envelope::Reject { .. })) => shared.complete(reply),
            Ok(Envelope::PublisherInfo { topic, publishers }) => {
                debug!(topic = %topic, count = publishers.len(), "publisher_info");
                shared.on_publisher_info(&topic, publishers);
            }
            Ok(other) => debug!(kind = other.kind(), "ignoring registry envelope"),
            Err(err) => {
                warn!(error = %err, "registry link lost");
                break;
            }
        }
    }

    lock(&shared.pending).clear();
    *shared.registry.lock().await = None;
}

async fn accept_loop(shared: Arc<Shared>, endpoint: TcpEndpoint) {
    loop {
        let accepted = tokio::select! {
            _ = shared.root.cancelled() => break,
            accepted = endpoint.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                shared.spawn(attach_subscriber(Arc::clone(&shared), stream, remote));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!(addr = %endpoint.local_addr(), "listener closed");
}

/// Publisher side of a subscriber link: read the hello, then hold the
/// connection as a sink until the subscriber goes away.
async fn attach_subscriber(shared: Arc<Shared>, stream: TcpStream, remote: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = EnvelopeReader::with_config(read_half, shared.config.frame.clone());

    let hello = tokio::select! {
        _ = shared.root.cancelled() => return,
        hello = handshake::read_hello(&mut reader, shared.config.registration_timeout) => hello,
    };
    let hello = match hello {
        Ok(hello) => hello,
        Err(err) => {
            warn!(%remote, error = %err, "rejecting subscriber link");
            return;
        }
    };

    let writer = EnvelopeWriter::with_config(write_half, shared.config.frame.clone());
    let id = shared.add_sink(&hello.topic, &hello.subscriber, writer);
    info!(topic = %hello.topic, subscriber = %hello.subscriber, %remote, "subscriber attached");

    loop {
        let received = tokio::select! {
            _ = shared.root.cancelled() => break,
            received = reader.recv() => received,
        };
        match received {
            Ok(envelope) => debug!(kind = envelope.kind(), "ignoring envelope from subscriber"),
            Err(_) => break,
        }
    }

    if shared.remove_sink(&hello.topic, id) {
        info!(topic = %hello.topic, subscriber = %hello.subscriber, "subscriber detached");
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.root.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut registry = shared.registry.lock().await;
        let Some(writer) = registry.as_mut() else {
            break;
        };
        if let Err(err) = writer.send(Envelope::Heartbeat).await {
            debug!(error = %err, "heartbeat failed");
            break;
        }
    }
}

struct LinkTarget {
    key: LinkKey,
    id: u64,
    publisher: PublisherAddr,
}

/// Subscriber side of a link: dial the publisher, send the hello and feed
/// data envelopes to the handler in arrival order.
async fn link_loop(
    shared: Arc<Shared>,
    target: LinkTarget,
    handler: Handler,
    token: CancellationToken,
) {
    let LinkTarget { key, id, publisher } = target;
    let topic = key.0.clone();
    let hello = handshake::subscribe_hello(&topic, &shared.config.name);

    let opened = tokio::select! {
        _ = token.cancelled() => {
            shared.remove_link(&key, id);
            return;
        }
        opened = Connection::open(
            publisher.address,
            shared.config.retry,
            shared.config.frame.clone(),
            Some(hello),
        ) => opened,
    };
    let mut conn = match opened {
        Ok(conn) => conn,
        Err(err) => {
            warn!(topic = %topic, publisher = %publisher.peer_name, error = %err, "could not reach publisher");
            let attempts = u64::from(shared.config.retry.max_attempts());
            shared.update_link(&key, id, |link| {
                link.state = LinkState::Lost;
                link.attempts = attempts;
                link.active = false;
            });
            return;
        }
    };

    shared.update_link(&key, id, |link| {
        link.state = conn.state();
        link.attempts = conn.attempts();
    });
    info!(topic = %topic, publisher = %publisher.peer_name, address = %publisher.address, "linked to publisher");

    let failure = loop {
        let received = tokio::select! {
            _ = token.cancelled() => break None,
            received = conn.recv() => received,
        };

        match received {
            Ok(Envelope::Data(data)) if data.topic == topic => {
                let (state, attempts) = (conn.state(), conn.attempts());
                shared.update_link(&key, id, |link| {
                    link.state = state;
                    link.attempts = attempts;
                    link.received += 1;
                });
                handler(&data);
            }
            Ok(other) => debug!(topic = %topic, kind = other.kind(), "ignoring envelope on link"),
            Err(err) => break Some(err),
        }
    };

    match failure {
        None => {
            conn.close().await;
            shared.remove_link(&key, id);
        }
        Some(err) => {
            warn!(topic = %topic, publisher = %publisher.peer_name, error = %err, "link ended");
            let (state, attempts) = (conn.state(), conn.attempts());
            shared.update_link(&key, id, |link| {
                link.state = state;
                link.attempts = attempts;
                link.active = false;
            });
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use topicmesh_transport::RetryPolicy;

    fn config(name: &str, registry: SocketAddr) -> PeerConfig {
        PeerConfig::new(name)
            .with_registry(registry)
            .with_retry(RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            })
            .with_registration_timeout(Duration::from_millis(200))
    }

    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn new_peer_is_unregistered() {
        let peer = Peer::new(config("a", dead_addr().await));
        assert_eq!(peer.state(), PeerState::Unregistered);
        assert!(peer.local_addr().is_none());

        let err = peer.publish("pose", serde_json::json!(1)).await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::InvalidState {
                state: PeerState::Unregistered,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_name_is_refused() {
        let peer = Peer::new(config("", dead_addr().await));
        assert!(matches!(
            peer.register().await,
            Err(PeerError::InvalidName(_))
        ));
        assert_eq!(peer.state(), PeerState::Unregistered);
    }

    #[tokio::test]
    async fn unreachable_registry_closes_peer() {
        let peer = Peer::new(config("a", dead_addr().await));
        let err = peer.register().await.unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(matches!(peer.register().await, Err(PeerError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn silent_registry_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let peer = Peer::new(config("a", addr));
        let err = peer.register().await.unwrap_err();
        assert!(matches!(err, PeerError::RegistrationTimeout(_)));
        assert_eq!(peer.state(), PeerState::Closed);
        hold.abort();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let peer = Peer::new(config("a", dead_addr().await));
        peer.close().await.unwrap();
        peer.close().await.unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(matches!(
            peer.subscribe("pose", |_| {}).await,
            Err(PeerError::Closed)
        ));
    }

    #[test]
    fn registered_states() {
        assert!(PeerState::Both.is_registered());
        assert!(PeerState::Registered.is_registered());
        assert!(!PeerState::Registering.is_registered());
        assert!(!PeerState::Closed.is_registered());
    }
}
