use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use topicmesh_frame::{DataEnvelope, Role};
use topicmesh_peer::{Peer, PeerConfig, PeerError, PeerState, RegistryClient};
use topicmesh_registry::{RegistryConfig, RegistryServer};
use topicmesh_transport::{LinkState, RetryPolicy};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

async fn start_registry() -> (SocketAddr, CancellationToken) {
    start_registry_with(None).await
}

async fn start_registry_with(heartbeat_timeout: Option<Duration>) -> (SocketAddr, CancellationToken) {
    let config = RegistryConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_timeout,
        ..RegistryConfig::default()
    };
    let server = RegistryServer::bind(config.clone()).await.unwrap();
    let addr = server.local_addr();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        let mut registry = config.registry();
        server.run(&mut registry, shutdown).await.unwrap();
    });
    (addr, token)
}

fn peer_config(name: &str, registry: SocketAddr) -> PeerConfig {
    PeerConfig::new(name)
        .with_registry(registry)
        .with_retry(fast_retry())
        .with_registration_timeout(Duration::from_secs(2))
}

async fn peer(name: &str, registry: SocketAddr) -> Peer {
    Peer::connect(peer_config(name, registry)).await.unwrap()
}

async fn listed_peers(client: &mut RegistryClient) -> Vec<String> {
    client
        .list_peers()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.peer_name)
        .collect()
}

/// Poll the registry until the listed peer names equal `expected`.
async fn wait_for_listing(registry: SocketAddr, expected: &[&str]) {
    let mut client = RegistryClient::connect(registry, fast_retry(), Duration::from_secs(2))
        .await
        .unwrap();
    for _ in 0..300 {
        if listed_peers(&mut client).await == expected {
            client.close().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never listed exactly {expected:?}");
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

type Inbox = Arc<Mutex<Vec<u64>>>;

fn collector() -> (Inbox, impl Fn(&DataEnvelope) + Send + Sync + 'static) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    let handler = move |data: &DataEnvelope| {
        sink.lock().unwrap().push(data.payload["n"].as_u64().unwrap());
    };
    (inbox, handler)
}

fn seen(inbox: &Inbox) -> Vec<u64> {
    inbox.lock().unwrap().clone()
}

#[tokio::test]
async fn published_messages_arrive_in_order() {
    let (registry, _stop) = start_registry().await;
    let publisher = peer("camera", registry).await;
    let subscriber = peer("viewer", registry).await;

    publisher.advertise("pose").await.unwrap();
    let (inbox, handler) = collector();
    subscriber.subscribe("pose", handler).await.unwrap();
    eventually("subscriber attached", || publisher.subscriber_count("pose") == 1).await;

    for n in 1..=5 {
        let delivered = publisher
            .publish("pose", serde_json::json!({ "n": n }))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    eventually("five messages", || seen(&inbox).len() == 5).await;
    assert_eq!(seen(&inbox), vec![1, 2, 3, 4, 5]);
    assert_eq!(publisher.state(), PeerState::Publishing);
    assert_eq!(subscriber.state(), PeerState::Subscribing);
}

#[tokio::test]
async fn subscriber_registered_first_still_learns_of_publisher() {
    let (registry, _stop) = start_registry().await;
    let subscriber = peer("viewer", registry).await;
    let (inbox, handler) = collector();
    subscriber.subscribe("pose", handler).await.unwrap();
    assert!(subscriber.links("pose").is_empty());

    let publisher = peer("camera", registry).await;
    publisher.advertise("pose").await.unwrap();

    eventually("link to late publisher", || subscriber.links("pose").len() == 1).await;
    eventually("subscriber attached", || publisher.subscriber_count("pose") == 1).await;

    publisher
        .publish("pose", serde_json::json!({ "n": 42 }))
        .await
        .unwrap();
    eventually("message", || seen(&inbox) == vec![42]).await;
}

#[tokio::test]
async fn publish_without_subscribers_succeeds() {
    let (registry, _stop) = start_registry().await;
    let publisher = peer("camera", registry).await;

    let delivered = publisher
        .publish("pose", serde_json::json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(publisher.state(), PeerState::Publishing);
}

#[tokio::test]
async fn one_link_per_registered_publisher() {
    let (registry, _stop) = start_registry().await;
    let mut publishers = Vec::new();
    for name in ["lidar-a", "lidar-b", "lidar-c"] {
        let p = peer(name, registry).await;
        p.advertise("scan").await.unwrap();
        publishers.push(p);
    }

    let subscriber = peer("mapper", registry).await;
    subscriber.subscribe("scan", |_| {}).await.unwrap();

    eventually("three connected links", || {
        let links = subscriber.links("scan");
        links.len() == 3 && links.iter().all(|l| l.state == LinkState::Connected)
    })
    .await;

    let links = subscriber.links("scan");
    let attempts: u64 = links.iter().map(|l| l.attempts).sum();
    assert_eq!(attempts, 3);
    let names: Vec<&str> = links.iter().map(|l| l.publisher.as_str()).collect();
    assert_eq!(names, vec!["lidar-a", "lidar-b", "lidar-c"]);

    for p in &publishers {
        eventually("subscriber attached", || p.subscriber_count("scan") == 1).await;
    }
}

#[tokio::test]
async fn duplicate_name_is_refused() {
    let (registry, _stop) = start_registry().await;
    let _first = peer("camera", registry).await;

    let second = Peer::new(
        PeerConfig::new("camera")
            .with_registry(registry)
            .with_retry(fast_retry()),
    );
    let err = second.register().await.unwrap_err();
    assert!(matches!(err, PeerError::DuplicateNameConflict(_)));
    assert_eq!(second.state(), PeerState::Closed);
}

#[tokio::test]
async fn dropped_link_keeps_delivered_prefix() {
    let (registry, _stop) = start_registry().await;
    let publisher = peer("camera", registry).await;
    let subscriber = peer("viewer", registry).await;

    publisher.advertise("pose").await.unwrap();
    let (inbox, handler) = collector();
    subscriber.subscribe("pose", handler).await.unwrap();
    eventually("subscriber attached", || publisher.subscriber_count("pose") == 1).await;

    for n in 1..=3 {
        publisher
            .publish("pose", serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }
    eventually("three messages", || seen(&inbox).len() == 3).await;

    publisher.close().await.unwrap();
    for n in 4..=5 {
        let err = publisher
            .publish("pose", serde_json::json!({ "n": n }))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Closed));
    }

    eventually("link lost", || {
        subscriber
            .links("pose")
            .first()
            .is_some_and(|l| !l.active && l.state == LinkState::Lost)
    })
    .await;
    assert_eq!(seen(&inbox), vec![1, 2, 3]);
    assert_eq!(subscriber.links("pose")[0].received, 3);
}

#[tokio::test]
async fn registry_client_reports_topology() {
    let (registry, _stop) = start_registry().await;
    let publisher = peer("camera", registry).await;
    let subscriber = peer("viewer", registry).await;
    publisher.advertise("pose").await.unwrap();
    subscriber.subscribe("pose", |_| {}).await.unwrap();

    let mut client = RegistryClient::connect(registry, fast_retry(), Duration::from_secs(2))
        .await
        .unwrap();

    let peers = client.list_peers().await.unwrap();
    let names: Vec<&str> = peers.iter().map(|p| p.peer_name.as_str()).collect();
    assert_eq!(names, vec!["camera", "viewer"]);
    assert_eq!(peers[0].roles, vec![Role::Publisher]);
    assert_eq!(Some(peers[0].address), publisher.local_addr());

    let topics = client.list_topics().await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].publishers, vec!["camera".to_string()]);
    assert_eq!(topics[0].subscribers, vec!["viewer".to_string()]);
    client.close().await;
}

#[tokio::test]
async fn close_removes_peer_from_registry() {
    let (registry, _stop) = start_registry().await;
    let publisher = peer("camera", registry).await;
    publisher.advertise("pose").await.unwrap();
    publisher.close().await.unwrap();
    assert_eq!(publisher.state(), PeerState::Closed);

    let mut client = RegistryClient::connect(registry, fast_retry(), Duration::from_secs(2))
        .await
        .unwrap();
    let mut gone = false;
    for _ in 0..100 {
        if client.list_peers().await.unwrap().is_empty() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone, "closed peer still listed");
    assert!(client.list_topics().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_subscription_detaches() {
    let (registry, _stop) = start_registry().await;
    let publisher = peer("camera", registry).await;
    let subscriber = peer("viewer", registry).await;
    publisher.advertise("pose").await.unwrap();

    let (inbox, handler) = collector();
    let subscription = subscriber.subscribe("pose", handler).await.unwrap();
    eventually("subscriber attached", || publisher.subscriber_count("pose") == 1).await;

    subscription.cancel();
    assert!(subscription.is_cancelled());
    eventually("link removed", || subscriber.links("pose").is_empty()).await;
    eventually("sink removed", || publisher.subscriber_count("pose") == 0).await;

    let delivered = publisher
        .publish("pose", serde_json::json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(delivered, 0);
    assert!(seen(&inbox).is_empty());
    assert_eq!(subscriber.state(), PeerState::Registered);
}

#[tokio::test]
async fn publishing_and_subscribing_is_both() {
    let (registry, _stop) = start_registry().await;
    let node = peer("relay", registry).await;
    node.advertise("out").await.unwrap();
    node.subscribe("in", |_| {}).await.unwrap();
    assert_eq!(node.state(), PeerState::Both);
}

#[tokio::test]
async fn restarted_publisher_on_new_port_is_relinked() {
    let (registry, _stop) = start_registry().await;
    let first = peer("camera", registry).await;
    first.advertise("pose").await.unwrap();
    let old_addr = first.local_addr().unwrap();

    // Slow redials keep the old link active while the publisher comes back.
    let subscriber = Peer::connect(peer_config("viewer", registry).with_retry(RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_millis(300),
        max_delay: Duration::from_millis(300),
    }))
    .await
    .unwrap();
    let (inbox, handler) = collector();
    subscriber.subscribe("pose", handler).await.unwrap();
    eventually("subscriber attached", || first.subscriber_count("pose") == 1).await;

    first.close().await.unwrap();
    wait_for_listing(registry, &["viewer"]).await;

    let second = peer("camera", registry).await;
    second.advertise("pose").await.unwrap();
    let new_addr = second.local_addr().unwrap();
    assert_ne!(new_addr, old_addr);

    eventually("link to new address", || {
        subscriber
            .links("pose")
            .first()
            .is_some_and(|l| l.active && l.address == new_addr)
    })
    .await;
    eventually("attached to restarted publisher", || {
        second.subscriber_count("pose") == 1
    })
    .await;

    let delivered = second
        .publish("pose", serde_json::json!({ "n": 7 }))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    eventually("message from restarted publisher", || seen(&inbox) == vec![7]).await;
    assert_eq!(subscriber.links("pose").len(), 1);
}

#[tokio::test]
async fn heartbeats_keep_peer_registered() {
    let (registry, _stop) = start_registry_with(Some(Duration::from_millis(100))).await;
    let camera = Peer::connect(
        peer_config("camera", registry).with_heartbeat(Some(Duration::from_millis(30))),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut client = RegistryClient::connect(registry, fast_retry(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(listed_peers(&mut client).await, vec!["camera".to_string()]);
    assert!(camera.state().is_registered());
    client.close().await;
}

#[tokio::test]
async fn silent_peer_is_expired() {
    let (registry, _stop) = start_registry_with(Some(Duration::from_millis(100))).await;
    let _camera = peer("camera", registry).await;
    wait_for_listing(registry, &["camera"]).await;
    wait_for_listing(registry, &[]).await;
}

#[tokio::test]
async fn failed_resubscribe_keeps_previous_subscription() {
    let (registry, _stop) = start_registry_with(Some(Duration::from_millis(100))).await;
    let publisher = Peer::connect(
        peer_config("camera", registry).with_heartbeat(Some(Duration::from_millis(30))),
    )
    .await
    .unwrap();
    let subscriber = peer("viewer", registry).await;

    publisher.advertise("pose").await.unwrap();
    let (inbox, handler) = collector();
    subscriber.subscribe("pose", handler).await.unwrap();
    eventually("subscriber attached", || publisher.subscriber_count("pose") == 1).await;

    // Without heartbeats the subscriber drops out of the registry, so the
    // next registry request fails.
    wait_for_listing(registry, &["camera"]).await;
    assert!(subscriber.subscribe("pose", |_| {}).await.is_err());

    assert_eq!(subscriber.links("pose").len(), 1);
    assert_eq!(subscriber.state(), PeerState::Subscribing);
    let delivered = publisher
        .publish("pose", serde_json::json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    eventually("message to original handler", || seen(&inbox) == vec![1]).await;
}
