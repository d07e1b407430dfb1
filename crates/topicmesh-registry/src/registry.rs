use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use topicmesh_frame::{Envelope, PeerSummary, PublisherAddr, Role, TopicSummary};
use tracing::{debug, info};

use crate::error::{RegistryError, Result};

/// Identifies the registry connection a record arrived on.
pub type ConnId = u64;

/// What the registry knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_name: String,
    pub address: SocketAddr,
    pub roles: BTreeSet<Role>,
    pub topics: BTreeSet<String>,
    owner: ConnId,
    last_seen: Instant,
}

impl PeerRecord {
    /// Connection that registered this peer.
    pub fn owner(&self) -> ConnId {
        self.owner
    }

    /// Last time anything arrived on the owning connection.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_name: self.peer_name.clone(),
            address: self.address,
            roles: self.roles.iter().copied().collect(),
            topics: self.topics.iter().cloned().collect(),
        }
    }

    fn publisher_addr(&self) -> PublisherAddr {
        PublisherAddr {
            peer_name: self.peer_name.clone(),
            address: self.address,
        }
    }
}

/// An envelope the registry wants delivered to a registered peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub to: String,
    pub envelope: Envelope,
}

#[derive(Debug, Default, Clone)]
struct TopicEntry {
    publishers: BTreeSet<String>,
    subscribers: BTreeSet<String>,
}

impl TopicEntry {
    fn is_empty(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }
}

/// Live topology: the peer table plus the topic index derived from it.
///
/// Every name in the topic index is also a key of the peer table. Holds
/// current membership only, no history.
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<String, PeerRecord>,
    topics: BTreeMap<String, TopicEntry>,
    stale_after: Option<Duration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat records silent for longer than `stale_after` as stale.
    pub fn with_stale_after(stale_after: Option<Duration>) -> Self {
        Self {
            stale_after,
            ..Self::default()
        }
    }

    /// Create or refresh a peer record.
    ///
    /// Same name and address is an idempotent refresh. Same name at a new
    /// address replaces the old record only when that record is stale.
    pub fn register(
        &mut self,
        peer_name: &str,
        address: SocketAddr,
        owner: ConnId,
        now: Instant,
    ) -> Result<()> {
        if let Some(existing) = self.peers.get_mut(peer_name) {
            if existing.address == address {
                existing.owner = owner;
                existing.last_seen = now;
                debug!(peer = peer_name, %address, "peer re-registered");
                return Ok(());
            }

            if !is_stale(existing, self.stale_after, now) {
                return Err(RegistryError::DuplicateNameConflict {
                    peer_name: peer_name.to_string(),
                    existing: existing.address,
                });
            }

            info!(peer = peer_name, old = %existing.address, new = %address, "replacing stale peer record");
            self.on_disconnect(peer_name);
        }

        self.peers.insert(
            peer_name.to_string(),
            PeerRecord {
                peer_name: peer_name.to_string(),
                address,
                roles: BTreeSet::new(),
                topics: BTreeSet::new(),
                owner,
                last_seen: now,
            },
        );
        info!(peer = peer_name, %address, "peer registered");
        Ok(())
    }

    /// Record `peer_name` as a publisher of `topic`.
    ///
    /// A newly added publisher is announced to every current subscriber.
    pub fn register_publisher(&mut self, peer_name: &str, topic: &str) -> Result<Vec<Push>> {
        let record = self
            .peers
            .get_mut(peer_name)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_name.to_string()))?;
        record.roles.insert(Role::Publisher);
        record.topics.insert(topic.to_string());
        let announced = record.publisher_addr();

        let entry = self.topics.entry(topic.to_string()).or_default();
        if !entry.publishers.insert(peer_name.to_string()) {
            return Ok(Vec::new());
        }
        info!(peer = peer_name, topic, subscribers = entry.subscribers.len(), "publisher registered");

        Ok(entry
            .subscribers
            .iter()
            .map(|subscriber| Push {
                to: subscriber.clone(),
                envelope: Envelope::PublisherInfo {
                    topic: topic.to_string(),
                    publishers: vec![announced.clone()],
                },
            })
            .collect())
    }

    /// Record `peer_name` as a subscriber of `topic`.
    ///
    /// The subscriber is always sent the full current publisher list.
    pub fn register_subscriber(&mut self, peer_name: &str, topic: &str) -> Result<Vec<Push>> {
        let record = self
            .peers
            .get_mut(peer_name)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_name.to_string()))?;
        record.roles.insert(Role::Subscriber);
        record.topics.insert(topic.to_string());

        self.topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .insert(peer_name.to_string());

        let publishers: Vec<PublisherAddr> = self
            .lookup_publishers(topic)
            .iter()
            .map(PeerRecord::publisher_addr)
            .collect();
        info!(peer = peer_name, topic, publishers = publishers.len(), "subscriber registered");

        Ok(vec![Push {
            to: peer_name.to_string(),
            envelope: Envelope::PublisherInfo {
                topic: topic.to_string(),
                publishers,
            },
        }])
    }

    /// Current publishers of `topic`, possibly none.
    pub fn lookup_publishers(&self, topic: &str) -> Vec<PeerRecord> {
        self.topics
            .get(topic)
            .map(|entry| {
                entry
                    .publishers
                    .iter()
                    .filter_map(|name| self.peers.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget `peer_name` everywhere. Returns whether a record existed.
    pub fn on_disconnect(&mut self, peer_name: &str) -> bool {
        let removed = self.peers.remove(peer_name).is_some();
        self.topics.retain(|_, entry| {
            entry.publishers.remove(peer_name);
            entry.subscribers.remove(peer_name);
            !entry.is_empty()
        });
        if removed {
            info!(peer = peer_name, "peer removed");
        }
        removed
    }

    /// Explicit unregister; honoured only from the owning connection.
    pub fn unregister(&mut self, peer_name: &str, owner: ConnId) -> bool {
        match self.peers.get(peer_name) {
            Some(record) if record.owner == owner => self.on_disconnect(peer_name),
            _ => false,
        }
    }

    /// Refresh liveness of every record owned by `owner`.
    pub fn touch(&mut self, owner: ConnId, now: Instant) {
        for record in self.peers.values_mut().filter(|r| r.owner == owner) {
            record.last_seen = now;
        }
    }

    /// Drop every record owned by a connection that went away.
    ///
    /// Records re-claimed by a newer connection are left alone.
    pub fn release(&mut self, owner: ConnId) -> Vec<String> {
        let names: Vec<String> = self
            .peers
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.peer_name.clone())
            .collect();
        for name in &names {
            self.on_disconnect(name);
        }
        names
    }

    /// Remove records that have been silent for longer than the stale limit.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<(String, ConnId)> {
        let stale_after = self.stale_after;
        let expired: Vec<(String, ConnId)> = self
            .peers
            .values()
            .filter(|r| is_stale(r, stale_after, now))
            .map(|r| (r.peer_name.clone(), r.owner))
            .collect();
        for (name, _) in &expired {
            self.on_disconnect(name);
        }
        expired
    }

    pub fn peer(&self, peer_name: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_name)
    }

    /// Connection to route pushes for `peer_name` through.
    pub fn owner_of(&self, peer_name: &str) -> Option<ConnId> {
        self.peers.get(peer_name).map(|r| r.owner)
    }

    /// Snapshot of every peer, sorted by name.
    pub fn peers(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self.peers.values().map(PeerRecord::summary).collect();
        out.sort_by(|a, b| a.peer_name.cmp(&b.peer_name));
        out
    }

    /// Snapshot of every topic, sorted by name.
    pub fn topics(&self) -> Vec<TopicSummary> {
        self.topics
            .iter()
            .map(|(topic, entry)| TopicSummary {
                topic: topic.clone(),
                publishers: entry.publishers.iter().cloned().collect(),
                subscribers: entry.subscribers.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn is_stale(record: &PeerRecord, stale_after: Option<Duration>, now: Instant) -> bool {
    stale_after.is_some_and(|limit| now.saturating_duration_since(record.last_seen) > limit)
}
