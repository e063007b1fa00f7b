use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

use super::types::{Peer, PeerRecord, ServerId};

pub const DEFAULT_PEER_EXPIRY: Duration = Duration::from_secs(7);

/// Known HQ peers keyed by server id.
///
/// Discovered entries expire after `expiry` of silence; pinned entries stay
/// until explicitly removed. Only peers seen within `expiry` count as live.
pub struct PeerRegistry {
    peers: DashMap<ServerId, PeerRecord>,
    expiry: Duration,
}

impl PeerRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn register_discovered(&self, peer: Peer) -> bool {
        self.register_discovered_at(peer, Instant::now())
    }

    /// Inserts or refreshes an entry from a beacon. Returns `true` if the
    /// peer was unknown. A pinned entry keeps its configured address.
    pub fn register_discovered_at(&self, peer: Peer, now: Instant) -> bool {
        match self.peers.entry(peer.id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.pinned {
                    record.peer.claims_leader = peer.claims_leader;
                } else {
                    record.peer = peer;
                }
                record.last_seen = now;
                false
            }
            Entry::Vacant(entry) => {
                tracing::info!(
                    "Discovered peer server #{} at {}:{} (leader claim: {})",
                    peer.id,
                    peer.host,
                    peer.port,
                    peer.claims_leader
                );
                entry.insert(PeerRecord {
                    peer,
                    last_seen: now,
                    pinned: false,
                });
                true
            }
        }
    }

    /// Inserts an expiry-exempt entry. Returns `true` only the first time the
    /// id is seen, so the caller runs its handshake once.
    pub fn register_pinned(&self, id: ServerId, host: &str, port: u16) -> bool {
        let now = Instant::now();

        match self.peers.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.pinned = true;
                record.peer.host = host.to_string();
                record.peer.port = port;
                record.last_seen = now;
                false
            }
            Entry::Vacant(entry) => {
                tracing::info!("Pinned peer server #{} at {}:{}", id, host, port);
                entry.insert(PeerRecord {
                    peer: Peer {
                        id,
                        host: host.to_string(),
                        port,
                        claims_leader: false,
                    },
                    last_seen: now,
                    pinned: true,
                });
                true
            }
        }
    }

    pub fn expire_stale(&self) -> Vec<ServerId> {
        self.expire_stale_at(Instant::now())
    }

    /// Drops non-pinned peers silent for longer than the expiry window.
    pub fn expire_stale_at(&self, now: Instant) -> Vec<ServerId> {
        let mut expired = Vec::new();

        self.peers.retain(|id, record| {
            let silent = now.saturating_duration_since(record.last_seen);
            if !record.pinned && silent > self.expiry {
                expired.push(*id);
                false
            } else {
                true
            }
        });

        for id in &expired {
            tracing::warn!("Peer server #{} expired after silence", id);
        }
        expired
    }

    pub fn live_peers(&self) -> Vec<Peer> {
        self.live_peers_at(Instant::now())
    }

    pub fn live_peers_at(&self, now: Instant) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().last_seen) <= self.expiry)
            .map(|entry| entry.value().peer.clone())
            .collect()
    }

    /// Every known peer, live or not, ordered by id.
    pub fn all_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .map(|entry| entry.value().peer.clone())
            .collect();
        peers.sort_by_key(|peer| peer.id);
        peers
    }

    pub fn get(&self, id: ServerId) -> Option<PeerRecord> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: ServerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_EXPIRY)
    }
}
