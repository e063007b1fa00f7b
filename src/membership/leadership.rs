use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use super::registry::PeerRegistry;
use super::types::{Role, ServerId};

/// Soft single-leader decision over the registry's live peers.
///
/// Two rules, evaluated after every registry change and on the sweep timer:
/// a leader steps down when a live peer with a smaller id also claims, and a
/// follower takes over when no live peer claims at all.
pub struct LeadershipController {
    self_id: ServerId,
    registry: Arc<PeerRegistry>,
    role_tx: watch::Sender<Role>,
}

impl LeadershipController {
    pub fn new(self_id: ServerId, registry: Arc<PeerRegistry>) -> Self {
        let (role_tx, _) = watch::channel(Role::Follower);
        Self {
            self_id,
            registry,
            role_tx,
        }
    }

    pub fn self_id(&self) -> ServerId {
        self.self_id
    }

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn recompute(&self) -> Role {
        self.recompute_at(Instant::now())
    }

    pub fn recompute_at(&self, now: Instant) -> Role {
        let claimants: Vec<ServerId> = self
            .registry
            .live_peers_at(now)
            .into_iter()
            .filter(|peer| peer.claims_leader)
            .map(|peer| peer.id)
            .collect();

        let self_id = self.self_id;
        let mut next = Role::Follower;
        self.role_tx.send_if_modified(|role| {
            next = decide(self_id, *role, &claimants);
            if next == *role {
                return false;
            }

            match next {
                Role::Leader => tracing::info!("Server #{} is now the LEADER", self_id),
                Role::Follower => tracing::info!(
                    "Server #{} stepping down, live claimants: {:?}",
                    self_id,
                    claimants
                ),
            }
            *role = next;
            true
        });
        next
    }
}

/// Pure leadership rule.
pub fn decide(self_id: ServerId, current: Role, claimants: &[ServerId]) -> Role {
    match current {
        Role::Leader if claimants.iter().any(|id| *id < self_id) => Role::Follower,
        Role::Leader => Role::Leader,
        Role::Follower if claimants.is_empty() => Role::Leader,
        Role::Follower => Role::Follower,
    }
}
