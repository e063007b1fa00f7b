use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::LogicalClock;
use crate::membership::registry::PeerRegistry;
use crate::membership::types::{Peer, ServerId};
use crate::network::reliable::{Delivery, ReliableDelivery};
use crate::network::transport::{DeliveryError, Endpoint, Link};
use crate::protocol::message::Message;
use crate::store::backend::NodeStore;

#[derive(Debug, Clone, Copy)]
pub struct ReplicationSettings {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(3),
        }
    }
}

/// Pushes local mutations to every known peer.
///
/// All sends run on tracked background tasks; `broadcast` never waits on the
/// network. Peers apply `SYNC` payloads without re-broadcasting them, so a
/// mutation travels exactly one hop.
pub struct ReplicationBroadcaster {
    self_id: ServerId,
    registry: Arc<PeerRegistry>,
    clock: Arc<LogicalClock>,
    store: Arc<dyn NodeStore>,
    peer_token: String,
    settings: ReplicationSettings,
    delivery: ReliableDelivery,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ReplicationBroadcaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: ServerId,
        registry: Arc<PeerRegistry>,
        clock: Arc<LogicalClock>,
        store: Arc<dyn NodeStore>,
        peer_token: impl Into<String>,
        settings: ReplicationSettings,
        delivery: ReliableDelivery,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            registry,
            clock,
            store,
            peer_token: peer_token.into(),
            settings,
            delivery,
            tracker,
            shutdown,
        })
    }

    /// Fire-and-forget replication of one raw protocol line.
    /// Returns the number of peers a push was started for.
    pub fn broadcast(&self, raw: &str) -> usize {
        let peers = self.registry.all_peers();
        if peers.is_empty() {
            return 0;
        }

        let line = format!("SYNC|{}|{}", self.clock.tick(), raw);
        tracing::debug!("Broadcasting to {} peer(s): {}", peers.len(), line);

        for peer in &peers {
            let target = peer.endpoint();
            let peer_id = peer.id;
            let line = line.clone();
            let token = self.peer_token.clone();
            let settings = self.settings;
            let shutdown = self.shutdown.clone();

            self.tracker.spawn(async move {
                push_with_retry(peer_id, target, token, line, settings, shutdown).await;
            });
        }

        peers.len()
    }

    /// Replays every stored node to `peer` over one connection, as a `REPORT`
    /// followed by the node's `STATUS`. Returns the number of nodes sent.
    pub async fn sync_full_state_to(&self, peer: &Peer) -> Result<usize> {
        let nodes = self.store.list_nodes().await?;

        let mut link = Link::open(
            &peer.endpoint(),
            &self.peer_token,
            self.settings.connect_timeout,
            self.settings.reply_timeout,
        )
        .await?;

        for node in &nodes {
            let report = Message::Report(node.as_report());
            link.send(&format!("SYNC|{}|{}", self.clock.tick(), report)).await?;

            let status = Message::Status {
                node_id: node.node_id.clone(),
                status: node.status,
            };
            link.send(&format!("SYNC|{}|{}", self.clock.tick(), status)).await?;
        }
        link.close().await;

        tracing::info!(
            "Full sync to server #{}: {} node(s) sent",
            peer.id,
            nodes.len()
        );
        Ok(nodes.len())
    }

    pub fn spawn_full_sync(self: &Arc<Self>, peer: Peer) {
        let broadcaster = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = broadcaster.sync_full_state_to(&peer).await {
                tracing::warn!("Full sync to server #{} failed: {}", peer.id, e);
            }
        });
    }

    /// Asks `peer` to push its own state back to us.
    pub async fn join(&self, peer: &Peer, advertise: &Endpoint) -> Result<Delivery, DeliveryError> {
        let join = Message::Join {
            server_id: self.self_id,
            host: advertise.host.clone(),
            port: advertise.port,
        };
        self.delivery.send_critical(&peer.endpoint(), &join.to_string()).await
    }

    /// Bidirectional catch-up with a newly pinned peer: push our state, then
    /// `JOIN` so it pushes its state to us.
    pub fn spawn_join_handshake(self: &Arc<Self>, peer: Peer, advertise: Endpoint) {
        let broadcaster = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = broadcaster.sync_full_state_to(&peer).await {
                tracing::warn!("Full sync to server #{} failed: {}", peer.id, e);
            }

            match broadcaster.join(&peer, &advertise).await {
                Ok(delivery) => tracing::info!(
                    "Joined server #{} after {} attempt(s)",
                    peer.id,
                    delivery.attempts
                ),
                Err(e) => tracing::warn!("JOIN to server #{} failed: {}", peer.id, e),
            }
        });
    }

    /// Cancels in-flight pushes and waits for every tracked task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn push_with_retry(
    peer_id: ServerId,
    target: Endpoint,
    token: String,
    line: String,
    settings: ReplicationSettings,
    shutdown: CancellationToken,
) {
    let attempts = settings.attempts.max(1);

    for attempt in 1..=attempts {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = push_once(&target, &token, &line, settings) => result,
        };

        match result {
            Ok(()) => {
                tracing::trace!("Replicated to server #{} on attempt {}", peer_id, attempt);
                return;
            }
            Err(e) => {
                tracing::debug!(
                    "Replication to server #{} attempt {}/{} failed: {}",
                    peer_id,
                    attempt,
                    attempts,
                    e
                );
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(settings.retry_delay) => {}
            }
        }
    }

    tracing::warn!(
        "Permanent replication failure to server #{} at {} after {} attempts",
        peer_id,
        target,
        attempts
    );
}

async fn push_once(
    target: &Endpoint,
    token: &str,
    line: &str,
    settings: ReplicationSettings,
) -> Result<(), DeliveryError> {
    let mut link = Link::open(target, token, settings.connect_timeout, settings.reply_timeout).await?;
    link.send(line).await?;
    link.close().await;
    Ok(())
}
