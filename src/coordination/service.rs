use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::types::{ClusterStatus, Origin, ServerStats};
use crate::clock::LogicalClock;
use crate::config::CoordinationConfig;
use crate::detector::monitor::{FailureDetector, Transition, TransitionHook};
use crate::membership::discovery::DiscoveryService;
use crate::membership::leadership::LeadershipController;
use crate::membership::registry::PeerRegistry;
use crate::membership::types::{Peer, Role, ServerId};
use crate::network::reliable::ReliableDelivery;
use crate::network::transport::{Endpoint, TcpTransport};
use crate::protocol::message::{
    ACK_OUTAGE, ACK_REPORT, JOINED, Message, OutageNotice, Reply, SOLVED_CHECK, STATUS_RESTORED,
};
use crate::replication::broadcaster::ReplicationBroadcaster;
use crate::server;
use crate::store::backend::NodeStore;
use crate::store::types::*;

/// A client session's push channel, tagged with its session id.
struct SessionHandle {
    session_id: u64,
    sender: mpsc::UnboundedSender<String>,
}

/// One HQ server: owns the clock, registry, leadership, replication and
/// detector, and exposes the operations admin surfaces call.
pub struct CoordinationService {
    config: CoordinationConfig,
    self_id: ServerId,
    clock: Arc<LogicalClock>,
    registry: Arc<PeerRegistry>,
    leadership: Arc<LeadershipController>,
    store: Arc<dyn NodeStore>,
    broadcaster: Arc<ReplicationBroadcaster>,
    detector: Arc<FailureDetector>,
    connected: DashMap<String, SessionHandle>,
    pending_commands: DashMap<String, Vec<String>>,
    started_at: Instant,
    message_count: AtomicU64,
    next_session_id: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    discovery: OnceLock<Arc<DiscoveryService>>,
    local_addr: OnceLock<SocketAddr>,
}

impl CoordinationService {
    pub fn new(config: CoordinationConfig, store: Arc<dyn NodeStore>) -> Result<Arc<Self>> {
        config.validate()?;

        let self_id = config.server_id();
        let clock = Arc::new(LogicalClock::new());
        let registry = Arc::new(PeerRegistry::new(config.registry.expiry()));
        let leadership = Arc::new(LeadershipController::new(self_id, registry.clone()));
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let replication = config.replication.settings();
        let join_transport = TcpTransport::new(config.tokens.peer.clone(), replication.connect_timeout);
        let broadcaster = ReplicationBroadcaster::new(
            self_id,
            registry.clone(),
            clock.clone(),
            store.clone(),
            config.tokens.peer.clone(),
            replication,
            ReliableDelivery::new(Arc::new(join_transport), config.delivery.policy()),
            tracker.clone(),
            shutdown.child_token(),
        );

        let detector = Arc::new(FailureDetector::new(
            store.clone(),
            leadership.clone(),
            clock.clone(),
            config.detector.thresholds(),
            config.detector.interval(),
        ));

        Ok(Arc::new(Self {
            config,
            self_id,
            clock,
            registry,
            leadership,
            store,
            broadcaster,
            detector,
            connected: DashMap::new(),
            pending_commands: DashMap::new(),
            started_at: Instant::now(),
            message_count: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
            shutdown,
            tracker,
            discovery: OnceLock::new(),
            local_addr: OnceLock::new(),
        }))
    }

    /// Binds the session listener and starts every background loop.
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.bind_host.as_str(), self.config.tcp_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind {}:{}",
                    self.config.bind_host, self.config.tcp_port
                )
            })?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        tracing::info!("HQ server #{} listening on {}", self.self_id, addr);

        self.tracker.spawn(server::listener::serve(
            listener,
            self.clone(),
            self.shutdown.child_token(),
            self.tracker.clone(),
        ));

        for peer in &self.config.peers {
            self.register_pinned_peer(ServerId(peer.id), &peer.host, peer.port);
        }
        self.leadership.recompute();

        let service = self.clone();
        self.tracker.spawn(async move { service.registry_sweep_loop().await });

        let broadcaster = self.broadcaster.clone();
        let hook: TransitionHook = Arc::new(move |transition: &Transition| {
            let status = Message::Status {
                node_id: transition.node_id.clone(),
                status: transition.to,
            };
            broadcaster.broadcast(&status.to_string());
        });
        self.tracker
            .spawn(self.detector.clone().run(self.shutdown.child_token(), hook));

        if self.config.discovery.enabled {
            self.start_discovery(addr.port()).await;
        }

        Ok(addr)
    }

    async fn start_discovery(self: &Arc<Self>, tcp_port: u16) {
        let leadership = self.leadership.clone();
        let weak: Weak<Self> = Arc::downgrade(self);

        let discovery = DiscoveryService::new(
            self.self_id,
            tcp_port,
            self.config.discovery.clone(),
            Arc::new(move || leadership.is_leader()),
            Arc::new(move |peer: Peer| {
                if let Some(service) = weak.upgrade() {
                    service.on_peer_discovered(peer);
                }
            }),
            self.shutdown.child_token(),
        );

        match discovery.clone().start(&self.tracker).await {
            Ok(()) => {
                let _ = self.discovery.set(discovery);
            }
            Err(e) => tracing::warn!("Discovery unavailable, relying on pinned peers: {}", e),
        }
    }

    async fn registry_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.registry.sweep_interval());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.registry.expire_stale();
                    self.leadership.recompute();
                }
            }
        }
    }

    /// Stops every loop and waits for in-flight sessions and pushes.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down HQ server #{}", self.self_id);
        if let Some(discovery) = self.discovery.get() {
            discovery.stop();
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    // ============================================================
    // PEERS
    // ============================================================

    pub fn on_peer_discovered(&self, peer: Peer) {
        if peer.id == self.self_id {
            return;
        }
        if self.registry.register_discovered(peer.clone()) {
            self.broadcaster.spawn_full_sync(peer);
        }
        self.leadership.recompute();
    }

    /// Pins a statically known peer. The first registration runs the
    /// bidirectional catch-up handshake.
    pub fn register_pinned_peer(&self, id: ServerId, host: &str, port: u16) -> bool {
        if id == self.self_id {
            return false;
        }
        let is_new = self.registry.register_pinned(id, host, port);
        if is_new {
            let peer = Peer {
                id,
                host: host.to_string(),
                port,
                claims_leader: false,
            };
            self.broadcaster.spawn_join_handshake(peer, self.advertise());
        }
        self.leadership.recompute();
        is_new
    }

    /// A peer announced itself with `JOIN`: pin it and push our state back.
    pub fn handle_join(&self, server_id: ServerId, host: &str, port: u16, remote: Option<IpAddr>) -> Reply {
        if server_id == self.self_id {
            return Reply::Error("JOIN|SelfJoin".to_string());
        }

        let host = match (host, remote) {
            ("" | "0" | "0.0.0.0" | "localhost", Some(remote)) => remote.to_string(),
            _ => host.to_string(),
        };

        self.registry.register_pinned(server_id, &host, port);
        self.broadcaster.spawn_full_sync(Peer {
            id: server_id,
            host,
            port,
            claims_leader: false,
        });
        self.leadership.recompute();

        Reply::Ack(JOINED)
    }

    fn advertise(&self) -> Endpoint {
        let port = self
            .local_addr
            .get()
            .map(|addr| addr.port())
            .unwrap_or(self.config.tcp_port);
        Endpoint::new(self.config.advertise_host.clone(), port)
    }

    // ============================================================
    // DISPATCH
    // ============================================================

    pub fn tokens(&self) -> (&str, &str) {
        (&self.config.tokens.client, &self.config.tokens.peer)
    }

    /// Applies one authenticated message and produces its reply.
    pub async fn dispatch(&self, message: Message, origin: Origin) -> Reply {
        self.message_count.fetch_add(1, Ordering::Relaxed);

        match message {
            Message::Sync { clock, inner } => {
                if let Some(remote_clock) = clock {
                    self.clock.observe(remote_clock);
                }
                let origin = match origin {
                    Origin::Peer { .. } => origin,
                    Origin::Client => Origin::Peer { remote: None },
                };
                self.apply(*inner, origin, clock).await
            }
            other => self.apply(other, origin, None).await,
        }
    }

    /// `stamp` is the sender's logical clock when the message arrived inside
    /// a stamped `SYNC`.
    async fn apply(&self, message: Message, origin: Origin, stamp: Option<i64>) -> Reply {
        match message {
            Message::Report(report) => self.apply_report(report, origin, stamp).await,
            Message::Outage(notice) => self.apply_outage(notice, origin).await,
            Message::ConfirmResolved { node_id } => {
                self.apply_resolved(&node_id, "field", origin).await
            }
            Message::Status { node_id, status } => {
                if let Err(e) = self.store.set_status(&node_id, status, now_ms()).await {
                    tracing::error!("Failed to adopt status of {}: {}", node_id, e);
                    return Reply::AckNotPersisted("STATUS");
                }
                Reply::Ok
            }
            Message::Join {
                server_id,
                host,
                port,
            } => {
                let remote = match origin {
                    Origin::Peer { remote } => remote,
                    Origin::Client => None,
                };
                self.handle_join(server_id, &host, port, remote)
            }
            Message::VerifyRelay { node_id } => {
                self.relay_verification(&node_id);
                Reply::Ok
            }
            Message::Auth { .. } => Reply::Error("AUTH|AlreadyAuthenticated".to_string()),
            Message::Sync { .. } => Reply::Error("SYNC|Nested".to_string()),
        }
    }

    fn replicate(&self, message: &Message, origin: Origin) {
        if origin.is_client() {
            self.broadcaster.broadcast(&message.to_string());
        }
    }

    async fn apply_report(&self, report: NodeReport, origin: Origin, stamp: Option<i64>) -> Reply {
        let now = now_ms();
        let logical = if origin.is_client() {
            self.clock.tick()
        } else {
            stamp.unwrap_or_else(|| self.clock.peek())
        };

        let reply = match self.store.apply_report(&report, now, logical).await {
            Ok(outcome) if outcome.stale => {
                tracing::debug!(
                    "Stale REPORT for {} (lt={} < {}), fields kept",
                    report.node_id,
                    logical,
                    outcome.node.logical_timestamp
                );
                Reply::Ack(ACK_REPORT)
            }
            Ok(outcome) => {
                tracing::trace!("REPORT {} -> {}", report.node_id, outcome.node.status);
                if origin.is_client() {
                    self.record_power_transition(&report, outcome.previous_power.as_ref(), now)
                        .await;
                }
                Reply::Ack(ACK_REPORT)
            }
            Err(e) => {
                tracing::error!("REPORT from {} not persisted: {}", report.node_id, e);
                Reply::AckNotPersisted(ACK_REPORT)
            }
        };

        self.replicate(&Message::Report(report), origin);
        reply
    }

    async fn record_power_transition(&self, report: &NodeReport, previous: Option<&PowerState>, now: u64) {
        let Some(event_type) = power_transition_event(previous, &report.power_state) else {
            return;
        };

        let metadata = serde_json::json!({
            "from": previous.map(|p| p.to_string()),
            "to": report.power_state.to_string(),
            "voltage": report.voltage,
            "region": report.region,
        });
        let event = Event {
            event_id: EventId::new(),
            node_id: report.node_id.clone(),
            event_type: event_type.to_string(),
            timestamp_ms: now,
            logical_timestamp: self.clock.tick(),
            metadata: metadata.to_string(),
        };

        tracing::info!("{} for {}", event_type, report.node_id);
        if let Err(e) = self.store.insert_event(event).await {
            tracing::error!("Failed to record {} for {}: {}", event_type, report.node_id, e);
        }
    }

    async fn apply_outage(&self, notice: OutageNotice, origin: Origin) -> Reply {
        let now = now_ms();
        let timestamp_ms = notice
            .timestamp
            .map(|ts| ts.timestamp_millis().max(0) as u64)
            .unwrap_or(now);
        let logical = if origin.is_client() {
            self.clock.tick()
        } else {
            self.clock.peek()
        };

        let event = Event {
            event_id: notice.event_id.clone(),
            node_id: notice.node_id.clone(),
            event_type: notice.event_type.clone(),
            timestamp_ms,
            logical_timestamp: logical,
            metadata: notice.metadata.clone(),
        };

        match self.store.insert_event(event).await {
            Ok(WriteOutcome::Duplicate) => {
                tracing::debug!("Duplicate OUTAGE {} ignored", notice.event_id);
                return Reply::Ack(ACK_OUTAGE);
            }
            Ok(WriteOutcome::Applied) => {
                if let Err(e) = self.apply_outage_state(&notice, now).await {
                    tracing::error!("OUTAGE {} state update failed: {}", notice.event_id, e);
                }
            }
            Err(e) => {
                tracing::error!("OUTAGE {} not persisted: {}", notice.event_id, e);
                self.replicate(&Message::Outage(notice), origin);
                return Reply::AckNotPersisted(ACK_OUTAGE);
            }
        }

        tracing::info!(
            "OUTAGE {} {} for {}",
            notice.event_id,
            notice.event_type,
            notice.node_id
        );
        self.replicate(&Message::Outage(notice), origin);
        Reply::Ack(ACK_OUTAGE)
    }

    async fn apply_outage_state(&self, notice: &OutageNotice, now: u64) -> Result<(), StoreError> {
        if notice.is_start() {
            self.store
                .update_power_state(&notice.node_id, PowerState::Outage, now)
                .await?;
            self.store
                .set_status(&notice.node_id, NodeStatus::Outage, now)
                .await?;
        } else if notice.is_end() {
            self.store
                .update_power_state(&notice.node_id, PowerState::Normal, now)
                .await?;
        }
        Ok(())
    }

    async fn apply_resolved(&self, node_id: &str, operator: &str, origin: Origin) -> Reply {
        let now = now_ms();

        match self.store.confirm_resolved(node_id, now).await {
            Ok(true) if origin.is_client() => {
                let event = Event {
                    event_id: EventId::new(),
                    node_id: node_id.to_string(),
                    event_type: "STATUS_RESTORED".to_string(),
                    timestamp_ms: now,
                    logical_timestamp: self.clock.tick(),
                    metadata: serde_json::json!({ "operator": operator }).to_string(),
                };
                if let Err(e) = self.store.insert_event(event).await {
                    tracing::error!("Failed to record resolution of {}: {}", node_id, e);
                }
                tracing::info!("{} confirmed resolved by {}", node_id, operator);
            }
            Ok(true) => {}
            Ok(false) => tracing::debug!("CONFIRM_RESOLVED for unknown node {}", node_id),
            Err(e) => {
                tracing::error!("CONFIRM_RESOLVED for {} not persisted: {}", node_id, e);
            }
        }

        self.replicate(
            &Message::ConfirmResolved {
                node_id: node_id.to_string(),
            },
            origin,
        );
        Reply::Ack(STATUS_RESTORED)
    }

    // ============================================================
    // CLIENT SESSIONS
    // ============================================================

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Routes server pushes for `node_id` to this session and flushes any
    /// commands queued while the node was not connected.
    pub fn bind_session(&self, node_id: &str, session_id: u64, sender: mpsc::UnboundedSender<String>) {
        for command in self.take_pending_commands(node_id) {
            let _ = sender.send(command);
        }
        self.connected.insert(
            node_id.to_string(),
            SessionHandle { session_id, sender },
        );
        tracing::debug!("{} bound to session {}", node_id, session_id);
    }

    /// Forgets the binding unless another session has taken it over.
    /// The node's status is left to the failure detector.
    pub fn unbind_session(&self, node_id: &str, session_id: u64) {
        self.connected
            .remove_if(node_id, |_, handle| handle.session_id == session_id);
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connected.contains_key(node_id)
    }

    fn relay_verification(&self, node_id: &str) -> bool {
        let delivered = self
            .connected
            .get(node_id)
            .is_some_and(|handle| handle.sender.send(SOLVED_CHECK.to_string()).is_ok());

        if delivered {
            tracing::info!("Sent {} to {}", SOLVED_CHECK, node_id);
        } else {
            self.pending_commands
                .entry(node_id.to_string())
                .or_default()
                .push(SOLVED_CHECK.to_string());
            tracing::debug!("{} not connected here, queued {}", node_id, SOLVED_CHECK);
        }
        delivered
    }

    // ============================================================
    // OPERATIONS
    // ============================================================

    pub async fn submit_report(&self, report: NodeReport) -> Reply {
        self.dispatch(Message::Report(report), Origin::Client).await
    }

    pub async fn submit_outage(&self, notice: OutageNotice) -> Reply {
        self.dispatch(Message::Outage(notice), Origin::Client).await
    }

    /// Builds an `OUTAGE` with a fresh event id stamped now.
    pub fn new_outage(node_id: &str, event_type: &str, metadata: &str) -> OutageNotice {
        OutageNotice {
            event_id: EventId::new(),
            node_id: node_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Some(Utc::now()),
            metadata: metadata.to_string(),
        }
    }

    /// Marks the node's verification pending and asks whichever server holds
    /// its session to send `SOLVED_CHECK`. Returns whether this server
    /// delivered it directly.
    pub async fn trigger_verification(&self, node_id: &str) -> Result<bool, StoreError> {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.store
            .set_verification(node_id, VerificationStatus::Pending)
            .await?;

        let delivered = self.relay_verification(node_id);
        self.broadcaster.broadcast(
            &Message::VerifyRelay {
                node_id: node_id.to_string(),
            }
            .to_string(),
        );
        Ok(delivered)
    }

    pub async fn mark_resolved(&self, node_id: &str, operator: &str) -> Reply {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.apply_resolved(node_id, operator, Origin::Client).await
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatus, StoreError> {
        let counts = self.store.status_counts().await?;

        Ok(ClusterStatus {
            server_id: self.self_id,
            port: self.advertise().port,
            is_leader: self.leadership.is_leader(),
            logical_time: self.clock.peek(),
            known_peers: self.registry.len(),
            online: counts.online,
            offline: counts.offline,
            outage: counts.outage,
        })
    }

    pub fn server_stats(&self) -> ServerStats {
        ServerStats {
            server_id: self.self_id,
            uptime_secs: self.started_at.elapsed().as_secs(),
            message_count: self.message_count.load(Ordering::Relaxed),
            logical_time: self.clock.peek(),
            is_leader: self.leadership.is_leader(),
            connected_nodes: self.connected.len(),
        }
    }

    pub async fn all_nodes(&self) -> Result<Vec<MonitoredNode>, StoreError> {
        self.store.list_nodes().await
    }

    pub async fn node_details(&self, node_id: &str) -> Result<MonitoredNode, StoreError> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(node_id.to_string()))
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        self.store.list_events(None, limit).await
    }

    pub async fn node_events(&self, node_id: &str, limit: usize) -> Result<Vec<Event>, StoreError> {
        self.store.list_events(Some(node_id), limit).await
    }

    pub fn take_pending_commands(&self, node_id: &str) -> Vec<String> {
        self.pending_commands
            .remove(node_id)
            .map(|(_, commands)| commands)
            .unwrap_or_default()
    }

    // ============================================================
    // ACCESSORS
    // ============================================================

    pub fn server_id(&self) -> ServerId {
        self.self_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn role(&self) -> Role {
        self.leadership.role()
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.all_peers()
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.config.replication.reply_timeout_ms.max(1_000) * 3)
    }
}
