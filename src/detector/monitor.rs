use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::LogicalClock;
use crate::membership::leadership::LeadershipController;
use crate::membership::types::Role;
use crate::store::backend::NodeStore;
use crate::store::types::{Event, EventId, MonitoredNode, NodeStatus, StoreError, now_ms};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Silence after which an `Online` node becomes `Suspected`.
    pub suspect_after_ms: u64,
    /// Silence after which a `Suspected` node becomes `Offline`.
    pub offline_after_ms: u64,
    /// Quiet time after the last heartbeat before a `Recovered` node is
    /// `Online` again.
    pub recovered_grace_ms: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            suspect_after_ms: 15_000,
            offline_after_ms: 30_000,
            recovered_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub node_id: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

impl Transition {
    pub fn event_type(&self) -> &'static str {
        match self.to {
            NodeStatus::Suspected => "NODE_SUSPECTED",
            NodeStatus::Offline => "NODE_OFFLINE",
            NodeStatus::Recovered => "NODE_RECOVERED",
            NodeStatus::Online => "NODE_ONLINE",
            NodeStatus::Outage => "NODE_OUTAGE",
            NodeStatus::Issue => "NODE_ISSUE",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `true` when this server was not the leader and did nothing.
    pub skipped: bool,
    pub suspected: usize,
    pub offline: usize,
    pub recovered: usize,
    pub normalized: usize,
    pub transitions: Vec<Transition>,
}

impl SweepReport {
    fn record(&mut self, transition: Transition) {
        match transition.to {
            NodeStatus::Suspected => self.suspected += 1,
            NodeStatus::Offline => self.offline += 1,
            NodeStatus::Recovered => self.recovered += 1,
            NodeStatus::Online => self.normalized += 1,
            NodeStatus::Outage | NodeStatus::Issue => {}
        }
        self.transitions.push(transition);
    }
}

/// The single next step of a node's liveness state machine, if any.
///
/// Only one step is taken per evaluation, so a node silent past both
/// thresholds still passes through `Suspected` first. `Outage` and `Issue`
/// are never touched.
pub fn next_status(node: &MonitoredNode, now_ms: u64, thresholds: &Thresholds) -> Option<NodeStatus> {
    let silence = now_ms.saturating_sub(node.last_seen_ms);

    match node.status {
        NodeStatus::Online if silence > thresholds.suspect_after_ms => Some(NodeStatus::Suspected),
        NodeStatus::Suspected if silence > thresholds.offline_after_ms => Some(NodeStatus::Offline),
        NodeStatus::Offline if silence <= thresholds.suspect_after_ms => Some(NodeStatus::Recovered),
        NodeStatus::Recovered if silence > thresholds.recovered_grace_ms => Some(NodeStatus::Online),
        _ => None,
    }
}

pub type TransitionHook = Arc<dyn Fn(&Transition) + Send + Sync>;

/// Leader-gated poller that advances every node's liveness status.
pub struct FailureDetector {
    store: Arc<dyn NodeStore>,
    leadership: Arc<LeadershipController>,
    clock: Arc<LogicalClock>,
    thresholds: Thresholds,
    interval: Duration,
}

impl FailureDetector {
    pub fn new(
        store: Arc<dyn NodeStore>,
        leadership: Arc<LeadershipController>,
        clock: Arc<LogicalClock>,
        thresholds: Thresholds,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            leadership,
            clock,
            thresholds,
            interval,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// One evaluation pass at wall-clock `now_ms`.
    ///
    /// Every transition is a conditional write against the status read at the
    /// start of the pass, so a heartbeat landing mid-sweep wins.
    pub async fn sweep_at(&self, now_ms: u64) -> Result<SweepReport, StoreError> {
        if !self.leadership.is_leader() {
            tracing::debug!("Not the leader, skipping failure detection sweep");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }

        let mut report = SweepReport::default();
        for node in self.store.list_nodes().await? {
            let Some(next) = next_status(&node, now_ms, &self.thresholds) else {
                continue;
            };

            let applied = self
                .store
                .transition_status(&node.node_id, node.status, next, now_ms)
                .await?;
            if !applied {
                tracing::trace!("{} changed under the sweep, skipping", node.node_id);
                continue;
            }

            let transition = Transition {
                node_id: node.node_id.clone(),
                from: node.status,
                to: next,
            };
            let metadata = serde_json::json!({
                "from": transition.from,
                "to": transition.to,
                "silence_ms": now_ms.saturating_sub(node.last_seen_ms),
            });
            self.store
                .insert_event(Event {
                    event_id: EventId::new(),
                    node_id: node.node_id.clone(),
                    event_type: transition.event_type().to_string(),
                    timestamp_ms: now_ms,
                    logical_timestamp: self.clock.tick(),
                    metadata: metadata.to_string(),
                })
                .await?;

            tracing::info!(
                "[Monitor] {} {} -> {}",
                transition.node_id,
                transition.from,
                transition.to
            );
            report.record(transition);
        }

        Ok(report)
    }

    /// Sweeps on a fixed interval until `shutdown` fires, and once more right
    /// away whenever this server gains leadership. Applied transitions are
    /// handed to `on_transition` (used to replicate them).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, on_transition: TransitionHook) {
        let mut interval = tokio::time::interval(self.interval);
        let mut roles = self.leadership.subscribe();
        tracing::info!("Failure detector started (sweep every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let role = *roles.borrow_and_update();
                    tracing::info!("Failure detector now running as {}", role);
                    if role != Role::Leader {
                        continue;
                    }
                }
            }

            match self.sweep_at(now_ms()).await {
                Ok(report) if report.skipped => {}
                Ok(report) => {
                    if !report.transitions.is_empty() {
                        tracing::info!(
                            "Sweep: {} suspected, {} offline, {} recovered, {} back online",
                            report.suspected,
                            report.offline,
                            report.recovered,
                            report.normalized
                        );
                    }
                    for transition in &report.transitions {
                        on_transition(transition);
                    }
                }
                Err(e) => tracing::error!("Failure detection sweep failed: {}", e),
            }
        }

        tracing::info!("Failure detector stopped");
    }
}
