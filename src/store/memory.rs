use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};

use super::backend::NodeStore;
use super::types::*;

/// In-process `NodeStore` backed by two `DashMap`s.
///
/// Used by the binary when no external database is wired in, and by tests.
/// `set_available(false)` makes every call fail with `StoreError::Unavailable`,
/// which mimics a lost database connection.
pub struct MemoryStore {
    nodes: DashMap<String, MonitoredNode>,
    events: DashMap<EventId, Event>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            events: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Test and seeding hook: overwrites a row as-is.
    pub fn put_node(&self, node: MonitoredNode) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn update_node<F>(&self, node_id: &str, update: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut MonitoredNode),
    {
        self.check_available()?;

        match self.nodes.get_mut(node_id) {
            Some(mut node) => {
                update(node.value_mut());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn apply_report(
        &self,
        report: &NodeReport,
        now_ms: u64,
        logical_timestamp: i64,
    ) -> Result<ReportOutcome, StoreError> {
        self.check_available()?;

        let reported_offline = report.power_state == PowerState::Offline;

        match self.nodes.entry(report.node_id.clone()) {
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();
                let previous_power = node.power_state.clone();

                if logical_timestamp < node.logical_timestamp {
                    node.last_seen_ms = node.last_seen_ms.max(now_ms);
                    return Ok(ReportOutcome {
                        node: node.clone(),
                        previous_power: Some(previous_power),
                        stale: true,
                    });
                }

                let next_status = if reported_offline {
                    NodeStatus::Offline
                } else {
                    match node.status {
                        NodeStatus::Suspected => NodeStatus::Online,
                        status => status,
                    }
                };

                if next_status != node.status {
                    node.status = next_status;
                    node.status_changed_ms = now_ms;
                }
                node.region = report.region.clone();
                node.voltage = report.voltage;
                node.power_state = report.power_state.clone();
                node.last_seen_ms = node.last_seen_ms.max(now_ms);
                node.logical_timestamp = node.logical_timestamp.max(logical_timestamp);

                Ok(ReportOutcome {
                    node: node.clone(),
                    previous_power: Some(previous_power),
                    stale: false,
                })
            }
            Entry::Vacant(entry) => {
                let node = MonitoredNode {
                    node_id: report.node_id.clone(),
                    region: report.region.clone(),
                    voltage: report.voltage,
                    power_state: report.power_state.clone(),
                    status: if reported_offline {
                        NodeStatus::Offline
                    } else {
                        NodeStatus::Online
                    },
                    verification: VerificationStatus::None,
                    last_seen_ms: now_ms,
                    status_changed_ms: now_ms,
                    logical_timestamp,
                };
                entry.insert(node.clone());

                Ok(ReportOutcome {
                    node,
                    previous_power: None,
                    stale: false,
                })
            }
        }
    }

    async fn insert_event(&self, event: Event) -> Result<WriteOutcome, StoreError> {
        self.check_available()?;

        match self.events.entry(event.event_id.clone()) {
            Entry::Occupied(_) => Ok(WriteOutcome::Duplicate),
            Entry::Vacant(entry) => {
                entry.insert(event);
                Ok(WriteOutcome::Applied)
            }
        }
    }

    async fn transition_status(
        &self,
        node_id: &str,
        expected: NodeStatus,
        next: NodeStatus,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.check_available()?;

        match self.nodes.get_mut(node_id) {
            Some(mut node) if node.status == expected => {
                node.status = next;
                node.status_changed_ms = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.update_node(node_id, |node| {
            if node.status != status {
                node.status = status;
                node.status_changed_ms = now_ms;
            }
        })
    }

    async fn update_power_state(
        &self,
        node_id: &str,
        power_state: PowerState,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.update_node(node_id, |node| {
            node.power_state = power_state;
            node.last_seen_ms = node.last_seen_ms.max(now_ms);
        })
    }

    async fn confirm_resolved(&self, node_id: &str, now_ms: u64) -> Result<bool, StoreError> {
        self.update_node(node_id, |node| {
            if node.status != NodeStatus::Online {
                node.status = NodeStatus::Online;
                node.status_changed_ms = now_ms;
            }
            node.power_state = PowerState::Normal;
            node.verification = VerificationStatus::Confirmed;
            node.last_seen_ms = node.last_seen_ms.max(now_ms);
        })
    }

    async fn set_verification(
        &self,
        node_id: &str,
        verification: VerificationStatus,
    ) -> Result<bool, StoreError> {
        self.update_node(node_id, |node| node.verification = verification)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<MonitoredNode>, StoreError> {
        self.check_available()?;
        Ok(self.nodes.get(node_id).map(|node| node.value().clone()))
    }

    async fn list_nodes(&self) -> Result<Vec<MonitoredNode>, StoreError> {
        self.check_available()?;

        let mut nodes: Vec<MonitoredNode> = self
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn list_events(
        &self,
        node_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.check_available()?;

        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| node_id.is_none_or(|id| entry.value().node_id == id))
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by(|a, b| b.logical_timestamp.cmp(&a.logical_timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.check_available()?;

        let mut counts = StatusCounts::default();
        for entry in self.nodes.iter() {
            counts.record(entry.value().status);
        }
        Ok(counts)
    }
}
