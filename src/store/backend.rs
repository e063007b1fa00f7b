use async_trait::async_trait;

use super::types::*;

/// Narrow interface to the persistent node/event store.
///
/// The relational store behind this trait is an external collaborator; the
/// coordination core only upserts node rows, applies conditional status
/// transitions and inserts events keyed by `EventId`. Every write is
/// idempotent so replicated or retried messages converge.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Upsert-on-report. Creates the node on first contact and refreshes
    /// `last_seen_ms`. A heartbeat moves `Suspected` back to `Online` but never
    /// clears `Offline`, `Recovered`, `Outage` or `Issue`.
    ///
    /// A report stamped older than the row's `logical_timestamp` only
    /// refreshes `last_seen_ms`; the newer field values stay.
    async fn apply_report(
        &self,
        report: &NodeReport,
        now_ms: u64,
        logical_timestamp: i64,
    ) -> Result<ReportOutcome, StoreError>;

    /// Inserts an event; an already known `event_id` yields `Duplicate`.
    async fn insert_event(&self, event: Event) -> Result<WriteOutcome, StoreError>;

    /// Sets `next` only if the node is currently in `expected`.
    /// Returns whether the row changed.
    async fn transition_status(
        &self,
        node_id: &str,
        expected: NodeStatus,
        next: NodeStatus,
        now_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Unconditional status write, used when adopting a replica's status.
    async fn set_status(&self, node_id: &str, status: NodeStatus, now_ms: u64)
    -> Result<bool, StoreError>;

    async fn update_power_state(
        &self,
        node_id: &str,
        power_state: PowerState,
        now_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Marks the node `Online`/`Normal` with a confirmed verification.
    async fn confirm_resolved(&self, node_id: &str, now_ms: u64) -> Result<bool, StoreError>;

    async fn set_verification(
        &self,
        node_id: &str,
        verification: VerificationStatus,
    ) -> Result<bool, StoreError>;

    async fn get_node(&self, node_id: &str) -> Result<Option<MonitoredNode>, StoreError>;

    /// All node rows ordered by id.
    async fn list_nodes(&self) -> Result<Vec<MonitoredNode>, StoreError>;

    /// Most recent events first (by logical timestamp), optionally for one node.
    async fn list_events(
        &self,
        node_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}
