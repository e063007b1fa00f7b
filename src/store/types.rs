use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Power condition reported by a field node.
///
/// Unknown strings are preserved verbatim so a newer field client never gets
/// its report rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PowerState {
    Normal,
    Low,
    Outage,
    Off,
    Offline,
    Other(String),
}

impl PowerState {
    pub fn is_outage(&self) -> bool {
        matches!(self, PowerState::Outage | PowerState::Off)
    }
}

impl FromStr for PowerState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s.trim().to_uppercase().as_str() {
            "NORMAL" => PowerState::Normal,
            "LOW" => PowerState::Low,
            "OUTAGE" => PowerState::Outage,
            "OFF" => PowerState::Off,
            "OFFLINE" => PowerState::Offline,
            _ => PowerState::Other(s.trim().to_string()),
        };
        Ok(state)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Normal => write!(f, "NORMAL"),
            PowerState::Low => write!(f, "LOW"),
            PowerState::Outage => write!(f, "OUTAGE"),
            PowerState::Off => write!(f, "OFF"),
            PowerState::Offline => write!(f, "OFFLINE"),
            PowerState::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Liveness status of a monitored node.
///
/// The failure detector only drives `Online`, `Suspected`, `Offline` and
/// `Recovered`. `Outage` and `Issue` are held until an operator or the field
/// node confirms the fault is resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Suspected,
    Offline,
    Recovered,
    Outage,
    Issue,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown node status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for NodeStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ONLINE" => Ok(NodeStatus::Online),
            "SUSPECTED" => Ok(NodeStatus::Suspected),
            "OFFLINE" => Ok(NodeStatus::Offline),
            "RECOVERED" => Ok(NodeStatus::Recovered),
            "OUTAGE" => Ok(NodeStatus::Outage),
            "ISSUE" => Ok(NodeStatus::Issue),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Online => "ONLINE",
            NodeStatus::Suspected => "SUSPECTED",
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Recovered => "RECOVERED",
            NodeStatus::Outage => "OUTAGE",
            NodeStatus::Issue => "ISSUE",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    #[default]
    None,
    Pending,
    Confirmed,
}

/// A heartbeat from a field node, as carried by `REPORT`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeReport {
    pub node_id: String,
    pub voltage: f64,
    pub power_state: PowerState,
    pub region: String,
}

/// One row of the node table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoredNode {
    pub node_id: String,
    pub region: String,
    pub voltage: f64,
    pub power_state: PowerState,
    pub status: NodeStatus,
    pub verification: VerificationStatus,
    /// Wall-clock time (ms) of the last heartbeat.
    pub last_seen_ms: u64,
    /// Wall-clock time (ms) at which `status` last changed.
    pub status_changed_ms: u64,
    pub logical_timestamp: i64,
}

impl MonitoredNode {
    /// Rebuilds the `REPORT` that would reproduce this row on a replica.
    pub fn as_report(&self) -> NodeReport {
        NodeReport {
            node_id: self.node_id.clone(),
            voltage: self.voltage,
            power_state: self.power_state.clone(),
            region: self.region.clone(),
        }
    }
}

/// Globally unique event identifier; the dedup key of the event table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub node_id: String,
    pub event_type: String,
    pub timestamp_ms: u64,
    pub logical_timestamp: i64,
    pub metadata: String,
}

/// Result of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Duplicate,
}

/// What an upsert-on-report changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub node: MonitoredNode,
    /// Power state before this report, `None` if the node was new.
    pub previous_power: Option<PowerState>,
    /// The report carried an older logical timestamp than the row, so only
    /// `last_seen_ms` was refreshed.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub online: usize,
    pub suspected: usize,
    pub offline: usize,
    pub recovered: usize,
    pub outage: usize,
    pub issue: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: NodeStatus) {
        match status {
            NodeStatus::Online => self.online += 1,
            NodeStatus::Suspected => self.suspected += 1,
            NodeStatus::Offline => self.offline += 1,
            NodeStatus::Recovered => self.recovered += 1,
            NodeStatus::Outage => self.outage += 1,
            NodeStatus::Issue => self.issue += 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("node not found: {0}")]
    NotFound(String),
}

/// Event type implied by a power-state change, if any.
pub fn power_transition_event(previous: Option<&PowerState>, next: &PowerState) -> Option<&'static str> {
    let previous = previous.cloned().unwrap_or(PowerState::Other("UNKNOWN".to_string()));
    if previous == *next {
        return None;
    }

    if next.is_outage() {
        return Some("OUTAGE_START");
    }
    match next {
        PowerState::Normal if previous.is_outage() => Some("OUTAGE_END"),
        PowerState::Normal => Some("POWER_RESTORED"),
        PowerState::Low => Some("POWER_QUALITY_ISSUE"),
        _ => Some("STATE_CHANGE"),
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
