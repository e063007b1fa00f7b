use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::membership::types::ServerId;

/// Where a message entered this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A field client, or an operation invoked on this server. Mutations are
    /// replicated to peers.
    Client,
    /// Another HQ server. Applied locally only.
    Peer { remote: Option<IpAddr> },
}

impl Origin {
    pub fn is_client(&self) -> bool {
        matches!(self, Origin::Client)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub server_id: ServerId,
    pub port: u16,
    pub is_leader: bool,
    pub logical_time: i64,
    pub known_peers: usize,
    pub online: usize,
    pub offline: usize,
    pub outage: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub server_id: ServerId,
    pub uptime_secs: u64,
    pub message_count: u64,
    pub logical_time: i64,
    pub is_leader: bool,
    pub connected_nodes: usize,
}
