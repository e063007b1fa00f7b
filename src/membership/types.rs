use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::network::transport::Endpoint;

/// Numeric identity of an HQ server. Smaller ids win leadership ties.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Another HQ server as last announced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    pub claims_leader: bool,
}

impl Peer {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Registry entry. `pinned` peers come from static configuration or a `JOIN`
/// and are exempt from silence expiry.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer: Peer,
    pub last_seen: Instant,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Discovery beacon: `HELLO|serverId|tcpPort|isLeaderClaim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub server_id: ServerId,
    pub tcp_port: u16,
    pub claims_leader: bool,
}

impl Hello {
    pub fn parse(datagram: &str) -> Option<Hello> {
        let mut parts = datagram.trim().split('|');
        if parts.next()? != "HELLO" {
            return None;
        }

        let server_id = ServerId(parts.next()?.trim().parse().ok()?);
        let tcp_port = parts.next()?.trim().parse().ok()?;
        // Older announcers omit the claim; anything but "true" means no claim.
        let claims_leader = parts
            .next()
            .is_some_and(|claim| claim.trim().eq_ignore_ascii_case("true"));

        Some(Hello {
            server_id,
            tcp_port,
            claims_leader,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "HELLO|{}|{}|{}",
            self.server_id, self.tcp_port, self.claims_leader
        )
    }
}
