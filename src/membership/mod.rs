//! Membership & Discovery Module
//!
//! Tracks which HQ servers exist and which one currently leads.
//!
//! ## Core Mechanisms
//! - **Beacons**: every server multicasts `HELLO|id|tcpPort|isLeaderClaim` on a fixed cadence
//!   and records the beacons it hears in the `PeerRegistry`.
//! - **Expiry**: discovered peers silent for longer than the expiry window are dropped. Peers
//!   pinned by configuration or a `JOIN` never expire.
//! - **Leadership**: a soft single-leader rule over live peers. The smallest claiming id wins a
//!   contest; a server with no live claimant around takes the role itself.

pub mod discovery;
pub mod leadership;
pub mod registry;
pub mod types;

pub use discovery::DiscoveryService;
pub use leadership::LeadershipController;
pub use registry::PeerRegistry;
pub use types::{Hello, Peer, PeerRecord, Role, ServerId};
