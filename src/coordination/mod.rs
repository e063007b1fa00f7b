//! Coordination Module
//!
//! The HQ server as a whole: one `CoordinationService` ties the logical clock,
//! peer registry, leadership, replication, failure detection and the node
//! store together, and owns the session listener.
//!
//! ## Message Flow
//! - **Client origin**: applied locally, then replicated to every known peer as
//!   `SYNC|<clock>|<line>`.
//! - **Peer origin**: the clock observes the sender's stamp and the inner line is
//!   applied locally only. Nothing is re-broadcast.
//!
//! ## Membership Hooks
//! A newly discovered peer receives a full state sync. A newly pinned peer
//! additionally gets a `JOIN` so it pushes its own state back.

pub mod service;
pub mod types;

pub use service::CoordinationService;
pub use types::{ClusterStatus, Origin, ServerStats};

#[cfg(test)]
mod tests;
