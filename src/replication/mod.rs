//! Replication Module
//!
//! Keeps the HQ replicas' stores converging without a consensus protocol.
//!
//! ## Mechanisms
//! - **Broadcast**: every client mutation is forwarded to all known peers as
//!   `SYNC|<clock>|<line>`, fire-and-forget with a bounded retry.
//! - **Full-state sync**: a newly known peer receives every stored node as a
//!   `REPORT` plus `STATUS` pair.
//! - **Join handshake**: after pushing its state, a server sends `JOIN` so the
//!   peer pushes its own state back.
//!
//! Correctness relies on idempotent store writes; duplicated or reordered
//! `SYNC` lines converge to the same rows.

pub mod broadcaster;

pub use broadcaster::{ReplicationBroadcaster, ReplicationSettings};

#[cfg(test)]
mod tests;
