//! Logical Time Module
//!
//! Provides the Lamport clock used to order events across HQ replicas without
//! relying on synchronized wall clocks.
//!
//! ## Rules
//! - **Local event**: increment before stamping (`tick`).
//! - **Receive**: merge with `max(local, received) + 1` (`observe`).
//! - **Read**: `peek` never mutates.

pub mod lamport;

pub use lamport::LogicalClock;
