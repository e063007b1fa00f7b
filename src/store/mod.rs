//! Node & Event Store Module
//!
//! The persistent store is owned by an external relational database. This
//! module defines the narrow seam the coordination core writes through and an
//! in-memory implementation of it.
//!
//! ## Write Semantics
//! - **Node table**: upsert-on-report keyed by node id, plus conditional status
//!   transitions (`expected -> next`) used by the failure detector.
//! - **Event table**: insert keyed by a globally unique `EventId`. Re-inserting
//!   a known id returns `WriteOutcome::Duplicate` instead of failing.
//! - **No locking**: consistency across replicas relies on idempotent,
//!   order-insensitive writes.

pub mod backend;
pub mod memory;
pub mod types;

pub use backend::NodeStore;
pub use memory::MemoryStore;
