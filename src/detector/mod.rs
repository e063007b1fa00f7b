//! Failure Detection Module
//!
//! Graduated liveness tracking of field nodes, run only by the current leader.
//!
//! ## State Machine
//! `ONLINE -> SUSPECTED -> OFFLINE -> RECOVERED -> ONLINE`
//! - Silence drives a node toward `OFFLINE`, one step per sweep.
//! - A fresh heartbeat lets an `OFFLINE` node come back as `RECOVERED`, which
//!   settles to `ONLINE` once it has been quiet for a grace period.

pub mod monitor;

pub use monitor::{FailureDetector, SweepReport, Thresholds, Transition, next_status};
