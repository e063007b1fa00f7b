//! HQ Power-Grid Coordination Library
//!
//! This library crate defines the coordination core shared by every regional HQ
//! server. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`clock`**: Lamport logical clock stamping every state change.
//! - **`config`**: JSON configuration with per-section defaults and validation.
//! - **`coordination`**: The `CoordinationService` tying all subsystems together.
//! - **`detector`**: Leader-only graduated failure detection of field nodes.
//! - **`membership`**: Multicast discovery, the peer registry and leadership.
//! - **`network`**: Peer links, fault injection and retrying delivery.
//! - **`protocol`**: The pipe-delimited line protocol.
//! - **`replication`**: Fire-and-forget peer broadcast and full state sync.
//! - **`server`**: The authenticated TCP session listener.
//! - **`store`**: Persistence abstraction for node rows and events.

pub mod clock;
pub mod config;
pub mod coordination;
pub mod detector;
pub mod membership;
pub mod network;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod store;
