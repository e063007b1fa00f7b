//! Network Delivery Module
//!
//! Outbound messaging primitives shared by replication and the join handshake.
//!
//! ## Components
//! - **`Transport`**: a single request/reply attempt. `TcpTransport` opens an
//!   authenticated line connection; `SimulatedTransport` answers in memory.
//! - **`ReliableDelivery`**: retry loop on top of a transport that waits for an
//!   `OK`/`ACK` reply.
//! - **`FaultInjector`**: drop/delay shim consulted before every attempt, used
//!   to exercise the retry paths under a degraded network.

pub mod fault;
pub mod reliable;
pub mod transport;

pub use fault::{FaultInjector, Preset};
pub use reliable::{Delivery, DeliveryPolicy, ReliableDelivery};
pub use transport::{DeliveryError, Endpoint, Link, SimulatedTransport, TcpTransport, Transport};
