//! Wire Protocol Module
//!
//! Newline-terminated, pipe-delimited ASCII lines shared by field clients and
//! HQ peers. Every session starts with `AUTH|<token>`; the token decides whether
//! the connection is a client channel or a peer channel.
//!
//! ## Messages
//! - **Client traffic**: `REPORT`, `OUTAGE`, `CONFIRM_RESOLVED`.
//! - **Peer traffic**: `SYNC|<clock>|<inner>` wrapping a replicated line, `JOIN`
//!   for the catch-up handshake, `STATUS` for detector decisions.
//! - **Replies**: `AUTH_OK`, `OK|...`, `ERR|...`.

pub mod message;

pub use message::{Message, OutageNotice, ProtocolError, Reply};
