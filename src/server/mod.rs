//! Session Server Module
//!
//! TCP front door shared by field clients and HQ peers. Every connection must
//! open with `AUTH|<token>`: the client token grants a client channel, the peer
//! token a peer channel. Anything else gets `ERR|AUTH_FAILED` and is closed.
//!
//! ## Channels
//! - **Client**: `REPORT`, `OUTAGE`, `CONFIRM_RESOLVED`, one reply per line.
//!   Malformed lines get an `ERR` reply and the session stays open.
//! - **Peer**: everything. `SYNC` lines are applied without a reply, even when
//!   malformed.

pub mod listener;
pub mod session;
