//! Wire types for the kernel runtime protocol.
//!
//! This crate contains the serde-serializable types exchanged with a remote
//! notebook kernel over its WebSocket channel, plus the shared data model for
//! locally tracked sessions. These types represent the "protocol layer" - the
//! shapes of data as they appear on the wire and in the session store.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization and
//!   small constructors
//! - **1:1 with the wire**: Match the kernel message envelope exactly
//! - **Stable**: Changes only when the wire protocol or store schema changes
//!
//! The protocol engine lives in `cgpu-runtime`; orchestration in `cgpu-rs`.

pub mod exec;
pub mod messages;
pub mod session;

pub use exec::*;
pub use messages::*;
pub use session::*;
