//! Kernel runtime - channel lifecycle, transport, and retry policy
//!
//! This crate provides the protocol engine for talking to remote notebook
//! kernels over WebSocket:
//!
//! - **Transport**: WebSocket client behind a `Transport`/`Dialer` seam
//! - **Channel**: the connect/authenticate/execute state machine with
//!   correlation-id message framing
//! - **Retry**: exponential backoff keyed to the error taxonomy
//! - **Tokens**: the `TokenProvider` seam plus single-flight refresh
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   cgpu-rs    │  Session registry + manager
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐
//! │ cgpu-runtime │  This crate
//! │ ┌──────────┐ │
//! │ │ Channel  │ │  Execute exchange, correlation ids
//! │ └──────────┘ │
//! │ ┌──────────┐ │
//! │ │ Transport│ │  WebSocket dial + frame pump
//! │ └──────────┘ │
//! │ ┌──────────┐ │
//! │ │Retry/Tok │ │  Backoff policy, bearer tokens
//! │ └──────────┘ │
//! └──────────────┘
//! ```
//!
//! Channels are deliberately ignorant of the session store; the orchestration
//! layer in `cgpu-rs` owns that mapping.

pub mod channel;
pub mod error;
pub mod retry;
pub mod token;
pub mod transport;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

// Re-export key types at crate root
pub use channel::{ChannelConfig, ChannelState, KernelChannel, MAX_STREAM_BYTES};
pub use error::{Error, ErrorCategory, Result, classify_status};
pub use retry::{RetryDecision, RetryPolicy};
pub use token::{AccessToken, TokenProvider, TokenSource};
pub use transport::{Dialer, Transport, TransportParts, TransportReceiver, WsDialer};
