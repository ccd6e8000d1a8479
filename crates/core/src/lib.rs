//! cgpu - drive remote accelerated notebook kernels from local code.
//!
//! The crate manages the full session lifecycle against remote runtimes:
//! authenticate, open and multiplex WebSocket execution channels, submit
//! code, stream results back, and keep a persisted registry of sessions
//! with staleness detection, active-session selection, and tier limits.
//!
//! The remote side is assumed unreliable - gateway errors, slow cold
//! starts, dropped sockets - so every operation resolves to a classified
//! success-or-error value and connection-time failures retry with
//! exponential backoff.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cgpu::{SessionManager, SessionRegistry};
//! use cgpu::protocol::{AcceleratorVariant, ExecutionRequest, Tier};
//! use cgpu::runtime::WsDialer;
//! # async fn demo(tokens: Arc<dyn cgpu::runtime::TokenProvider>,
//! #               provisioner: Arc<dyn cgpu::RuntimeProvisioner>) -> cgpu::runtime::Result<()> {
//! let registry = Arc::new(SessionRegistry::open(SessionRegistry::default_path(), Tier::Pro));
//! let manager = SessionManager::new("acct", registry, tokens, provisioner, Arc::new(WsDialer));
//!
//! let session = manager.create_session("experiment", AcceleratorVariant::Gpu).await?;
//! let result = manager
//!     .run_on(&session.session.id, &ExecutionRequest::new("print('hello')"))
//!     .await?;
//! println!("{}", result.stdout);
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod registry;
pub mod report;
pub mod status;
pub mod warn;

/// Wire types and the shared data model.
pub use cgpu_protocol as protocol;
/// The channel, transport, retry, and token layer.
pub use cgpu_runtime as runtime;

pub use manager::{RuntimeProvisioner, SessionManager};
pub use registry::{PREFIX_MIN_CHARS, SessionRegistry};
pub use report::{OpError, OpReport};
pub use status::{STALE_GRACE_SECS, compute_status, is_stale};
pub use warn::WarningCache;
