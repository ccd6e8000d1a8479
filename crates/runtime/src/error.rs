//! Error taxonomy for the kernel runtime.
//!
//! Every error carries exactly one [`ErrorCategory`], assigned where the
//! failure is first observed (upgrade status code, socket error, wire
//! content). Downstream layers branch on the category and never
//! re-classify.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry-relevant error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Connection timeouts, socket drops, gateway errors. Retried with
    /// backoff.
    Transient,
    /// Quota, memory, or concurrency limits. Retried a few times with
    /// backoff.
    Resource,
    /// Errors raised by the submitted code. Deterministic; never retried.
    Code,
    /// Credential rejection the token provider cannot refresh away. Never
    /// retried.
    Auth,
    /// Malformed or unexpected wire data. Never retried; invalidates the
    /// channel.
    Protocol,
    /// Registry lookup found nothing.
    NotFound,
    /// Registry lookup matched more than one record.
    Ambiguous,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Resource)
    }
}

/// Classify an HTTP status observed at the connection upgrade.
///
/// A stale bearer token surfaces as 401 or 404 here, which is why the token
/// provider is consulted before every attempt rather than cached across
/// them.
pub fn classify_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 | 404 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::Transient,
        500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Protocol,
    }
}

/// Errors produced by the kernel runtime and the session layers above it.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection attempt rejected or failed; classified from the status
    /// code or socket error at the point of observation.
    #[error("connection failed: {message}")]
    Connect {
        message: String,
        status: Option<u16>,
        category: ErrorCategory,
    },

    /// Dial did not complete within the attempt budget.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The kernel answered the liveness probe with a credential rejection.
    #[error("handshake rejected: {0}")]
    AuthRejected(String),

    /// The token provider could not supply a usable token.
    #[error("token unavailable: {0}")]
    Token(String),

    /// Execution did not produce a terminal reply within its budget. The
    /// transport stays open; the remote computation may still be running.
    #[error("execution timed out after {0:?}")]
    ExecTimeout(Duration),

    /// The transport ended while an exchange was pending.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// Operation requires a connected channel.
    #[error("channel is not connected")]
    NotConnected,

    /// An execution is already in flight on this channel; callers wait or
    /// cancel, the channel never queues.
    #[error("channel busy: an execution is already in flight")]
    ChannelBusy,

    /// The submitted code raised inside the kernel.
    #[error("kernel error: {ename}: {evalue}")]
    Kernel {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },

    /// Malformed or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Account tier disallows another concurrent session.
    #[error("session limit reached: tier allows at most {limit} concurrent sessions")]
    SessionLimit { limit: usize },

    /// The remote side refused for lack of quota.
    #[error("runtime quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Registry lookup found nothing.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Registry lookup matched more than one record; never silently picks
    /// one.
    #[error("ambiguous session id '{prefix}': matches {}", matches.join(", "))]
    Ambiguous {
        prefix: String,
        matches: Vec<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The category assigned when this error was first observed.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Connect { category, .. } => *category,
            Error::ConnectTimeout(_)
            | Error::ExecTimeout(_)
            | Error::ChannelClosed
            | Error::NotConnected
            | Error::Io(_) => ErrorCategory::Transient,
            Error::ChannelBusy | Error::SessionLimit { .. } | Error::QuotaExhausted(_) => {
                ErrorCategory::Resource
            }
            Error::Kernel { .. } => ErrorCategory::Code,
            Error::AuthRejected(_) | Error::Token(_) => ErrorCategory::Auth,
            Error::Protocol(_) | Error::Json(_) => ErrorCategory::Protocol,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Ambiguous { .. } => ErrorCategory::Ambiguous,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Underlying HTTP status, when one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Connect { status, .. } => *status,
            _ => None,
        }
    }
}
