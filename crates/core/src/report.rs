//! Structured operation reports.
//!
//! Every public operation resolves to a discriminated success-or-error
//! value; nothing unwinds across the component boundary. [`OpReport`] is
//! the serializable envelope the external formatter renders for humans or
//! machines.
//!
//! ```json
//! { "ok": true,  "op": "runOn", "data": { ... }, "durationMs": 1234 }
//! { "ok": false, "op": "runOn",
//!   "error": { "category": "transient", "message": "...", "retryable": true } }
//! ```

use cgpu_runtime::{Error, ErrorCategory, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error half of a report: the classified category, a human message, the
/// underlying status code when one was observed, and the derived
/// retry-eligibility flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpError {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub retryable: bool,
}

impl OpError {
    pub fn from_error(err: &Error) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
            status: err.status(),
            retryable: err.is_retryable(),
        }
    }
}

/// The envelope returned by every outward-facing operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpReport<T> {
    pub ok: bool,
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OpError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl<T> OpReport<T> {
    pub fn from_result(op: &str, result: Result<T>) -> Self {
        match result {
            Ok(data) => Self {
                ok: true,
                op: op.to_string(),
                data: Some(data),
                error: None,
                duration_ms: None,
            },
            Err(err) => Self {
                ok: false,
                op: op.to_string(),
                data: None,
                error: Some(OpError::from_error(&err)),
                duration_ms: None,
            },
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}
