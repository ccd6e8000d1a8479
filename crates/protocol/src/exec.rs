//! Execution requests and results as seen by callers of the session
//! manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default execution timeout, matching the CLI default of the original
/// tooling.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;

/// A code payload to run against a session, with optional setup/cleanup
/// stages. Setup runs first and aborts the run on failure; cleanup runs
/// after the main stage best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<String>,
    /// Wall-clock budget for each stage, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            setup: None,
            cleanup: None,
            timeout_ms: None,
        }
    }

    pub fn with_setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    pub fn with_cleanup(mut self, cleanup: impl Into<String>) -> Self {
        self.cleanup = Some(cleanup.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Effective per-stage timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS))
    }
}

/// Terminal outcome of one execute exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecOutcome {
    /// The kernel ran the code to completion.
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// The kernel reported an error raised by the submitted code.
    Error {
        ename: String,
        evalue: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        traceback: Vec<String>,
    },
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success { .. })
    }
}

/// Collected result of one execute exchange. Output streams are capped by
/// the channel; a capped stream ends with a single truncation notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub outcome: ExecOutcome,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_applies() {
        let request = ExecutionRequest::new("print(1)");
        assert_eq!(
            request.timeout(),
            Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS)
        );
    }

    #[test]
    fn explicit_timeout_wins() {
        let request = ExecutionRequest::new("x").with_timeout(Duration::from_secs(5));
        assert_eq!(request.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let result = ExecutionResult {
            outcome: ExecOutcome::Error {
                ename: "ZeroDivisionError".into(),
                evalue: "division by zero".into(),
                traceback: vec!["Traceback...".into()],
            },
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 12,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["ename"], "ZeroDivisionError");

        let success = ExecOutcome::Success {
            value: Some("4".into()),
        };
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["value"], "4");
    }
}
