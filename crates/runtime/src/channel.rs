//! Kernel channel: one WebSocket connection to one remote runtime.
//!
//! The channel is a small state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Idle <-> Busy
//!       ^              |               |            |
//!       +--------------+---------------+------------+  (failure / close)
//! ```
//!
//! Connection-time failures re-enter through [`RetryPolicy`]; execution
//! follows a strict one-in-flight discipline correlated by message id.
//!
//! # Message Flow
//!
//! 1. `execute()` transitions `Idle -> Busy` and sends an `execute_request`
//!    carrying a fresh correlation id
//! 2. `stream` / `execute_result` / `status` frames bearing that id are
//!    accumulated
//! 3. A terminal `execute_reply` with the id completes the exchange
//! 4. Frames bearing any other id belong to a prior, abandoned exchange and
//!    are ignored, because the transport may deliver late-arriving frames

use crate::error::{Error, ErrorCategory, Result};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::token::TokenSource;
use crate::transport::{Dialer, TransportParts};
use cgpu_protocol::{
    ExecOutcome, ExecutionResult, ExecutionState, KernelState, MsgType, ReplyStatus, StreamName,
    WireMessage,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Byte ceiling for each captured output stream.
pub const MAX_STREAM_BYTES: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Connection-level state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Idle,
    Busy,
}

/// Timeouts governing a channel's suspension points.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Dial budget for the first connection; generous because the remote
    /// runtime may be cold-starting.
    pub initial_connect_timeout: Duration,
    /// Dial budget for reconnections; the runtime is presumed warm.
    pub reconnect_timeout: Duration,
    /// Budget for the liveness probe after the transport opens.
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_connect_timeout: Duration::from_secs(120),
            reconnect_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns one transport to one runtime's kernel and runs the execute
/// protocol over it.
pub struct KernelChannel {
    endpoint: String,
    account: String,
    tokens: Arc<TokenSource>,
    dialer: Arc<dyn Dialer>,
    policy: RetryPolicy,
    config: ChannelConfig,
    state: Arc<Mutex<ChannelState>>,
    kernel_state: Mutex<KernelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    inbound: TokioMutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ever_connected: AtomicBool,
}

impl KernelChannel {
    pub fn new(
        endpoint: impl Into<String>,
        account: impl Into<String>,
        tokens: Arc<TokenSource>,
        dialer: Arc<dyn Dialer>,
        policy: RetryPolicy,
        config: ChannelConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            account: account.into(),
            tokens,
            dialer,
            policy,
            config,
            state: Arc::new(Mutex::new(ChannelState::Disconnected)),
            kernel_state: Mutex::new(KernelState::Unknown),
            outbound: Mutex::new(None),
            inbound: TokioMutex::new(None),
            tasks: Mutex::new(Vec::new()),
            ever_connected: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Last kernel-reported execution state, mirrored from `status` frames.
    pub fn kernel_state(&self) -> KernelState {
        *self.kernel_state.lock()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ChannelState::Idle | ChannelState::Busy)
    }

    /// Open the transport and confirm the kernel is usable, retrying
    /// connection-time failures per the retry policy. Idempotent on an
    /// already-connected channel.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ChannelState::Idle | ChannelState::Busy => return Ok(()),
            ChannelState::Connecting | ChannelState::Authenticating => {
                return Err(Error::ChannelBusy);
            }
            ChannelState::Disconnected => {}
        }

        let mut attempt: u32 = 1;
        loop {
            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    *self.state.lock() = ChannelState::Disconnected;
                    match self.policy.decide(err.category(), attempt) {
                        RetryDecision::Retry(delay) => {
                            tracing::warn!(
                                target: "cgpu.channel",
                                endpoint = %self.endpoint,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "connection attempt failed; backing off"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            *self.kernel_state.lock() = match err.category() {
                                ErrorCategory::Protocol => KernelState::InitFailed,
                                _ => KernelState::Disconnected,
                            };
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<()> {
        *self.state.lock() = ChannelState::Connecting;
        self.teardown_transport();

        // Tokens expire; fetch one for this attempt, never reuse across
        // attempts. A stale bearer header is indistinguishable from a
        // genuine endpoint failure at the transport layer.
        let token = self.tokens.token(&self.account).await?;

        let dial_timeout = if self.ever_connected.load(Ordering::Relaxed) {
            self.config.reconnect_timeout
        } else {
            self.config.initial_connect_timeout
        };

        let TransportParts {
            mut sender,
            mut receiver,
            inbound,
        } = self.dialer.dial(&self.endpoint, &token, dial_timeout).await?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = sender.send(message).await {
                    tracing::debug!(target: "cgpu.channel", error = %err, "transport write failed");
                    break;
                }
            }
            let _ = sender.close().await;
        });
        let reader = tokio::spawn(async move {
            if let Err(err) = receiver.run().await {
                tracing::debug!(target: "cgpu.channel", error = %err, "transport read ended");
            }
        });

        *self.outbound.lock() = Some(outbound_tx);
        *self.inbound.lock().await = Some(inbound);
        self.tasks.lock().extend([writer, reader]);

        *self.state.lock() = ChannelState::Authenticating;
        match self.handshake().await {
            Ok(()) => {
                self.ever_connected.store(true, Ordering::Relaxed);
                *self.state.lock() = ChannelState::Idle;
                *self.kernel_state.lock() = KernelState::Idle;
                tracing::info!(target: "cgpu.channel", endpoint = %self.endpoint, "kernel channel ready");
                Ok(())
            }
            Err(err) => {
                self.teardown_transport();
                Err(err)
            }
        }
    }

    /// Liveness probe: the kernel must answer a `kernel_info_request`
    /// before the channel is usable. A credential rejection classifies
    /// auth; every other failure here classifies protocol.
    async fn handshake(&self) -> Result<()> {
        let probe_id = uuid::Uuid::new_v4().to_string();
        self.send(WireMessage::kernel_info_request(&probe_id))?;

        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(Error::NotConnected)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Protocol(
                    "kernel did not answer the liveness probe".into(),
                ));
            }

            let raw = match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => {
                    return Err(Error::Protocol(
                        "kernel did not answer the liveness probe".into(),
                    ));
                }
                Ok(None) => {
                    return Err(Error::Protocol("connection closed during handshake".into()));
                }
                Ok(Some(raw)) => raw,
            };

            let message = parse_frame(&raw)?;
            if message.parent_id() != Some(probe_id.as_str()) {
                tracing::debug!(
                    target: "cgpu.channel",
                    msg_type = ?message.header.msg_type,
                    "ignoring frame from another exchange"
                );
                continue;
            }

            return match message.header.msg_type {
                MsgType::KernelInfoReply => {
                    if let Some(rejection) = credential_rejection(&message.content) {
                        Err(Error::AuthRejected(rejection))
                    } else {
                        Ok(())
                    }
                }
                other => Err(Error::Protocol(format!(
                    "unexpected {other:?} reply to liveness probe"
                ))),
            };
        }
    }

    /// Run one execute exchange. Rejects overlap: a second call while an
    /// exchange is in flight fails with [`Error::ChannelBusy`] instead of
    /// queuing.
    ///
    /// On timeout the exchange is abandoned but the transport stays open;
    /// the remote computation may still be running and a later execute on
    /// this channel must not be blocked by a timed-out one.
    pub async fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionResult> {
        {
            let mut state = self.state.lock();
            match *state {
                ChannelState::Idle => *state = ChannelState::Busy,
                ChannelState::Busy => return Err(Error::ChannelBusy),
                _ => return Err(Error::NotConnected),
            }
        }
        let _busy = BusyGuard {
            state: Arc::clone(&self.state),
        };

        let started = Instant::now();
        let msg_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(target: "cgpu.channel", %msg_id, "sending execute_request");
        if let Err(err) = self.send(WireMessage::execute_request(&msg_id, code)) {
            // A send can only fail because the transport is gone.
            self.mark_disconnected();
            return Err(err);
        }

        let mut exchange = Exchange {
            stdout: OutputBuffer::new(MAX_STREAM_BYTES),
            stderr: OutputBuffer::new(MAX_STREAM_BYTES),
            value: None,
        };
        let deadline = started + timeout;

        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(Error::NotConnected)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ExecTimeout(timeout));
            }

            let raw = match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => return Err(Error::ExecTimeout(timeout)),
                Ok(None) => {
                    drop(inbound);
                    self.mark_disconnected();
                    return Err(Error::ChannelClosed);
                }
                Ok(Some(raw)) => raw,
            };

            match self.step(&raw, &msg_id, &mut exchange) {
                Ok(None) => {}
                Ok(Some(outcome)) => {
                    return Ok(ExecutionResult {
                        outcome,
                        stdout: exchange.stdout.into_string(),
                        stderr: exchange.stderr.into_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(err) => {
                    // A malformed frame invalidates trust in the channel's
                    // state.
                    drop(inbound);
                    if err.category() == ErrorCategory::Protocol {
                        self.mark_disconnected();
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Process one inbound frame of an execute exchange. Returns the
    /// terminal outcome once the matching `execute_reply` arrives.
    fn step(
        &self,
        raw: &str,
        msg_id: &str,
        exchange: &mut Exchange,
    ) -> Result<Option<ExecOutcome>> {
        let message = parse_frame(raw)?;

        if message.parent_id() != Some(msg_id) {
            tracing::debug!(
                target: "cgpu.channel",
                msg_type = ?message.header.msg_type,
                "ignoring frame from another exchange"
            );
            return Ok(None);
        }

        match message.header.msg_type {
            MsgType::Stream => {
                let content: cgpu_protocol::StreamContent = typed_content(&message)?;
                match content.name {
                    StreamName::Stdout => exchange.stdout.push(&content.text),
                    StreamName::Stderr => exchange.stderr.push(&content.text),
                }
                Ok(None)
            }
            MsgType::ExecuteResult => {
                let content: cgpu_protocol::ExecuteResultContent = typed_content(&message)?;
                exchange.value = content.text_plain();
                Ok(None)
            }
            MsgType::Status => {
                let content: cgpu_protocol::StatusContent = typed_content(&message)?;
                *self.kernel_state.lock() = kernel_state_from(content.execution_state);
                Ok(None)
            }
            MsgType::ExecuteReply => {
                let content: cgpu_protocol::ExecuteReplyContent = typed_content(&message)?;
                let outcome = match content.status {
                    ReplyStatus::Ok => ExecOutcome::Success {
                        value: exchange.value.take(),
                    },
                    ReplyStatus::Error => ExecOutcome::Error {
                        ename: content.ename.unwrap_or_else(|| "Error".into()),
                        evalue: content.evalue.unwrap_or_default(),
                        traceback: content.traceback,
                    },
                };
                Ok(Some(outcome))
            }
            other => {
                tracing::debug!(
                    target: "cgpu.channel",
                    msg_type = ?other,
                    "ignoring unexpected frame type in exchange"
                );
                Ok(None)
            }
        }
    }

    /// Tear down the transport. Best-effort: close errors are logged by
    /// the writer task, never surfaced.
    pub fn close(&self) {
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        self.teardown_transport();
        *self.state.lock() = ChannelState::Disconnected;
        let mut kernel_state = self.kernel_state.lock();
        if !matches!(*kernel_state, KernelState::Dead | KernelState::InitFailed) {
            *kernel_state = KernelState::Disconnected;
        }
    }

    fn teardown_transport(&self) {
        // Dropping the outbound sender ends the writer task, which closes
        // the sink on its way out.
        *self.outbound.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn send(&self, message: WireMessage) -> Result<()> {
        let value = serde_json::to_value(&message)?;
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::NotConnected);
        };
        tx.send(value).map_err(|_| Error::ChannelClosed)
    }
}

impl Drop for KernelChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

struct Exchange {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    value: Option<String>,
}

/// Restores `Idle` when an execute exchange ends, including cancellation
/// and timeout paths. A disconnect wins: the reset only applies while the
/// channel is still `Busy`.
struct BusyGuard {
    state: Arc<Mutex<ChannelState>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Busy {
            *state = ChannelState::Idle;
        }
    }
}

/// Accumulates one output stream up to a byte ceiling. Bytes past the
/// ceiling are discarded; a single truncation notice is appended exactly
/// once.
struct OutputBuffer {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let remaining = self.limit - self.buf.len();
        if text.len() <= remaining {
            self.buf.push_str(text);
            return;
        }
        let mut keep = remaining;
        while !text.is_char_boundary(keep) {
            keep -= 1;
        }
        self.buf.push_str(&text[..keep]);
        self.buf.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }

    fn into_string(self) -> String {
        self.buf
    }
}

fn parse_frame(raw: &str) -> Result<WireMessage> {
    serde_json::from_str(raw).map_err(|err| Error::Protocol(format!("malformed frame: {err}")))
}

fn typed_content<T: DeserializeOwned>(message: &WireMessage) -> Result<T> {
    message.typed_content().map_err(|err| {
        Error::Protocol(format!(
            "malformed {:?} content: {err}",
            message.header.msg_type
        ))
    })
}

fn kernel_state_from(state: ExecutionState) -> KernelState {
    match state {
        ExecutionState::Starting => KernelState::Starting,
        ExecutionState::Idle => KernelState::Idle,
        ExecutionState::Busy => KernelState::Busy,
        ExecutionState::Dead => KernelState::Dead,
    }
}

/// Does a liveness-probe reply indicate a credential rejection?
fn credential_rejection(content: &Value) -> Option<String> {
    let status = content.get("status").and_then(|v| v.as_str())?;
    if status != "error" {
        return None;
    }
    let detail = ["ename", "evalue", "reason"]
        .iter()
        .filter_map(|key| content.get(*key).and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join(": ");
    let lowered = detail.to_lowercase();
    ["auth", "credential", "permission", "token", "forbidden"]
        .iter()
        .any(|needle| lowered.contains(needle))
        .then_some(detail)
}
