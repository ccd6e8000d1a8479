//! In-memory transport fakes for driving channels without a network.
//!
//! [`FakeKernel`] implements [`Dialer`] and plays the remote side of the
//! protocol: it answers the liveness probe and routes `execute_request`
//! frames through a scripted handler. Failure modes (flaky dials, upgrade
//! rejections, a kernel that never answers) are opt-in builders.

use crate::error::{Error, ErrorCategory, Result, classify_status};
use crate::token::AccessToken;
use crate::transport::{Dialer, Transport, TransportParts, TransportReceiver};
use async_trait::async_trait;
use cgpu_protocol::{ExecuteRequestContent, MsgType, StreamName, WireMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Scripted response to one `execute_request`: `(sequence, code, parent
/// correlation id) -> frames to deliver`.
pub type ExecuteHandler = dyn Fn(u64, &str, &str) -> Vec<WireMessage> + Send + Sync;

/// An in-memory kernel endpoint.
pub struct FakeKernel {
    dials: AtomicU32,
    fail_first: u32,
    reject_status: Option<u16>,
    respond_handshake: bool,
    handler: Arc<ExecuteHandler>,
    seq: Arc<AtomicU64>,
    connections: Mutex<Vec<ConnectionHandle>>,
}

struct ConnectionHandle {
    inject: mpsc::UnboundedSender<String>,
    responder: JoinHandle<()>,
}

impl FakeKernel {
    /// A kernel that echoes submitted code on stdout and returns `"ok"`.
    pub fn echo() -> Self {
        Self::with_handler(|_seq, code, parent| {
            vec![
                WireMessage::stream(parent, StreamName::Stdout, code),
                WireMessage::execute_result(parent, "ok"),
                WireMessage::execute_reply_ok(parent),
            ]
        })
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(u64, &str, &str) -> Vec<WireMessage> + Send + Sync + 'static,
    {
        Self {
            dials: AtomicU32::new(0),
            fail_first: 0,
            reject_status: None,
            respond_handshake: true,
            handler: Arc::new(handler),
            seq: Arc::new(AtomicU64::new(0)),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` dials with a transient gateway error.
    pub fn fail_first_dials(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Reject every dial at the upgrade with this HTTP status.
    pub fn reject_dials_with(mut self, status: u16) -> Self {
        self.reject_status = Some(status);
        self
    }

    /// Never answer the liveness probe.
    pub fn mute_handshake(mut self) -> Self {
        self.respond_handshake = false;
        self
    }

    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Deliver a raw frame on the most recent connection, bypassing the
    /// responder.
    pub fn inject_raw(&self, raw: &str) {
        if let Some(connection) = self.connections.lock().last() {
            let _ = connection.inject.send(raw.to_string());
        }
    }

    /// Drop every live connection, as a server-initiated close would.
    pub fn close_connection(&self) {
        for connection in self.connections.lock().drain(..) {
            connection.responder.abort();
            drop(connection.inject);
        }
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        for connection in self.connections.lock().drain(..) {
            connection.responder.abort();
        }
    }
}

#[async_trait]
impl Dialer for FakeKernel {
    async fn dial(
        &self,
        _endpoint: &str,
        _token: &AccessToken,
        _timeout: Duration,
    ) -> Result<TransportParts> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = self.reject_status {
            return Err(Error::Connect {
                message: format!("server rejected connection upgrade ({status})"),
                status: Some(status),
                category: classify_status(status),
            });
        }
        if dial < self.fail_first {
            return Err(Error::Connect {
                message: "bad gateway".into(),
                status: Some(502),
                category: ErrorCategory::Transient,
            });
        }

        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<Value>();

        let handler = Arc::clone(&self.handler);
        let seq = Arc::clone(&self.seq);
        let respond_handshake = self.respond_handshake;
        let responder_tx = inbound_tx.clone();
        let responder = tokio::spawn(async move {
            while let Some(value) = sent_rx.recv().await {
                let Ok(message) = serde_json::from_value::<WireMessage>(value) else {
                    continue;
                };
                let msg_id = message.header.msg_id.clone();
                let replies = match message.header.msg_type {
                    MsgType::KernelInfoRequest if respond_handshake => {
                        vec![WireMessage::kernel_info_reply(&msg_id)]
                    }
                    MsgType::ExecuteRequest => {
                        let sequence = seq.fetch_add(1, Ordering::SeqCst) + 1;
                        let code = message
                            .typed_content::<ExecuteRequestContent>()
                            .map(|content| content.code)
                            .unwrap_or_default();
                        handler(sequence, &code, &msg_id)
                    }
                    _ => vec![],
                };
                for reply in replies {
                    let Ok(text) = serde_json::to_string(&reply) else {
                        continue;
                    };
                    if responder_tx.send(text).is_err() {
                        return;
                    }
                }
            }
        });

        self.connections.lock().push(ConnectionHandle {
            inject: inbound_tx,
            responder,
        });

        Ok(TransportParts {
            sender: Box::new(MockTransport { sent: sent_tx }),
            receiver: Box::new(MockReceiver),
            inbound,
        })
    }
}

struct MockTransport {
    sent: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: Value) -> Result<()> {
        self.sent.send(message).map_err(|_| Error::ChannelClosed)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The fake pushes inbound frames directly; the pump only has to stay
/// alive until the channel tears it down.
struct MockReceiver;

#[async_trait]
impl TransportReceiver for MockReceiver {
    async fn run(&mut self) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
