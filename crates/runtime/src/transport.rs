//! Transport seam for kernel channels.
//!
//! A transport is split three ways so the channel can own each concern
//! independently: a sender for outbound frames, a receiver pump that
//! forwards inbound frames until the connection ends, and the mpsc receiver
//! those frames arrive on. The [`Dialer`] seam is what tests replace with an
//! in-memory fake.

use crate::error::{Error, Result, classify_status};
use crate::token::AccessToken;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use futures_util::stream::{SplitSink, SplitStream};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sender half of a kernel transport.
#[async_trait]
pub trait Transport: Send {
    /// Send one JSON frame.
    async fn send(&mut self, message: Value) -> Result<()>;
    /// Close the underlying connection.
    async fn close(&mut self) -> Result<()>;
}

/// Receiver pump: forwards inbound text frames until the connection ends or
/// a frame cannot be represented as text.
#[async_trait]
pub trait TransportReceiver: Send {
    async fn run(&mut self) -> Result<()>;
}

/// The three pieces a dial produces, handed to the channel to own.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl std::fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParts").finish_non_exhaustive()
    }
}

/// Opens transports to kernel endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a transport to `endpoint`, authenticating with `token`, giving
    /// up after `timeout`.
    async fn dial(
        &self,
        endpoint: &str,
        token: &AccessToken,
        timeout: Duration,
    ) -> Result<TransportParts>;
}

/// Production dialer over a WebSocket with a bearer upgrade header.
#[derive(Debug, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        endpoint: &str,
        token: &AccessToken,
        timeout: Duration,
    ) -> Result<TransportParts> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|err| Error::Protocol(format!("invalid endpoint '{endpoint}': {err}")))?;

        // A missing or malformed auth header is the documented root cause of
        // complete protocol failure; build it here, on every dial.
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.secret))
            .map_err(|err| Error::Token(format!("token is not a valid header value: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::debug!(target: "cgpu.transport", endpoint, "dialing kernel endpoint");

        let (stream, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))?
            .map_err(classify_ws_error)?;

        let (sink, stream) = stream.split();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        Ok(TransportParts {
            sender: Box::new(WsSender { sink }),
            receiver: Box::new(WsReceiver { stream, inbound_tx }),
            inbound,
        })
    }
}

struct WsSender {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl Transport for WsSender {
    async fn send(&mut self, message: Value) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(classify_ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(classify_ws_error)
    }
}

struct WsReceiver {
    stream: SplitStream<WsStream>,
    inbound_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportReceiver for WsReceiver {
    async fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(classify_ws_error)? {
                Message::Text(text) => {
                    if self.inbound_tx.send(text).is_err() {
                        break;
                    }
                }
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes).map_err(|_| {
                        Error::Protocol("binary frame is not valid UTF-8".into())
                    })?;
                    if self.inbound_tx.send(text).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(())
    }
}

/// Classify a tungstenite error at the point it is first observed.
fn classify_ws_error(err: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            Error::Connect {
                message: format!("server rejected connection upgrade ({status})"),
                status: Some(status),
                category: classify_status(status),
            }
        }
        WsError::Io(err) => Error::Connect {
            message: err.to_string(),
            status: None,
            category: crate::error::ErrorCategory::Transient,
        },
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ChannelClosed,
        other => Error::Connect {
            message: other.to_string(),
            status: None,
            category: crate::error::ErrorCategory::Protocol,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::tungstenite::http::Response;

    #[test]
    fn gateway_rejection_classifies_transient() {
        let response = Response::builder().status(502).body(None).unwrap();
        let err = classify_ws_error(WsError::Http(response));
        assert_eq!(err.category(), crate::error::ErrorCategory::Transient);
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn stale_token_rejection_classifies_auth() {
        for status in [401u16, 404] {
            let response = Response::builder().status(status).body(None).unwrap();
            let err = classify_ws_error(WsError::Http(response));
            assert_eq!(err.category(), crate::error::ErrorCategory::Auth);
        }
    }

    #[test]
    fn socket_drop_classifies_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = classify_ws_error(WsError::Io(io));
        assert_eq!(err.category(), crate::error::ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn dial_rejects_malformed_endpoint() {
        let token = AccessToken {
            secret: "tok".into(),
            expires_at: None,
            scopes: vec![],
        };
        let err = WsDialer
            .dial("not a url", &token, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Protocol);
    }
}
