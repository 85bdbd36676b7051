//! Transport Port: the abstract `{accept, send, receive, close}` contract
//! shared by the user-facing and upstream WebSocket adapters.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::error::BrokerError;

/// Abstract bidirectional message channel. All four operations may
/// suspend. A graceful close observed on `receive` must be reported as
/// `BrokerError::UpstreamClosedOk`, not a generic transport error — the
/// relay pumps treat that variant as end-of-stream rather than failure.
#[async_trait]
pub trait TransportPort: Send + Sync {
    async fn accept(&self) -> Result<(), BrokerError>;
    async fn send(&self, message: Value) -> Result<(), BrokerError>;
    async fn receive(&self) -> Result<Value, BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

pub type BoxedPort = std::sync::Arc<dyn TransportPort>;

/// Decode a text frame as JSON; on failure, fall back to the raw string
/// rather than erroring, matching the original adapters' behavior.
fn decode_text(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn encode_text(message: &Value) -> String {
    match message {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// User-facing adapter over an already-upgraded axum WebSocket.
pub struct AxumWebSocketPort {
    sender: Mutex<futures_util::stream::SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>>,
    receiver: Mutex<futures_util::stream::SplitStream<axum::extract::ws::WebSocket>>,
    accepted: AtomicBool,
}

impl AxumWebSocketPort {
    pub fn new(socket: axum::extract::ws::WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            accepted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TransportPort for AxumWebSocketPort {
    async fn accept(&self) -> Result<(), BrokerError> {
        // The axum upgrade already completed the handshake by the time a
        // `WebSocket` exists; this only needs to be idempotent.
        self.accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<(), BrokerError> {
        use axum::extract::ws::Message;
        self.sender
            .lock()
            .await
            .send(Message::Text(encode_text(&message).into()))
            .await
            .map_err(|e| BrokerError::Session(format!("user send failed: {e}")))
    }

    async fn receive(&self) -> Result<Value, BrokerError> {
        use axum::extract::ws::Message;
        loop {
            let next = self.receiver.lock().await.next().await;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(decode_text(&text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(serde_json::from_slice(&bytes)
                        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())));
                }
                Some(Ok(Message::Close(_))) | None => return Err(BrokerError::UpstreamClosedOk),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(BrokerError::Session(format!("user receive failed: {e}"))),
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let _ = self.sender.lock().await.close().await;
        Ok(())
    }
}

/// Upstream adapter over a `tokio-tungstenite` client connection.
pub struct TungsteniteWebSocketPort {
    sender: Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
            tokio_tungstenite::tungstenite::Message,
        >,
    >,
    receiver: Mutex<
        futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        >,
    >,
    label: String,
}

impl TungsteniteWebSocketPort {
    pub fn new(
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        label: impl Into<String>,
    ) -> Self {
        let (sender, receiver) = stream.split();
        Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            label: label.into(),
        }
    }
}

#[async_trait]
impl TransportPort for TungsteniteWebSocketPort {
    async fn accept(&self) -> Result<(), BrokerError> {
        // Outbound client connections have no separate accept step.
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<(), BrokerError> {
        use tokio_tungstenite::tungstenite::Message;
        self.sender
            .lock()
            .await
            .send(Message::Text(encode_text(&message).into()))
            .await
            .map_err(|e| BrokerError::Session(format!("{} send failed: {e}", self.label)))
    }

    async fn receive(&self) -> Result<Value, BrokerError> {
        use tokio_tungstenite::tungstenite::Message;
        loop {
            let next = self.receiver.lock().await.next().await;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(decode_text(&text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(serde_json::from_slice(&bytes)
                        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())));
                }
                Some(Ok(Message::Close(_))) | None => return Err(BrokerError::UpstreamClosedOk),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                    continue
                }
                Some(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)) => {
                    return Err(BrokerError::UpstreamClosedOk)
                }
                Some(Err(e)) => return Err(BrokerError::Session(format!("{} receive failed: {e}", self.label))),
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let _ = self.sender.lock().await.close().await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory Transport Port pair for exercising the session and
    //! relay logic without real sockets.

    use super::*;
    use tokio::sync::mpsc;

    pub struct FakePort {
        outbound: mpsc::UnboundedSender<Value>,
        inbound: Mutex<mpsc::UnboundedReceiver<Value>>,
        pub accept_calls: std::sync::atomic::AtomicUsize,
        closed: AtomicBool,
    }

    impl FakePort {
        /// Build a connected pair: messages sent on `a` arrive via `b.receive()`.
        pub fn pair() -> (Self, Self) {
            let (tx_a, rx_a) = mpsc::unbounded_channel();
            let (tx_b, rx_b) = mpsc::unbounded_channel();
            (
                Self {
                    outbound: tx_a,
                    inbound: Mutex::new(rx_b),
                    accept_calls: std::sync::atomic::AtomicUsize::new(0),
                    closed: AtomicBool::new(false),
                },
                Self {
                    outbound: tx_b,
                    inbound: Mutex::new(rx_a),
                    accept_calls: std::sync::atomic::AtomicUsize::new(0),
                    closed: AtomicBool::new(false),
                },
            )
        }

        pub fn inject(&self, message: Value) {
            let _ = self.outbound.send(message);
        }
    }

    #[async_trait]
    impl TransportPort for FakePort {
        async fn accept(&self) -> Result<(), BrokerError> {
            self.accept_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, message: Value) -> Result<(), BrokerError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Session("port closed".into()));
            }
            self.outbound
                .send(message)
                .map_err(|_| BrokerError::Session("peer dropped".into()))
        }

        async fn receive(&self) -> Result<Value, BrokerError> {
            match self.inbound.lock().await.recv().await {
                Some(msg) => Ok(msg),
                None => Err(BrokerError::UpstreamClosedOk),
            }
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_port_relays_injected_messages() {
        let (a, b) = FakePort::pair();
        a.inject(serde_json::json!({"hello": "world"}));
        let received = b.receive().await.unwrap();
        assert_eq!(received, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn decode_text_falls_back_to_raw_string_on_invalid_json() {
        assert_eq!(decode_text("not json{"), Value::String("not json{".to_string()));
        assert_eq!(decode_text("\"quoted\""), Value::String("quoted".to_string()));
    }
}
