//! Socket transport seam.
//!
//! The state machine never talks to tokio-tungstenite directly; every
//! socket is opened through [`SocketConnector`] so the watcher, the attach
//! channel, and the coordinator can be exercised without a network stack
//! (see [`crate::testing`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

use crate::error::{Error, Result};

/// Close code of a clean shutdown initiated by either side.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the peer closed without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the transport died without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Parameters of a socket to open.
#[derive(Debug, Clone)]
pub struct SocketRequest {
    pub url: String,
    pub subprotocols: Vec<String>,
}

/// Events surfaced by an open socket, in arrival order. `Closed` is always
/// the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A binary or text payload.
    Message(Vec<u8>),
    /// The socket closed; no further events follow.
    Closed(SocketClose),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketClose {
    pub code: u16,
}

impl SocketClose {
    pub fn is_normal(self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// Write half of an open socket. Cheap to clone behind an `Arc`.
pub trait SocketSink: Send + Sync {
    /// Queues a binary frame. Best effort once the socket is closing.
    fn send(&self, frame: Vec<u8>);

    /// Initiates a clean close. Idempotent.
    fn close(&self);
}

/// An open socket: the write half plus the ordered event stream.
pub struct SocketHandle {
    pub sink: Arc<dyn SocketSink>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Capability to open sockets towards the host cluster.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Opens a socket; resolves once the handshake completed.
    async fn connect(&self, request: SocketRequest) -> Result<SocketHandle>;
}

/// tokio-tungstenite backed connector used outside of tests.
///
/// The subprotocol list is carried on the handshake, which is how the
/// bearer token reaches the API server (see
/// [`podshell_protocol::bearer_subprotocol`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, request: SocketRequest) -> Result<SocketHandle> {
        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::TransportOpen(e.to_string()))?;
        if !request.subprotocols.is_empty() {
            let protocols = request.subprotocols.join(", ");
            let value = HeaderValue::from_str(&protocols)
                .map_err(|e| Error::TransportOpen(e.to_string()))?;
            handshake
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(handshake)
            .await
            .map_err(|e| Error::TransportOpen(format!("{}: {e}", request.url)))?;
        debug!(target: "podshell.transport", url = %request.url, "socket open");
        let (mut write, mut read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(data) => {
                        if write.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let close = loop {
                match read.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if event_tx.send(SocketEvent::Message(data)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if event_tx.send(SocketEvent::Message(text.into_bytes())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break SocketClose {
                            code: frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS),
                        };
                    }
                    // ping/pong and raw frames are transport housekeeping
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => break SocketClose { code: CLOSE_ABNORMAL },
                }
            };
            let _ = event_tx.send(SocketEvent::Closed(close));
        });

        Ok(SocketHandle {
            sink: Arc::new(WsSink {
                outbound: outbound_tx,
                closed: AtomicBool::new(false),
            }),
            events: event_rx,
        })
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct WsSink {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl SocketSink for WsSink {
    fn send(&self, frame: Vec<u8>) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Frame(frame));
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_closure_is_the_only_normal_code() {
        assert!(SocketClose { code: CLOSE_NORMAL }.is_normal());
        assert!(!SocketClose { code: CLOSE_NO_STATUS }.is_normal());
        assert!(!SocketClose { code: CLOSE_ABNORMAL }.is_normal());
        assert!(!SocketClose { code: 1011 }.is_normal());
    }
}
