//! Adapter for the interactive multiplexed attach socket.
//!
//! Decoding of the channel-prefixed frames happens here; consumers only
//! ever see [`OutputChunk`]s. While the socket is open an empty stdin
//! frame is sent periodically so idle sessions are not reaped by
//! intermediaries.

use std::sync::Arc;
use std::time::Duration;

use podshell_protocol as protocol;
use podshell_protocol::{Channel, ErrorChannelStatus, ResizeMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::resource::HostCluster;
use crate::transport::{
    CLOSE_ABNORMAL, SocketClose, SocketConnector, SocketEvent, SocketRequest, SocketSink,
};

/// Decoded output from the remote terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Cloneable write-side facade of an attach connection.
#[derive(Clone)]
pub struct AttachIo {
    sink: Arc<dyn SocketSink>,
}

impl AttachIo {
    /// Queues keystrokes for the remote stdin.
    pub fn send_stdin(&self, data: &[u8]) {
        self.sink.send(protocol::encode(Channel::Stdin, data));
    }

    /// Announces a new terminal geometry to the remote side.
    pub fn send_resize(&self, cols: u16, rows: u16) {
        let message = ResizeMessage {
            width: cols,
            height: rows,
        };
        match serde_json::to_vec(&message) {
            Ok(payload) => self.sink.send(protocol::encode(Channel::Resize, &payload)),
            Err(err) => {
                warn!(target: "podshell.attach", error = %err, "could not encode resize message");
            }
        }
    }

    /// Initiates a clean close. Idempotent.
    pub fn close(&self) {
        self.sink.close();
    }
}

/// An open attach connection.
///
/// Owns the pump task that decodes incoming frames until the socket
/// closes. The coordinator calls [`AttachChannel::close`] exactly once per
/// attempt; `Drop` covers abandoned channels.
pub struct AttachChannel {
    io: AttachIo,
    closed: Option<oneshot::Receiver<SocketClose>>,
}

impl AttachChannel {
    /// Opens the attach socket and starts decoding frames into `output`.
    pub async fn open(
        connector: &dyn SocketConnector,
        host: &HostCluster,
        output: mpsc::UnboundedSender<OutputChunk>,
        keep_alive: Duration,
    ) -> Result<Self> {
        let url = protocol::attach_uri(
            &host.kube_api_server,
            &host.namespace,
            &host.pod.name,
            &host.pod.container,
        )
        .map_err(|e| Error::TransportOpen(format!("invalid attach endpoint: {e}")))?;
        let request = SocketRequest {
            url: url.to_string(),
            subprotocols: protocol::attach_subprotocols(&host.token),
        };

        let handle = connector.connect(request).await?;
        let sink = Arc::clone(&handle.sink);
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(pump(handle.events, Arc::clone(&sink), output, keep_alive, closed_tx));

        Ok(Self {
            io: AttachIo { sink },
            closed: Some(closed_rx),
        })
    }

    /// Write-side facade, for forwarding input while connected.
    pub fn io(&self) -> AttachIo {
        self.io.clone()
    }

    /// Resolves once the socket has closed, with the close code.
    pub async fn closed(&mut self) -> SocketClose {
        match self.closed.take() {
            Some(closed) => closed.await.unwrap_or(SocketClose {
                code: CLOSE_ABNORMAL,
            }),
            None => SocketClose {
                code: CLOSE_ABNORMAL,
            },
        }
    }

    /// Initiates a clean close. Idempotent.
    pub fn close(&self) {
        self.io.close();
    }
}

impl Drop for AttachChannel {
    fn drop(&mut self) {
        self.io.close();
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    sink: Arc<dyn SocketSink>,
    output: mpsc::UnboundedSender<OutputChunk>,
    keep_alive: Duration,
    closed_tx: oneshot::Sender<SocketClose>,
) {
    let mut ping = time::interval_at(time::Instant::now() + keep_alive, keep_alive);
    ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let close = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SocketEvent::Message(frame)) => handle_frame(&frame, &output),
                Some(SocketEvent::Closed(close)) => break close,
                None => break SocketClose { code: CLOSE_ABNORMAL },
            },
            _ = ping.tick() => {
                // empty stdin frame, keeps the connection from idling out
                sink.send(protocol::encode(Channel::Stdin, &[]));
            }
        }
    };
    let _ = closed_tx.send(close);
}

fn handle_frame(frame: &[u8], output: &mpsc::UnboundedSender<OutputChunk>) {
    // single-byte frames are keep-alives with no payload
    if frame.len() < 2 {
        return;
    }
    let Some((id, payload)) = protocol::split(frame) else {
        return;
    };
    match Channel::from_id(id) {
        Some(Channel::Stdout) => {
            let _ = output.send(OutputChunk::Stdout(payload.to_vec()));
        }
        Some(Channel::Stderr) => {
            let _ = output.send(OutputChunk::Stderr(payload.to_vec()));
        }
        Some(Channel::Error) => report_error_channel(payload),
        Some(Channel::Stdin) | Some(Channel::Resize) | None => {
            warn!(target: "podshell.attach", channel = id, "unsupported channel in incoming frame");
        }
    }
}

fn report_error_channel(payload: &[u8]) {
    match serde_json::from_slice::<ErrorChannelStatus>(payload) {
        Ok(status) if status.is_success() => {}
        Ok(status) => {
            error!(
                target: "podshell.attach",
                status = ?status.status,
                message = ?status.message,
                "error channel report"
            );
        }
        Err(_) => {
            error!(
                target: "podshell.attach",
                payload = %String::from_utf8_lossy(payload),
                "error channel report"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;
    use serde_json::json;

    fn host() -> HostCluster {
        HostCluster {
            kube_api_server: "api.example.test".to_string(),
            namespace: "host-ns".to_string(),
            pod: crate::resource::PodAddress {
                name: "term-0".to_string(),
                container: "terminal".to_string(),
            },
            token: "attach-token".to_string(),
        }
    }

    #[tokio::test]
    async fn decodes_stdout_and_stderr_frames() {
        let connector = FakeConnector::new();
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let _channel = AttachChannel::open(&*connector, &host(), output_tx, Duration::from_secs(30))
            .await
            .unwrap();

        let socket = connector.attach_sockets().pop().unwrap();
        socket.emit(protocol::encode(Channel::Stdout, b"hello"));
        socket.emit(protocol::encode(Channel::Stderr, b"oops"));
        // error channel Success reports are informational and dropped
        socket.emit(protocol::encode(
            Channel::Error,
            json!({"status": "Success"}).to_string().as_bytes(),
        ));
        socket.emit(protocol::encode(Channel::Stdout, b"world"));

        assert_eq!(output_rx.recv().await, Some(OutputChunk::Stdout(b"hello".to_vec())));
        assert_eq!(output_rx.recv().await, Some(OutputChunk::Stderr(b"oops".to_vec())));
        assert_eq!(output_rx.recv().await, Some(OutputChunk::Stdout(b"world".to_vec())));
    }

    #[tokio::test]
    async fn stdin_and_resize_are_framed() {
        let connector = FakeConnector::new();
        let (output_tx, _output_rx) = mpsc::unbounded_channel();
        let channel = AttachChannel::open(&*connector, &host(), output_tx, Duration::from_secs(30))
            .await
            .unwrap();

        channel.io().send_stdin(b"ls\n");
        channel.io().send_resize(120, 40);

        let socket = connector.attach_sockets().pop().unwrap();
        let sent = socket.sent();
        assert_eq!(sent[0], protocol::encode(Channel::Stdin, b"ls\n"));
        assert_eq!(sent[1][0], Channel::Resize.id());
        let resize: ResizeMessage = serde_json::from_slice(&sent[1][1..]).unwrap();
        assert_eq!(resize, ResizeMessage { width: 120, height: 40 });
    }

    #[tokio::test(start_paused = true)]
    async fn sends_periodic_keep_alive_frames() {
        let connector = FakeConnector::new();
        let (output_tx, _output_rx) = mpsc::unbounded_channel();
        let _channel = AttachChannel::open(&*connector, &host(), output_tx, Duration::from_secs(30))
            .await
            .unwrap();

        let socket = connector.attach_sockets().pop().unwrap();
        assert!(socket.sent().is_empty());

        time::advance(Duration::from_secs(30)).await;
        socket.wait_sent(1).await;
        time::advance(Duration::from_secs(30)).await;
        socket.wait_sent(2).await;

        let sent = socket.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|frame| frame == &vec![Channel::Stdin.id()]));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_the_close_code() {
        let connector = FakeConnector::new();
        let (output_tx, _output_rx) = mpsc::unbounded_channel();
        let mut channel =
            AttachChannel::open(&*connector, &host(), output_tx, Duration::from_secs(30))
                .await
                .unwrap();

        let socket = connector.attach_sockets().pop().unwrap();
        socket.close(4402);
        assert_eq!(channel.closed().await, SocketClose { code: 4402 });

        channel.close();
        channel.close();
        assert!(socket.closed_by_client());
    }
}
