//! In-memory fakes for exercising the session machinery without a network
//! stack.
//!
//! Mirrors the shape of the real stack: [`FakeConnector`] stands in for
//! the WebSocket connector, [`FakeResourceClient`] for the REST surface,
//! and [`RecordingNotifier`] for the UI sink. Accepted sockets are exposed
//! as [`FakeSocket`] controllers so tests can inject watch events, emit
//! attach frames, and close connections with chosen codes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::resource::{
    CreateTerminalRequest, CreatedTerminal, HostCluster, HostClusterInfo, PodAddress,
    TerminalCoordinate, TerminalCredentials, TerminalMetadata, TerminalResourceClient,
};
use crate::transport::{
    CLOSE_NORMAL, SocketClose, SocketConnector, SocketEvent, SocketHandle, SocketRequest,
    SocketSink,
};
use crate::ui::Notifier;

/// A watch event announcing a Running pod whose `container` is ready.
pub fn pod_ready_event(container: &str) -> JsonValue {
    json!({
        "type": "ADDED",
        "object": {
            "spec": {
                "nodeName": "node-1",
                "containers": [{"name": container, "image": "ops-toolbelt:latest"}]
            },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": container, "ready": true, "state": {"running": {}}}
                ]
            }
        }
    })
}

struct SocketShared {
    request: SocketRequest,
    events: mpsc::UnboundedSender<SocketEvent>,
    sent: Mutex<Vec<Vec<u8>>>,
    sent_count: watch::Sender<u64>,
    closed_by_client: AtomicBool,
    close_calls: AtomicU64,
}

/// Controller of one accepted fake socket.
#[derive(Clone)]
pub struct FakeSocket {
    shared: Arc<SocketShared>,
}

impl FakeSocket {
    /// The request the code under test connected with.
    pub fn request(&self) -> SocketRequest {
        self.shared.request.clone()
    }

    /// Frames the code under test wrote to the socket.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.sent.lock().clone()
    }

    /// Waits until at least `n` frames have been written.
    pub async fn wait_sent(&self, n: u64) {
        let mut rx = self.shared.sent_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Whether the code under test initiated a close.
    pub fn closed_by_client(&self) -> bool {
        self.shared.closed_by_client.load(Ordering::SeqCst)
    }

    /// Number of close calls made by the code under test.
    pub fn close_calls(&self) -> u64 {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    /// Injects an inbound message.
    pub fn emit(&self, payload: Vec<u8>) {
        let _ = self.shared.events.send(SocketEvent::Message(payload));
    }

    /// Injects an inbound JSON message, as the watch endpoint sends them.
    pub fn emit_json(&self, value: &JsonValue) {
        self.emit(value.to_string().into_bytes());
    }

    /// Closes the socket from the remote side with `code`.
    pub fn close(&self, code: u16) {
        let _ = self
            .shared
            .events
            .send(SocketEvent::Closed(SocketClose { code }));
    }
}

struct FakeSink {
    shared: Arc<SocketShared>,
}

impl SocketSink for FakeSink {
    fn send(&self, frame: Vec<u8>) {
        if self.shared.closed_by_client.load(Ordering::SeqCst) {
            return;
        }
        self.shared.sent.lock().push(frame);
        self.shared.sent_count.send_modify(|count| *count += 1);
    }

    fn close(&self) {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.shared.closed_by_client.swap(true, Ordering::SeqCst) {
            // a clean client close is answered with a normal close frame
            let _ = self
                .shared
                .events
                .send(SocketEvent::Closed(SocketClose { code: CLOSE_NORMAL }));
        }
    }
}

/// Connect attempts per lane, including refused ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectAttempts {
    pub watch: u64,
    pub attach: u64,
}

#[derive(Default)]
struct ConnectorState {
    refuse_watch: u32,
    refuse_attach: u32,
    hold_watch: bool,
    auto_pod_ready: Option<String>,
    sockets: Vec<FakeSocket>,
}

enum ConnectPlan {
    Refuse,
    Hold,
    Accept { announce: Option<String> },
}

/// Scriptable [`SocketConnector`].
///
/// Accepts every connect by default. Watch and attach connections are
/// told apart by their URL, so one connector serves a whole session.
pub struct FakeConnector {
    state: Mutex<ConnectorState>,
    attempts: watch::Sender<ConnectAttempts>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        let (attempts, _) = watch::channel(ConnectAttempts::default());
        Arc::new(Self {
            state: Mutex::new(ConnectorState::default()),
            attempts,
        })
    }

    /// Announce a Running/ready pod on every accepted watch connect.
    pub fn auto_pod_ready(&self, container: &str) {
        self.state.lock().auto_pod_ready = Some(container.to_string());
    }

    /// Refuses the next `n` watch connects.
    pub fn refuse_next_watch(&self, n: u32) {
        self.state.lock().refuse_watch = n;
    }

    /// Refuses the next `n` attach connects.
    pub fn refuse_next_attach(&self, n: u32) {
        self.state.lock().refuse_attach = n;
    }

    /// Makes watch connects hang until dropped by the caller's timeout.
    pub fn hold_watch_connects(&self, hold: bool) {
        self.state.lock().hold_watch = hold;
    }

    /// All accepted sockets, in connect order.
    pub fn sockets(&self) -> Vec<FakeSocket> {
        self.state.lock().sockets.clone()
    }

    /// Accepted watch sockets, in connect order.
    pub fn watch_sockets(&self) -> Vec<FakeSocket> {
        self.lane_sockets(false)
    }

    /// Accepted attach sockets, in connect order.
    pub fn attach_sockets(&self) -> Vec<FakeSocket> {
        self.lane_sockets(true)
    }

    pub fn attempts(&self) -> ConnectAttempts {
        *self.attempts.borrow()
    }

    /// Waits until `n` watch connects have been attempted.
    pub async fn wait_watch_attempts(&self, n: u64) {
        let mut rx = self.attempts.subscribe();
        let _ = rx.wait_for(|attempts| attempts.watch >= n).await;
    }

    /// Waits until `n` attach connects have been attempted.
    pub async fn wait_attach_attempts(&self, n: u64) {
        let mut rx = self.attempts.subscribe();
        let _ = rx.wait_for(|attempts| attempts.attach >= n).await;
    }

    fn lane_sockets(&self, attach: bool) -> Vec<FakeSocket> {
        self.state
            .lock()
            .sockets
            .iter()
            .filter(|s| is_attach_url(&s.shared.request.url) == attach)
            .cloned()
            .collect()
    }
}

fn is_attach_url(url: &str) -> bool {
    url.contains("/attach?")
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, request: SocketRequest) -> Result<SocketHandle> {
        let attach = is_attach_url(&request.url);
        let plan = {
            let mut state = self.state.lock();
            if attach {
                if state.refuse_attach > 0 {
                    state.refuse_attach -= 1;
                    ConnectPlan::Refuse
                } else {
                    ConnectPlan::Accept { announce: None }
                }
            } else if state.hold_watch {
                ConnectPlan::Hold
            } else if state.refuse_watch > 0 {
                state.refuse_watch -= 1;
                ConnectPlan::Refuse
            } else {
                ConnectPlan::Accept {
                    announce: state.auto_pod_ready.clone(),
                }
            }
        };
        let result = match plan {
            ConnectPlan::Hold => None,
            ConnectPlan::Refuse => {
                Some(Err(Error::TransportOpen("connection refused".to_string())))
            }
            ConnectPlan::Accept { announce } => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (sent_count, _) = watch::channel(0);
                let shared = Arc::new(SocketShared {
                    request,
                    events: events_tx,
                    sent: Mutex::new(Vec::new()),
                    sent_count,
                    closed_by_client: AtomicBool::new(false),
                    close_calls: AtomicU64::new(0),
                });
                let socket = FakeSocket {
                    shared: Arc::clone(&shared),
                };
                if let Some(container) = announce {
                    socket.emit_json(&pod_ready_event(&container));
                }
                self.state.lock().sockets.push(socket);
                Some(Ok(SocketHandle {
                    sink: Arc::new(FakeSink { shared }),
                    events: events_rx,
                }))
            }
        };
        // the socket is registered before the attempt becomes visible, so
        // a test waiting on the counter can fetch the controller right away
        self.attempts.send_modify(|attempts| {
            if attach {
                attempts.attach += 1;
            } else {
                attempts.watch += 1;
            }
        });

        match result {
            Some(result) => result,
            None => {
                std::future::pending::<()>().await;
                unreachable!("held connects never resolve")
            }
        }
    }
}

#[derive(Default)]
struct ResourceState {
    fail_create: Option<String>,
    fail_fetch: Option<String>,
    fail_heartbeat: bool,
    deletes: u64,
    create_requests: Vec<CreateTerminalRequest>,
}

/// [`TerminalResourceClient`] with canned responses and a call log.
///
/// The canned host cluster matches [`FakeResourceClient::host_cluster`],
/// so a session driven against this client connects its watch and attach
/// sockets for pod `term-0`, container `terminal`.
pub struct FakeResourceClient {
    state: Mutex<ResourceState>,
    heartbeats: watch::Sender<u64>,
}

impl FakeResourceClient {
    pub fn new() -> Arc<Self> {
        let (heartbeats, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(ResourceState::default()),
            heartbeats,
        })
    }

    /// The host cluster every fake session points at.
    pub fn host_cluster() -> HostCluster {
        HostCluster {
            kube_api_server: "api.example.test".to_string(),
            namespace: "host-ns".to_string(),
            pod: PodAddress {
                name: "term-0".to_string(),
                container: "terminal".to_string(),
            },
            token: "attach-token".to_string(),
        }
    }

    /// Fails the next create call with `message`.
    pub fn fail_create(&self, message: &str) {
        self.state.lock().fail_create = Some(message.to_string());
    }

    /// Fails the next fetch call with `message`.
    pub fn fail_fetch(&self, message: &str) {
        self.state.lock().fail_fetch = Some(message.to_string());
    }

    /// Makes every heartbeat call fail while set.
    pub fn fail_heartbeat(&self, fail: bool) {
        self.state.lock().fail_heartbeat = fail;
    }

    /// Heartbeat calls made so far, including failing ones.
    pub fn heartbeat_count(&self) -> u64 {
        *self.heartbeats.borrow()
    }

    /// Waits until `n` heartbeat calls have been made.
    pub async fn wait_heartbeats(&self, n: u64) {
        let mut rx = self.heartbeats.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    pub fn create_requests(&self) -> Vec<CreateTerminalRequest> {
        self.state.lock().create_requests.clone()
    }

    pub fn delete_count(&self) -> u64 {
        self.state.lock().deletes
    }
}

#[async_trait]
impl TerminalResourceClient for FakeResourceClient {
    async fn create(
        &self,
        coordinate: &TerminalCoordinate,
        request: &CreateTerminalRequest,
    ) -> Result<CreatedTerminal> {
        let mut state = self.state.lock();
        state.create_requests.push(request.clone());
        if let Some(message) = state.fail_create.take() {
            return Err(Error::ServerRejection(message));
        }
        let host = Self::host_cluster();
        Ok(CreatedTerminal {
            metadata: TerminalMetadata {
                name: "term-abc".to_string(),
                namespace: coordinate.namespace.clone(),
            },
            host_cluster: HostClusterInfo {
                kube_api_server: host.kube_api_server,
                namespace: host.namespace,
                pod: PodAddress {
                    name: host.pod.name,
                    // the container is only known once credentials exist
                    container: String::new(),
                },
            },
            image_help_text: Some("Run `toolbox` for extras".to_string()),
        })
    }

    async fn fetch(
        &self,
        _coordinate: &TerminalCoordinate,
        _metadata: &TerminalMetadata,
    ) -> Result<TerminalCredentials> {
        if let Some(message) = self.state.lock().fail_fetch.take() {
            return Err(Error::ServerRejection(message));
        }
        let host = Self::host_cluster();
        Ok(TerminalCredentials {
            pod: host.pod,
            token: host.token,
        })
    }

    async fn delete(
        &self,
        _coordinate: &TerminalCoordinate,
        _metadata: &TerminalMetadata,
    ) -> Result<()> {
        self.state.lock().deletes += 1;
        Ok(())
    }

    async fn heartbeat(
        &self,
        _coordinate: &TerminalCoordinate,
        _metadata: &TerminalMetadata,
    ) -> Result<()> {
        let fail = self.state.lock().fail_heartbeat;
        self.heartbeats.send_modify(|count| *count += 1);
        if fail {
            return Err(Error::ServerRejection("heartbeat rejected".to_string()));
        }
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<TerminalMetadata>> {
        Ok(vec![TerminalMetadata {
            name: "term-abc".to_string(),
            namespace: namespace.to_string(),
        }])
    }
}

#[derive(Debug, Default, Clone)]
struct NotifierLog {
    errors: Vec<(String, String)>,
    spinner_texts: Vec<String>,
    spinner_running: bool,
    clears: u64,
}

/// [`Notifier`] capturing every call for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    log: Mutex<NotifierLog>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(title, detail)` pairs shown so far.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.log.lock().errors.clone()
    }

    pub fn last_error(&self) -> Option<(String, String)> {
        self.log.lock().errors.last().cloned()
    }

    pub fn spinner_running(&self) -> bool {
        self.log.lock().spinner_running
    }

    pub fn spinner_texts(&self) -> Vec<String> {
        self.log.lock().spinner_texts.clone()
    }

    pub fn clear_count(&self) -> u64 {
        self.log.lock().clears
    }
}

impl Notifier for RecordingNotifier {
    fn show_error(&self, title: &str, detail: &str) {
        self.log
            .lock()
            .errors
            .push((title.to_string(), detail.to_string()));
    }

    fn clear_error(&self) {
        self.log.lock().clears += 1;
    }

    fn spinner_start(&self, text: &str) {
        let mut log = self.log.lock();
        log.spinner_running = true;
        log.spinner_texts.push(text.to_string());
    }

    fn spinner_update(&self, text: &str) {
        self.log.lock().spinner_texts.push(text.to_string());
    }

    fn spinner_stop(&self) {
        self.log.lock().spinner_running = false;
    }
}
