//! The end-to-end attach session state machine.
//!
//! One [`SessionCoordinator`] drives one logical session: create the
//! server-side resource, fetch attach credentials, wait for the pod, open
//! the attach socket, heartbeat while connected, and reconnect within the
//! [`crate::reconnect`] budget when the transport drops. `open()` settles
//! once the session is either connected or terminally failed; reconnection
//! keeps running in the background after that.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attach::{AttachChannel, AttachIo, OutputChunk};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatTicker;
use crate::reconnect;
use crate::resource::{
    ContainerSpec, CreateTerminalRequest, HostCluster, HostClusterInfo, HostPreferences,
    TerminalCoordinate, TerminalMetadata, TerminalResourceClient,
};
use crate::transport::SocketConnector;
use crate::ui::Notifier;
use crate::watcher::{ContainerObservation, PodReadinessWatcher};

/// Connection lifecycle of one session. Progresses monotonically on the
/// happy path and re-enters `Connecting` from `Connected` on transport
/// loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Creating,
    Fetching,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Creating)
            | (Creating, Fetching)
            | (Fetching, Connecting)
            | (Connecting, Connecting)
            | (Connecting, Connected)
            | (Connected, Connecting)
            | (_, Disconnected) => true,
            _ => false,
        }
    }
}

/// How an `open()` call settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The attach socket is up and the heartbeat is running.
    Connected,
    /// Readiness or the retry budget failed; the user was notified.
    Failed,
    /// `cancel()` won the race; no notification was shown.
    Cancelled,
}

/// What the caller wants the terminal to be.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub coordinate: TerminalCoordinate,
    pub container: ContainerSpec,
    pub host: HostPreferences,
}

#[derive(Debug, Clone, Default)]
struct SessionRecord {
    metadata: Option<TerminalMetadata>,
    host: Option<HostClusterInfo>,
    token: Option<String>,
    image_help_text: Option<String>,
    observation: ContainerObservation,
}

/// Drives one attach session. `open()` is intended to be called once per
/// instance; dropping the coordinator cancels the session.
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    spec: SessionSpec,
    config: SessionConfig,
    client: Arc<dyn TerminalResourceClient>,
    connector: Arc<dyn SocketConnector>,
    notifier: Arc<dyn Notifier>,
    output: mpsc::UnboundedSender<OutputChunk>,
    state: watch::Sender<ConnectionState>,
    record: Mutex<SessionRecord>,
    attach_io: Mutex<Option<AttachIo>>,
    cancel: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(
        spec: SessionSpec,
        config: SessionConfig,
        client: Arc<dyn TerminalResourceClient>,
        connector: Arc<dyn SocketConnector>,
        notifier: Arc<dyn Notifier>,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                spec,
                config,
                client,
                connector,
                notifier,
                output,
                state,
                record: Mutex::new(SessionRecord::default()),
                attach_io: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Establishes the session. Resolves once the terminal is connected or
    /// the connect cycle has terminally failed; a failed create or fetch
    /// call is the only error surfaced to the caller.
    pub async fn open(&self) -> Result<OpenOutcome> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Ok(OpenOutcome::Cancelled);
        }

        inner.enter(ConnectionState::Creating);
        let request = CreateTerminalRequest {
            identifier: Uuid::new_v4().to_string(),
            host: inner.spec.host.clone(),
            container: inner.spec.container.clone(),
        };
        let created = match inner.client.create(&inner.spec.coordinate, &request).await {
            Ok(created) => created,
            Err(err) => {
                inner.enter(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        if inner.cancel.is_cancelled() {
            inner.enter(ConnectionState::Disconnected);
            return Ok(OpenOutcome::Cancelled);
        }
        let metadata = created.metadata.clone();
        {
            let mut record = inner.record.lock();
            record.metadata = Some(created.metadata);
            record.host = Some(created.host_cluster);
            record.image_help_text = created.image_help_text;
        }

        inner.enter(ConnectionState::Fetching);
        let credentials = match inner.client.fetch(&inner.spec.coordinate, &metadata).await {
            Ok(credentials) => credentials,
            Err(err) => {
                inner.enter(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        if inner.cancel.is_cancelled() {
            inner.enter(ConnectionState::Disconnected);
            return Ok(OpenOutcome::Cancelled);
        }
        let host = {
            let mut record = inner.record.lock();
            let Some(host) = record.host.as_mut() else {
                // cleared concurrently; treat like cancellation
                return Ok(OpenOutcome::Cancelled);
            };
            host.pod = credentials.pod;
            let host_cluster = HostCluster {
                kube_api_server: host.kube_api_server.clone(),
                namespace: host.namespace.clone(),
                pod: host.pod.clone(),
                token: credentials.token.clone(),
            };
            record.token = Some(credentials.token);
            host_cluster
        };

        let (settled_tx, settled_rx) = oneshot::channel();
        tokio::spawn(Inner::connect_loop(
            Arc::clone(inner),
            host,
            metadata,
            settled_tx,
        ));
        Ok(settled_rx.await.unwrap_or(OpenOutcome::Cancelled))
    }

    /// Cancels the session from any state. In-flight operations become
    /// no-ops on completion; cancellation is never an error and produces
    /// no notification.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        if let Some(io) = self.inner.attach_io.lock().take() {
            io.close();
        }
        self.inner.enter(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether the server-side resource exists.
    pub fn is_created(&self) -> bool {
        self.inner.record.lock().metadata.is_some()
    }

    pub fn metadata(&self) -> Option<TerminalMetadata> {
        self.inner.record.lock().metadata.clone()
    }

    pub fn image_help_text(&self) -> Option<String> {
        self.inner.record.lock().image_help_text.clone()
    }

    /// Latest host/container facts from the readiness watch, kept for
    /// diagnostics while connected.
    pub fn observation(&self) -> ContainerObservation {
        self.inner.record.lock().observation.clone()
    }

    /// Forwards keystrokes to the remote stdin. No-op unless connected.
    pub fn send_stdin(&self, data: &[u8]) {
        if let Some(io) = self.inner.attach_io.lock().as_ref() {
            io.send_stdin(data);
        }
    }

    /// Announces a new terminal geometry. No-op unless connected.
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Some(io) = self.inner.attach_io.lock().as_ref() {
            io.send_resize(cols, rows);
        }
    }

    /// Deletes the server-side resource. Owned by the caller and invoked
    /// separately from the connection lifecycle.
    pub async fn delete(&self) -> Result<()> {
        let Some(metadata) = self.inner.record.lock().metadata.clone() else {
            return Ok(());
        };
        self.inner
            .client
            .delete(&self.inner.spec.coordinate, &metadata)
            .await?;
        self.inner.record.lock().metadata = None;
        Ok(())
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn enter(&self, next: ConnectionState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            warn!(
                target: "podshell.session",
                from = ?current,
                to = ?next,
                "unexpected state transition"
            );
        }
        if next == ConnectionState::Disconnected {
            self.record.lock().observation = ContainerObservation::default();
        }
        self.state.send_replace(next);
        debug!(target: "podshell.session", state = ?next, "connection state");
    }

    fn observe(&self, observation: &ContainerObservation) {
        if let Some(phase) = observation.phase {
            self.notifier
                .spinner_update(&format!("Connecting to Pod. Current phase is \"{phase}\"."));
        }
        self.record.lock().observation = observation.clone();
    }

    fn settle(settled: &mut Option<oneshot::Sender<OpenOutcome>>, outcome: OpenOutcome) {
        if let Some(tx) = settled.take() {
            let _ = tx.send(outcome);
        }
    }

    fn exit_cancelled(&self, settled: &mut Option<oneshot::Sender<OpenOutcome>>) {
        self.notifier.spinner_stop();
        self.enter(ConnectionState::Disconnected);
        Self::settle(settled, OpenOutcome::Cancelled);
    }

    async fn connect_loop(
        inner: Arc<Inner>,
        host: HostCluster,
        metadata: TerminalMetadata,
        settled: oneshot::Sender<OpenOutcome>,
    ) {
        let mut settled = Some(settled);
        let mut tries: u32 = 0;
        let mut ever_connected = false;

        loop {
            if inner.cancel.is_cancelled() {
                inner.exit_cancelled(&mut settled);
                return;
            }

            tries += 1;
            inner.enter(ConnectionState::Connecting);
            if !ever_connected {
                inner.notifier.spinner_start("Connecting to Pod");
            }

            let observer = {
                let inner = Arc::clone(&inner);
                Arc::new(move |observation: &ContainerObservation| inner.observe(observation))
            };
            let watcher =
                PodReadinessWatcher::new(Arc::clone(&inner.connector), host.clone())
                    .with_observer(observer);
            let readiness = tokio::select! {
                readiness = watcher.wait(inner.config.pod_ready_timeout) => Some(readiness),
                _ = inner.cancel.cancelled() => None,
            };
            match readiness {
                Some(Ok(())) => {}
                None => {
                    inner.exit_cancelled(&mut settled);
                    return;
                }
                Some(Err(err)) => {
                    if inner.cancel.is_cancelled() {
                        inner.exit_cancelled(&mut settled);
                        return;
                    }
                    error!(
                        target: "podshell.session",
                        error = %err,
                        "failed to wait until pod is running"
                    );
                    inner.notifier.spinner_stop();
                    inner
                        .notifier
                        .show_error("Could not connect to terminal", &err.to_string());
                    inner.enter(ConnectionState::Disconnected);
                    Self::settle(&mut settled, OpenOutcome::Failed);
                    return;
                }
            }

            let attach = tokio::select! {
                attach = AttachChannel::open(
                    &*inner.connector,
                    &host,
                    inner.output.clone(),
                    inner.config.keep_alive_interval,
                ) => Some(attach),
                _ = inner.cancel.cancelled() => None,
            };
            match attach {
                None => {
                    inner.exit_cancelled(&mut settled);
                    return;
                }
                Some(Ok(mut channel)) => {
                    if inner.cancel.is_cancelled() {
                        channel.close();
                        inner.exit_cancelled(&mut settled);
                        return;
                    }

                    *inner.attach_io.lock() = Some(channel.io());
                    inner.notifier.spinner_stop();
                    inner.notifier.clear_error();
                    inner.enter(ConnectionState::Connected);
                    tries = 0;
                    ever_connected = true;
                    Self::settle(&mut settled, OpenOutcome::Connected);
                    info!(target: "podshell.session", "terminal attached");

                    let heartbeat = HeartbeatTicker::start(
                        Arc::clone(&inner.client),
                        inner.spec.coordinate.clone(),
                        metadata.clone(),
                        inner.config.heartbeat_interval,
                        &inner.cancel,
                    );

                    let close = tokio::select! {
                        close = channel.closed() => Some(close),
                        _ = inner.cancel.cancelled() => None,
                    };
                    // the heartbeat and the reconnect timer must never
                    // outlive the attach channel they belong to
                    inner.attach_io.lock().take();
                    channel.close();
                    drop(heartbeat);

                    let close = match close {
                        Some(close) if !inner.cancel.is_cancelled() => close,
                        _ => {
                            inner.exit_cancelled(&mut settled);
                            return;
                        }
                    };
                    if close.is_normal() {
                        inner.enter(ConnectionState::Disconnected);
                        inner.notifier.show_error("Terminal connection lost", "");
                        return;
                    }
                    info!(
                        target: "podshell.session",
                        code = close.code,
                        "connection lost, trying to reconnect"
                    );
                }
                Some(Err(err)) => {
                    if inner.cancel.is_cancelled() {
                        inner.exit_cancelled(&mut settled);
                        return;
                    }
                    info!(target: "podshell.session", error = %err, "attach attempt failed");
                }
            }

            let decision = reconnect::next_attempt(tries, ever_connected);
            if !decision.should_retry {
                inner.notifier.spinner_stop();
                inner.notifier.show_error(
                    "Could not connect to terminal",
                    &Error::RetryBudgetExhausted(tries).to_string(),
                );
                inner.enter(ConnectionState::Disconnected);
                Self::settle(&mut settled, OpenOutcome::Failed);
                return;
            }

            inner.enter(ConnectionState::Connecting);
            if decision.delay > Duration::ZERO {
                // never yet connected in this cycle; the pod is likely
                // still starting
                info!(
                    target: "podshell.session",
                    delay_secs = decision.delay.as_secs(),
                    "pod not yet ready, reconnecting after delay"
                );
                inner.notifier.spinner_start("Connecting to Pod");
                tokio::select! {
                    _ = time::sleep(decision.delay) => {}
                    _ = inner.cancel.cancelled() => {
                        inner.exit_cancelled(&mut settled);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_permitted() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
    }

    #[test]
    fn recovery_transitions_are_permitted() {
        use ConnectionState::*;
        assert!(Connected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connecting));
        for state in [Disconnected, Creating, Fetching, Connecting, Connected] {
            assert!(state.can_transition_to(Disconnected), "{state:?}");
        }
    }

    #[test]
    fn skipping_legs_is_rejected() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Creating.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Creating));
        assert!(!Connected.can_transition_to(Fetching));
        assert!(!Fetching.can_transition_to(Connected));
    }
}
