//! Pod readiness watch.
//!
//! Opens a watch stream filtered to exactly one named pod and resolves the
//! first time the pod is Running with the terminal container ready. Every
//! event also feeds an observer with the latest extracted host and
//! container facts, which the coordinator keeps for diagnostics.

use std::sync::Arc;
use std::time::Duration;

use podshell_protocol as protocol;
use podshell_protocol::{ContainerStatus, Pod, PodPhase, WatchEvent, WatchEventKind};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resource::HostCluster;
use crate::transport::{SocketConnector, SocketEvent, SocketHandle, SocketRequest, SocketSink};

/// Connect budget of the watch socket, independent of the readiness
/// timeout supplied to [`PodReadinessWatcher::wait`].
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest host/container facts extracted from the watch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerObservation {
    pub node: Option<String>,
    pub host_pid: bool,
    pub host_network: bool,
    pub image: Option<String>,
    pub privileged: bool,
    /// `Container is <state>[: <reason>]`, from whichever of
    /// waiting/running/terminated is present.
    pub status_text: Option<String>,
    pub phase: Option<PodPhase>,
}

/// Callback invoked with the observation extracted from every event.
pub type PodObserver = Arc<dyn Fn(&ContainerObservation) + Send + Sync>;

/// Watches exactly one named pod until its terminal container is ready.
pub struct PodReadinessWatcher {
    connector: Arc<dyn SocketConnector>,
    host: HostCluster,
    observer: Option<PodObserver>,
}

impl PodReadinessWatcher {
    pub fn new(connector: Arc<dyn SocketConnector>, host: HostCluster) -> Self {
        Self {
            connector,
            host,
            observer: None,
        }
    }

    /// Registers an observer for the per-event extraction.
    pub fn with_observer(mut self, observer: PodObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Resolves once the pod is Running and the terminal container reports
    /// ready; rejects on terminal pod states, deletion, transport failure,
    /// or after `timeout`. The watch socket is closed on every exit path.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let url = protocol::watch_uri(
            &self.host.kube_api_server,
            &self.host.namespace,
            &self.host.pod.name,
        )
        .map_err(|e| Error::TransportOpen(format!("invalid watch endpoint: {e}")))?;
        let request = SocketRequest {
            url: url.to_string(),
            subprotocols: protocol::watch_subprotocols(&self.host.token),
        };

        let handle = match time::timeout(CONNECT_TIMEOUT, self.connector.connect(request)).await {
            Ok(connected) => connected?,
            Err(_) => {
                return Err(Error::TransportOpen(format!(
                    "could not connect within {} seconds",
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        };
        // closes the socket on resolve, reject, and when this future is
        // dropped mid-wait
        let _guard = CloseGuard(Arc::clone(&handle.sink));

        match time::timeout(timeout, self.drive(handle)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::PodWaitTimeout(timeout.as_secs())),
        }
    }

    async fn drive(&self, mut handle: SocketHandle) -> Result<()> {
        let container_name = self.host.pod.container.as_str();
        while let Some(event) = handle.events.recv().await {
            let message = match event {
                SocketEvent::Message(message) => message,
                SocketEvent::Closed(close) => {
                    return Err(Error::TransportOpen(format!(
                        "watch connection closed before the pod became ready (code {})",
                        close.code
                    )));
                }
            };

            let event: WatchEvent = match serde_json::from_slice(&message) {
                Ok(event) => event,
                Err(err) => {
                    warn!(target: "podshell.watch", error = %err, "could not parse watch message");
                    continue;
                }
            };

            let pod = &event.object;
            let status = pod.container_status(container_name);
            if let Some(observer) = &self.observer {
                observer(&observe(pod, container_name, status));
            }

            let phase = pod.status.phase;
            // terminal phase wins even when the same event reports ready
            if let Some(phase) = phase.filter(|p| p.is_terminal()) {
                return Err(Error::PodTerminal(format!("pod is in phase {phase}")));
            }
            if event.kind == WatchEventKind::Deleted {
                return Err(Error::PodTerminal("pod deleted".to_string()));
            }

            let ready = status.map(|s| s.ready).unwrap_or(false);
            if phase == Some(PodPhase::Running) && ready {
                debug!(
                    target: "podshell.watch",
                    pod = %self.host.pod.name,
                    container = container_name,
                    "terminal container ready"
                );
                return Ok(());
            }
        }
        Err(Error::TransportOpen(
            "watch connection closed before the pod became ready".to_string(),
        ))
    }
}

struct CloseGuard(Arc<dyn SocketSink>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn observe(pod: &Pod, container_name: &str, status: Option<&ContainerStatus>) -> ContainerObservation {
    let container = pod.container(container_name);
    ContainerObservation {
        node: pod.spec.node_name.clone(),
        host_pid: pod.spec.host_pid,
        host_network: pod.spec.host_network,
        image: container.and_then(|c| c.image.clone()),
        privileged: container
            .and_then(|c| c.security_context.as_ref())
            .and_then(|sc| sc.privileged)
            .unwrap_or(false),
        status_text: status.and_then(container_state_text),
        phase: pod.status.phase,
    }
}

fn container_state_text(status: &ContainerStatus) -> Option<String> {
    let state = status.state.as_ref()?;
    let (name, detail) = if let Some(waiting) = &state.waiting {
        ("waiting", waiting)
    } else if let Some(running) = &state.running {
        ("running", running)
    } else if let Some(terminated) = &state.terminated {
        ("terminated", terminated)
    } else {
        return None;
    };

    Some(match &detail.reason {
        Some(reason) => format!("Container is {name}: {reason}"),
        None => format!("Container is {name}"),
    })
}
