//! Resilient interactive terminal attach sessions for cluster pods.
//!
//! This crate drives the full lifecycle of a remote shell into a container:
//! it creates the server-side terminal resource, fetches short-lived attach
//! credentials, waits for the target container to become runnable, opens
//! the multiplexed attach socket, keeps the resource alive with heartbeats,
//! and reconnects within a bounded retry budget when the transport drops.
//!
//! The state machine lives in [`session::SessionCoordinator`]. Everything
//! it touches is behind a capability trait — [`transport::SocketConnector`]
//! for sockets, [`resource::TerminalResourceClient`] for the REST surface,
//! [`ui::Notifier`] for user-visible notifications — so the whole lifecycle
//! can be exercised in tests with the fakes in [`testing`].

pub mod attach;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod resource;
pub mod session;
pub mod testing;
pub mod transport;
pub mod ui;
pub mod watcher;

pub use attach::{AttachChannel, AttachIo, OutputChunk};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use reconnect::{MAX_TRIES, RETRY_TIMEOUT_SECONDS, ReconnectDecision, next_attempt};
pub use resource::{
    ContainerSpec, CreateTerminalRequest, CreatedTerminal, HostCluster, HostClusterInfo,
    HostPreferences, HttpResourceClient, PodAddress, TerminalCoordinate, TerminalCredentials,
    TerminalMetadata, TerminalResourceClient,
};
pub use session::{ConnectionState, OpenOutcome, SessionCoordinator, SessionSpec};
pub use transport::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, SocketClose, SocketConnector, SocketEvent,
    SocketHandle, SocketRequest, SocketSink, WebSocketConnector,
};
pub use ui::{Notifier, NullNotifier};
pub use watcher::{ContainerObservation, PodReadinessWatcher};
