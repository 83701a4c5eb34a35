//! Error taxonomy of the attach session lifecycle.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures the session machinery can run into.
///
/// Only [`Error::ServerRejection`] ever escapes the coordinator: a failed
/// create or fetch call rejects `open()` directly because no attach attempt
/// was made yet. Every other category is absorbed into a state transition
/// plus a user-visible notification.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The terminal resource owner rejected a create/fetch/delete/heartbeat
    /// call.
    #[error("terminal resource request failed: {0}")]
    ServerRejection(String),

    /// A socket failed or timed out before it was of any use.
    #[error("failed to open connection: {0}")]
    TransportOpen(String),

    /// The pod reached Failed/Succeeded or was deleted before readiness.
    #[error("pod reached a terminal state: {0}")]
    PodTerminal(String),

    /// The readiness wait elapsed without the container becoming ready.
    #[error("timed out after {0}s waiting for the pod to become ready")]
    PodWaitTimeout(u64),

    /// Every attach attempt in the connect cycle failed.
    #[error("could not connect after {0} attempts")]
    RetryBudgetExhausted(u32),
}
