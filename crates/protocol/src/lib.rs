//! Wire types for the pod terminal attach protocol.
//!
//! This crate contains the serde-serializable types and encodings used on
//! the wire between a terminal client and the cluster: the multiplexed
//! attach framing, the pod-watch event subset the readiness watcher
//! consumes, and the WebSocket handshake material (endpoint URIs and the
//! bearer-token subprotocol entry).
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * 1:1 with protocol: Match the remote-command attach and watch formats
//! * Stable: Changes only when the wire protocol changes
//!
//! The session state machine is built on top of these types in
//! `podshell-core`.

pub mod frame;
pub mod handshake;
pub mod pod;

pub use frame::*;
pub use handshake::*;
pub use pod::*;
