//! Error types for graph-audio.
//!
//! Errors are split into two categories:
//! - **Engine errors** ([`EngineError`]): request-thread operations that
//!   failed; engine state is unchanged unless noted.
//! - **Driver errors** ([`DriverError`]): backend open/start/IO failures
//!   surfaced by the driver wrapper.
//!
//! Nothing on the realtime cycle path returns an error: failures there
//! are recorded in timing records and surfaced as notifications.

use std::io;

use crate::graph::PortId;

/// Failures of request-thread engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The client name collides with a live client.
    ///
    /// Only returned under exact-name registration; otherwise the engine
    /// proposes a suffixed name instead.
    #[error("client name not unique: {name}")]
    NameNotUnique {
        /// The colliding name.
        name: String,
    },

    /// The name cannot take a uniquifying suffix, or 99 of them exist.
    #[error("client name cannot be made unique: {name}")]
    NameTooLong {
        /// The offending name.
        name: String,
    },

    /// The client speaks a different protocol revision.
    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        /// Version presented by the client.
        client: u32,
        /// Version this server speaks.
        server: u32,
    },

    /// A refnum that does not name a live client.
    #[error("no such client: refnum {refnum}")]
    NoSuchClient {
        /// The offending refnum.
        refnum: usize,
    },

    /// The client table is full.
    #[error("no free client slot")]
    NoFreeSlot,

    /// The realtime thread did not signal within the open timeout.
    #[error("driver is not running")]
    DriverNotRunning,

    /// A wait on the realtime cycle expired.
    #[error("timed out waiting for cycle confirmation: refnum {refnum}")]
    CycleWaitTimeout {
        /// The client being waited for.
        refnum: usize,
    },

    /// A port id that does not name a registered port.
    #[error("invalid port: {port}")]
    InvalidPort {
        /// The offending id.
        port: PortId,
    },

    /// A port name that does not resolve.
    #[error("unknown port: {name}")]
    UnknownPort {
        /// The name that was looked up.
        name: String,
    },

    /// A port name that is already taken.
    #[error("port name already exists: {name}")]
    PortNameExists {
        /// The colliding name.
        name: String,
    },

    /// A port name over the length cap.
    #[error("port name too long: {name}")]
    PortNameTooLong {
        /// The offending name.
        name: String,
    },

    /// The port table is full.
    #[error("port table full")]
    PortTableFull,

    /// The client is at its port cap.
    #[error("port cap reached for refnum {refnum}")]
    PortCapReached {
        /// The owning client.
        refnum: usize,
    },

    /// The port is at its connection cap.
    #[error("connection cap reached on {port}")]
    ConnectionCapReached {
        /// The saturated port.
        port: PortId,
    },

    /// The caller does not own the port.
    #[error("{port} is not owned by refnum {refnum}")]
    NotPortOwner {
        /// The port in question.
        port: PortId,
        /// The caller.
        refnum: usize,
    },

    /// Source and destination carry different payload types.
    #[error("port type mismatch: {src} -> {dst}")]
    TypeMismatch {
        /// Source port.
        src: PortId,
        /// Destination port.
        dst: PortId,
    },

    /// The pair is not output-to-input.
    #[error("port direction mismatch: {src} -> {dst}")]
    DirectionMismatch {
        /// Source port.
        src: PortId,
        /// Destination port.
        dst: PortId,
    },

    /// The port's owner has not activated it yet.
    #[error("port is not active: {port}")]
    InactivePort {
        /// The inactive port.
        port: PortId,
    },

    /// A connect endpoint belongs to a deactivated client.
    #[error("cannot connect ports owned by inactive client: {name}")]
    InactiveClient {
        /// Name of the inactive owner.
        name: String,
    },

    /// The pair is already connected.
    #[error("ports already connected: {src} -> {dst}")]
    DuplicateConnection {
        /// Source port.
        src: PortId,
        /// Destination port.
        dst: PortId,
    },

    /// The pair is not connected.
    #[error("ports not connected: {src} -> {dst}")]
    NoSuchConnection {
        /// Source port.
        src: PortId,
        /// Destination port.
        dst: PortId,
    },

    /// The self-connect policy rejected the request.
    #[error("self connect rejected by policy: {src} -> {dst}")]
    SelfConnectRejected {
        /// Source port.
        src: PortId,
        /// Destination port.
        dst: PortId,
    },

    /// A synchronous notification delivery failed.
    #[error("notification failed for client {name}")]
    NotificationFailed {
        /// The client that rejected the notification.
        name: String,
    },
}

/// Failures surfaced by driver backends and the driver wrapper.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The backend could not open or start.
    #[error("backend error: {reason}")]
    Backend {
        /// Description of what went wrong.
        reason: String,
    },

    /// Socket or file I/O failed.
    #[error("driver io error: {0}")]
    Io(#[from] io::Error),

    /// A received packet could not be decoded.
    #[error("malformed packet: {reason}")]
    BadPacket {
        /// Why decoding failed.
        reason: String,
    },

    /// An engine operation performed on behalf of the driver failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl DriverError {
    /// Creates a backend error with the given message.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}
