//! # graph-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! A low-latency audio server engine: one process owns the audio
//! devices, clients register named ports, connect them into a graph,
//! and are woken once per audio period to read and write shared
//! buffers.
//!
//! `graph-audio` provides the server core: the client/port/connection
//! graph, per-cycle scheduling with xrun detection, notification
//! fan-out, timer-based and UDP drivers, and clock-domain adapters that
//! resample between a device clock and an independent consumer clock.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graph_audio::{Server, ServerConfig};
//! use graph_audio::driver::{dummy, DriverParam, ParamValue};
//!
//! // A timer-paced server: 2 in, 2 out, 48kHz, 1024-frame periods.
//! let driver = dummy::initialize(&[
//!     DriverParam::set('r', ParamValue::UInt(48000)),
//!     DriverParam::set('p', ParamValue::UInt(1024)),
//! ])?;
//! let server = Server::start(ServerConfig::default(), driver)?;
//!
//! // Clients open against the engine, register ports, connect them...
//! let engine = server.engine().clone();
//!
//! // ...and the embedder's main loop decides when to leave.
//! # drop(engine);
//! server.stop()?;
//! # Ok::<(), graph_audio::DriverError>(())
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Cycle thread**: one realtime loop per driver. It waits for the
//!   device, walks the published graph in topological order, and never
//!   takes the engine mutex.
//! - **Request thread(s)**: client lifecycle and graph mutations,
//!   serialized by the engine mutex, editing a *next* graph that the
//!   cycle adopts at a boundary.
//! - **Adapter threads**: one per clock-domain bridge, moving samples
//!   through lock-free ring pipes with PI-controlled resampling.
//!
//! This design ensures a slow client or a burst of graph edits can
//! never stall the device: the cycle always runs against a consistent
//! published graph, and late clients surface as xrun notifications
//! instead of blocking.

// Audio code requires intentional numeric casts between sample formats;
// the allowances live in Cargo.toml lints.
#![warn(missing_docs)]

mod config;
mod error;
mod event;
mod server;

pub mod adapter;
pub mod driver;
pub mod engine;
pub mod graph;

pub use adapter::{
    AdapterConfig, AdapterHost, AudioAdapter, PiController, Quality, Resampler, RingPipe,
    RingSize, MAX_RING_FRAMES,
};
pub use config::{ClockSource, SelfConnectMode, ServerConfig};
pub use engine::client::{
    ClientControl, ClientInterface, ClientKind, TriggerOutcome, CLIENT_MAX, CLIENT_NAME_MAX,
    PROTOCOL_VERSION,
};
pub use engine::control::EngineControl;
pub use engine::{Engine, ExternalOpenResult};
pub use error::{DriverError, EngineError};
pub use event::{CallbackMask, Notification, NotificationKind};
pub use graph::{
    ClientStatus, GraphManager, LatencyRange, PortBuffer, PortDirection, PortFlags, PortId,
    PortInfo, PortType,
};
pub use server::{Server, ShutdownReason};
