//! Driver contract and the wrapper that adapts a backend to the
//! engine's cycle.
//!
//! A [`Backend`] supplies the device-facing primitives: per-cycle
//! `read` and `write`, plus lifecycle hooks. The [`AudioDriver`]
//! wrapper owns the backend's client slot, registers its physical
//! ports, and runs the read → engine process → write sequence; the
//! [`ThreadedDriver`] puts that sequence on a dedicated cycle thread
//! with a cancelable stop flag.
//!
//! Backends describe their tunables through a [`DriverDescriptor`]: a
//! list of single-character-tagged, typed parameters. Values parsed
//! from a command line flow in as overrides to each backend's
//! `initialize` function.

pub mod dummy;
pub mod net;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::engine::client::{ClientInterface, ClientKind};
use crate::engine::Engine;
use crate::error::{DriverError, EngineError};
use crate::event::Notification;
use crate::graph::{LatencyRange, PortBuffer, PortDirection, PortFlags, PortId, PortType};

/// A typed driver parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Signed integer.
    Int(i32),
    /// Unsigned integer.
    UInt(u32),
    /// Single character.
    Char(char),
    /// Free-form string.
    Str(String),
    /// Flag.
    Bool(bool),
}

impl ParamValue {
    /// Numeric view, for parameters that accept either integer type.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::UInt(v) => Some(v),
            Self::Int(v) if v >= 0 => Some(v as u32),
            _ => None,
        }
    }

    /// Boolean view; integers count as set when nonzero.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            Self::Int(v) => Some(v != 0),
            _ => None,
        }
    }

    /// Character view.
    pub fn as_char(&self) -> Option<char> {
        match *self {
            Self::Char(v) => Some(v),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// One parameter of a driver descriptor: a single-character option tag,
/// a long name, and a typed default.
#[derive(Debug, Clone)]
pub struct DriverParam {
    /// Long parameter name.
    pub name: String,
    /// Single-character option tag.
    pub character: char,
    /// Default or supplied value.
    pub value: ParamValue,
    /// Help text.
    pub description: String,
}

impl DriverParam {
    /// A fully-described descriptor entry.
    pub fn new(
        name: &str,
        character: char,
        value: ParamValue,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            character,
            value,
            description: description.to_string(),
        }
    }

    /// A bare override, as produced by command-line parsing.
    pub fn set(character: char, value: ParamValue) -> Self {
        Self {
            name: String::new(),
            character,
            value,
            description: String::new(),
        }
    }
}

/// What a backend advertises: a name, a description, and its parameters.
#[derive(Debug, Clone)]
pub struct DriverDescriptor {
    /// Backend name, as selected on a command line.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Tunable parameters with their defaults.
    pub params: Vec<DriverParam>,
}

impl DriverDescriptor {
    /// Resolves one parameter: the last override wins, then the
    /// descriptor default.
    pub fn resolve(&self, overrides: &[DriverParam], character: char) -> Option<ParamValue> {
        overrides
            .iter()
            .rev()
            .find(|param| param.character == character)
            .or_else(|| {
                self.params
                    .iter()
                    .find(|param| param.character == character)
            })
            .map(|param| param.value.clone())
    }
}

/// The open-time shape of a driver, mirroring the backend contract.
#[derive(Debug, Clone)]
pub struct OpenParams {
    /// Frames per period.
    pub buffer_size: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Whether capture ports are created.
    pub capturing: bool,
    /// Whether playback ports are created.
    pub playing: bool,
    /// Capture channel count.
    pub in_channels: usize,
    /// Playback channel count.
    pub out_channels: usize,
    /// Whether monitor ports mirror the playback channels.
    pub monitor: bool,
    /// Device name behind the capture ports, for logs and aliases.
    pub capture_name: String,
    /// Device name behind the playback ports.
    pub playback_name: String,
    /// Extra reported capture latency, in frames.
    pub capture_latency: u32,
    /// Extra reported playback latency, in frames.
    pub playback_latency: u32,
}

/// What a backend sees of the server: its client slot, its ports, and
/// the resolved buffer handles for the realtime path.
pub struct DriverContext {
    /// The engine this driver feeds.
    pub engine: Arc<Engine>,
    /// The driver's client slot.
    pub refnum: usize,
    /// Audio capture ports, channel order.
    pub capture_ports: Vec<PortId>,
    /// Audio playback ports, channel order.
    pub playback_ports: Vec<PortId>,
    /// Buffers behind the capture ports.
    pub capture_buffers: Vec<PortBuffer>,
    /// Buffers behind the playback ports.
    pub playback_buffers: Vec<PortBuffer>,
}

/// Device-facing primitives the wrapper drives once per cycle.
pub trait Backend: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Registers backend-specific ports beyond the audio channels the
    /// wrapper already made (for example MIDI ports).
    fn attach(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        let _ = ctx;
        Ok(())
    }

    /// Brings the device up.
    fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Takes the device down. Must cancel any blocking wait.
    fn stop(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Waits for the device interrupt and fills the capture buffers.
    fn read(&mut self, ctx: &DriverContext) -> Result<(), DriverError>;

    /// Hands the playback buffers back to the device.
    fn write(&mut self, ctx: &DriverContext) -> Result<(), DriverError>;

    /// Propagates a new period length into device state.
    fn set_buffer_size(&mut self, frames: u32) -> Result<(), DriverError> {
        let _ = frames;
        Ok(())
    }
}

/// A backend plus its resolved open parameters, ready for
/// [`Server::start`](crate::Server::start).
pub struct ConfiguredDriver {
    /// The device-facing implementation.
    pub backend: Box<dyn Backend>,
    /// The shape it was configured to open with.
    pub open: OpenParams,
}

impl std::fmt::Debug for ConfiguredDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredDriver")
            .field("backend", &self.backend.name())
            .field("open", &self.open)
            .finish()
    }
}

/// The driver's entry in the client table: drivers subscribe to nothing
/// and are never triggered by the walk they initiate.
struct DriverClient;

impl ClientInterface for DriverClient {
    fn notify(&self, _notification: &Notification) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Adapts a [`Backend`] to the engine cycle: owns the driver refnum,
/// the physical ports, and the per-cycle sequence.
pub struct AudioDriver {
    engine: Arc<Engine>,
    backend: Box<dyn Backend>,
    open: OpenParams,
    ctx: DriverContext,
    monitor_buffers: Vec<PortBuffer>,
    prev_cycle_end_us: u64,
}

impl AudioDriver {
    /// Allocates the driver's client slot. Ports come with
    /// [`attach`](Self::attach).
    pub fn open(
        engine: Arc<Engine>,
        backend: Box<dyn Backend>,
        open: OpenParams,
    ) -> Result<Self, DriverError> {
        tracing::info!(
            backend = backend.name(),
            period = open.buffer_size,
            rate = open.sample_rate,
            "opening driver"
        );
        let refnum = engine.client_internal_open(
            "system",
            ClientKind::Driver,
            Arc::new(DriverClient),
            false,
        )?;
        Ok(Self {
            ctx: DriverContext {
                engine: Arc::clone(&engine),
                refnum,
                capture_ports: Vec::new(),
                playback_ports: Vec::new(),
                capture_buffers: Vec::new(),
                playback_buffers: Vec::new(),
            },
            engine,
            backend,
            open,
            monitor_buffers: Vec::new(),
            prev_cycle_end_us: 0,
        })
    }

    /// The engine this driver feeds.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The driver's refnum in the client table.
    pub fn refnum(&self) -> usize {
        self.ctx.refnum
    }

    fn register_port(
        &self,
        name: &str,
        direction: PortDirection,
        latency: u32,
    ) -> Result<PortId, EngineError> {
        self.engine.port_register(
            self.ctx.refnum,
            name,
            PortType::Audio,
            direction,
            PortFlags {
                physical: true,
                terminal: true,
            },
            LatencyRange::constant(latency),
        )
    }

    /// Registers the physical/terminal audio ports, activates the
    /// driver client, and lets the backend add its own ports.
    pub fn attach(&mut self) -> Result<(), DriverError> {
        let period = self.open.buffer_size;
        if self.open.capturing {
            for channel in 1..=self.open.in_channels {
                let id = self.register_port(
                    &format!("system:capture_{channel}"),
                    // Capture feeds the graph, so the port is an output.
                    PortDirection::Output,
                    period + self.open.capture_latency,
                )?;
                self.ctx.capture_ports.push(id);
            }
        }
        if self.open.playing {
            for channel in 1..=self.open.out_channels {
                let id = self.register_port(
                    &format!("system:playback_{channel}"),
                    PortDirection::Input,
                    period + self.open.playback_latency,
                )?;
                self.ctx.playback_ports.push(id);
            }
            if self.open.monitor {
                for channel in 1..=self.open.out_channels {
                    let id = self.register_port(
                        &format!("system:monitor_{channel}"),
                        PortDirection::Output,
                        0,
                    )?;
                    self.monitor_buffers.extend(
                        self.engine.graph().port_buffer(id),
                    );
                }
            }
        }

        self.engine.client_activate(self.ctx.refnum, true)?;
        self.backend.attach(&self.ctx)?;

        let graph = self.engine.graph();
        self.ctx.capture_buffers = self
            .ctx
            .capture_ports
            .iter()
            .filter_map(|&id| graph.port_buffer(id))
            .collect();
        self.ctx.playback_buffers = self
            .ctx
            .playback_ports
            .iter()
            .filter_map(|&id| graph.port_buffer(id))
            .collect();
        Ok(())
    }

    /// Brings the backend up.
    pub fn start(&mut self) -> Result<(), DriverError> {
        self.backend.start()
    }

    /// Takes the backend down.
    pub fn stop(&mut self) -> Result<(), DriverError> {
        self.backend.stop()
    }

    /// One cycle: device read, engine process, monitor mirror, device
    /// write.
    pub fn process(&mut self) -> Result<(), DriverError> {
        let begin_us = self.engine.control().now_us();
        self.backend.read(&self.ctx)?;
        self.engine.process(begin_us, self.prev_cycle_end_us);

        if self.open.monitor {
            for (playback, monitor) in self
                .ctx
                .playback_buffers
                .iter()
                .zip(&self.monitor_buffers)
            {
                playback.with(|src| {
                    monitor.with(|dst| {
                        let frames = src.len().min(dst.len());
                        dst[..frames].copy_from_slice(&src[..frames]);
                    });
                });
            }
        }

        self.backend.write(&self.ctx)?;
        self.prev_cycle_end_us = self.engine.control().now_us();
        Ok(())
    }

    /// Propagates a new period length to the backend, the engine, and
    /// every client.
    pub fn set_buffer_size(&mut self, frames: u32) -> Result<(), DriverError> {
        self.backend.set_buffer_size(frames)?;
        self.engine.set_buffer_size(frames);
        Ok(())
    }

    /// Propagates a new sample rate to the engine and every client.
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), DriverError> {
        self.engine.set_sample_rate(rate);
        Ok(())
    }
}

/// Runs an [`AudioDriver`] on a dedicated cycle thread.
pub struct ThreadedDriver {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<AudioDriver>,
}

impl ThreadedDriver {
    /// Starts the backend and spawns the cycle thread.
    pub fn start(mut driver: AudioDriver) -> Result<Self, DriverError> {
        driver.start()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("graph-audio-cycle".to_string())
            .spawn(move || {
                tracing::info!("cycle thread running");
                while !flag.load(Ordering::Relaxed) {
                    if let Err(err) = driver.process() {
                        tracing::error!(%err, "cycle failed");
                        driver.engine().notify_failure(-1, &err.to_string());
                        break;
                    }
                }
                if let Err(err) = driver.stop() {
                    tracing::error!(%err, "backend stop failed");
                }
                driver
            })
            .map_err(|err| DriverError::backend(format!("cannot spawn cycle thread: {err}")))?;
        Ok(Self { stop, handle })
    }

    /// Cancels the cycle loop and joins the thread, returning the
    /// driver for teardown or restart.
    pub fn stop(self) -> Result<AudioDriver, DriverError> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle
            .join()
            .map_err(|_| DriverError::backend("cycle thread panicked"))
    }
}
