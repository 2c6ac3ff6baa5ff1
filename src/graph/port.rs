//! Ports: named, typed, directional connection endpoints.

use std::sync::Arc;

use parking_lot::Mutex;

/// Per-client cap on registered ports.
pub const PORT_CAP_PER_CLIENT: usize = 128;
/// Per-port cap on simultaneous connections.
pub const CONNECTION_CAP_PER_PORT: usize = 64;
/// Longest accepted `client:port` name, in bytes.
pub const PORT_NAME_MAX: usize = 256;

/// Stable identifier of a registered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(
    /// Index into the server's port table.
    pub u32,
);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Payload type carried by a port. Connections require equal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortType {
    /// 32-bit float samples, one buffer per period.
    #[default]
    Audio,
    /// MIDI data, carried as an opaque period-sized region.
    Midi,
    /// Application-defined payload, never interpreted by the server.
    Opaque,
}

/// Data direction relative to the owning client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    /// The client reads from this port; it terminates connections.
    Input,
    /// The client writes to this port; it originates connections.
    Output,
}

/// Static port properties beyond type and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFlags {
    /// Corresponds to a physical device channel.
    pub physical: bool,
    /// End of a signal chain (a device, not a pass-through).
    pub terminal: bool,
}

/// Min/max latency through this port, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyRange {
    /// Best-case latency.
    pub min: u32,
    /// Worst-case latency.
    pub max: u32,
}

impl LatencyRange {
    /// A degenerate range where min and max agree.
    pub fn constant(frames: u32) -> Self {
        Self {
            min: frames,
            max: frames,
        }
    }
}

/// The shared, period-sized sample region behind a port.
///
/// By contract the buffer is written only by the owning client during
/// its slot in the cycle, so the lock is never contended on the
/// realtime path; it exists to keep mixing and driver I/O safe when
/// that contract is broken by a misbehaving client.
#[derive(Clone)]
pub struct PortBuffer {
    data: Arc<Mutex<Vec<f32>>>,
}

impl PortBuffer {
    pub fn new(frames: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0.0; frames])),
        }
    }

    /// Runs `f` over the buffer contents.
    pub fn with<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Replaces the contents with silence.
    pub fn silence(&self) {
        self.data.lock().fill(0.0);
    }

    /// Resizes the region for a new period length. Non-realtime.
    pub fn resize(&self, frames: usize) {
        let mut data = self.data.lock();
        data.clear();
        data.resize(frames, 0.0);
    }

    /// Current buffer length in frames.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PortBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortBuffer").field("len", &self.len()).finish()
    }
}

/// A registered port. Lives in the graph manager's table from
/// registration until release; the buffer lives as long as the entry.
#[derive(Debug)]
pub(crate) struct Port {
    pub id: PortId,
    pub owner: usize,
    pub name: String,
    pub port_type: PortType,
    pub direction: PortDirection,
    pub flags: PortFlags,
    /// Flipped by client activation; only active ports participate in
    /// the evaluation order.
    pub active: bool,
    pub latency: LatencyRange,
    pub buffer: PortBuffer,
}

/// A snapshot of port metadata handed out by queries.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// The port's id.
    pub id: PortId,
    /// Owning client refnum.
    pub owner: usize,
    /// Full `client:port` name.
    pub name: String,
    /// Payload type.
    pub port_type: PortType,
    /// Data direction.
    pub direction: PortDirection,
    /// Static properties.
    pub flags: PortFlags,
    /// Whether the port participates in the graph.
    pub active: bool,
    /// Reported latency range.
    pub latency: LatencyRange,
}

impl Port {
    pub fn info(&self) -> PortInfo {
        PortInfo {
            id: self.id,
            owner: self.owner,
            name: self.name.clone(),
            port_type: self.port_type,
            direction: self.direction,
            flags: self.flags,
            active: self.active,
            latency: self.latency,
        }
    }
}
