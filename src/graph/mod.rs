//! The port/connection graph and its double-buffered evaluation order.
//!
//! All mutation happens on a master copy owned by the request thread
//! (under the engine mutex): port registration, activation, connect and
//! disconnect each edit the tables and stage a freshly resolved order
//! snapshot. The realtime thread adopts the staged snapshot at the next
//! cycle boundary ([`run_next_graph`]) and walks the adopted one
//! ([`run_current_graph`]); it never reads the mutable tables, so
//! mutation can never stall a cycle.
//!
//! [`run_next_graph`]: GraphManager::run_next_graph
//! [`run_current_graph`]: GraphManager::run_current_graph

mod port;
mod state;

pub use port::{
    LatencyRange, PortBuffer, PortDirection, PortFlags, PortId, PortInfo, PortType,
    CONNECTION_CAP_PER_PORT, PORT_CAP_PER_CLIENT, PORT_NAME_MAX,
};
pub use state::{ClientStatus, ClientTiming};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::engine::client::{TriggerOutcome, CLIENT_MAX};
use crate::error::EngineError;
use port::Port;
use state::{GraphOrder, InputFeed, ScheduledClient};

/// Drives client activation during the graph walk. Implemented by the
/// engine, which owns the client table and the per-client synchros.
pub(crate) trait ClientActivator {
    /// Microseconds on the engine's monotonic clock.
    fn now_us(&self) -> u64;
    /// Wakes `refnum` for this cycle.
    fn trigger(&self, refnum: usize, frames: u32) -> TriggerOutcome;
    /// Waits for `refnum` to mark itself finished. False on timeout.
    fn wait_finished(&self, refnum: usize, timeout: Duration) -> bool;
}

/// Mutable side of the graph: the port table and connection list.
struct GraphInner {
    /// Slot index is the `PortId`.
    ports: Vec<Option<Port>>,
    /// Directed pairs, source output port to destination input port.
    connections: Vec<(PortId, PortId)>,
    /// Ports per owning refnum, registration order.
    client_ports: Vec<Vec<PortId>>,
    /// Activation state per refnum; drives order membership.
    active_clients: [bool; CLIENT_MAX],
    /// Current period length, the size of every port buffer.
    buffer_size: usize,
    /// Bumped on every staged snapshot.
    version: u64,
}

/// Stores ports, buffers and connections, and publishes a consistent
/// evaluation order to the realtime cycle.
pub struct GraphManager {
    inner: Mutex<GraphInner>,
    /// Snapshot waiting for adoption at the next cycle boundary.
    staged: Mutex<Option<Arc<GraphOrder>>>,
    /// Snapshot the realtime walk reads. Written only from the
    /// realtime path at a cycle boundary.
    current: RwLock<Arc<GraphOrder>>,
    timing: Vec<ClientTiming>,
}

impl GraphManager {
    /// Creates a graph manager with room for `port_max` ports and
    /// `buffer_size`-frame port buffers.
    pub fn new(port_max: usize, buffer_size: usize) -> Self {
        Self {
            inner: Mutex::new(GraphInner {
                ports: (0..port_max).map(|_| None).collect(),
                connections: Vec::new(),
                client_ports: (0..CLIENT_MAX).map(|_| Vec::new()).collect(),
                active_clients: [false; CLIENT_MAX],
                buffer_size,
                version: 0,
            }),
            staged: Mutex::new(None),
            current: RwLock::new(Arc::new(GraphOrder::empty())),
            timing: (0..CLIENT_MAX).map(|_| ClientTiming::default()).collect(),
        }
    }

    // ---- request-side mutation ----

    /// Registers a port for `refnum` and stages the new topology.
    pub fn allocate_port(
        &self,
        refnum: usize,
        name: &str,
        port_type: PortType,
        direction: PortDirection,
        flags: PortFlags,
        latency: LatencyRange,
    ) -> Result<PortId, EngineError> {
        let mut inner = self.inner.lock();
        if refnum >= CLIENT_MAX {
            return Err(EngineError::NoSuchClient { refnum });
        }
        if name.len() > PORT_NAME_MAX {
            return Err(EngineError::PortNameTooLong {
                name: name.to_string(),
            });
        }
        if inner
            .ports
            .iter()
            .flatten()
            .any(|port| port.name == name)
        {
            return Err(EngineError::PortNameExists {
                name: name.to_string(),
            });
        }
        if inner.client_ports[refnum].len() >= PORT_CAP_PER_CLIENT {
            return Err(EngineError::PortCapReached { refnum });
        }
        let slot = inner
            .ports
            .iter()
            .position(Option::is_none)
            .ok_or(EngineError::PortTableFull)?;

        let id = PortId(slot as u32);
        let buffer = PortBuffer::new(inner.buffer_size);
        inner.ports[slot] = Some(Port {
            id,
            owner: refnum,
            name: name.to_string(),
            port_type,
            direction,
            flags,
            active: false,
            latency,
            buffer,
        });
        inner.client_ports[refnum].push(id);
        tracing::debug!(%id, name, refnum, "port registered");
        self.stage(&mut inner);
        Ok(id)
    }

    /// Releases a port owned by `refnum`, dropping its connections.
    pub fn release_port(&self, refnum: usize, id: PortId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let slot = id.0 as usize;
        match inner.ports.get(slot) {
            Some(Some(port)) if port.owner == refnum => {}
            Some(Some(_)) => return Err(EngineError::NotPortOwner { port: id, refnum }),
            _ => return Err(EngineError::InvalidPort { port: id }),
        }
        inner
            .connections
            .retain(|&(src, dst)| src != id && dst != id);
        inner.client_ports[refnum].retain(|&p| p != id);
        inner.ports[slot] = None;
        tracing::debug!(%id, refnum, "port released");
        self.stage(&mut inner);
        Ok(())
    }

    /// Marks a port eligible for the evaluation order.
    pub fn activate_port(&self, id: PortId) -> Result<(), EngineError> {
        self.set_port_active(id, true)
    }

    /// Removes a port from the evaluation order.
    pub fn deactivate_port(&self, id: PortId) -> Result<(), EngineError> {
        self.set_port_active(id, false)
    }

    fn set_port_active(&self, id: PortId, active: bool) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let port = inner
            .ports
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(EngineError::InvalidPort { port: id })?;
        port.active = active;
        self.stage(&mut inner);
        Ok(())
    }

    /// Validates a candidate pair without mutating anything.
    pub fn check_ports(&self, src: PortId, dst: PortId) -> Result<(), EngineError> {
        let inner = self.inner.lock();
        Self::check_ports_locked(&inner, src, dst)
    }

    fn check_ports_locked(inner: &GraphInner, src: PortId, dst: PortId) -> Result<(), EngineError> {
        if src == dst {
            return Err(EngineError::InvalidPort { port: src });
        }
        let src_port = inner
            .ports
            .get(src.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(EngineError::InvalidPort { port: src })?;
        let dst_port = inner
            .ports
            .get(dst.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(EngineError::InvalidPort { port: dst })?;

        if src_port.direction != PortDirection::Output || dst_port.direction != PortDirection::Input
        {
            return Err(EngineError::DirectionMismatch { src, dst });
        }
        if src_port.port_type != dst_port.port_type {
            return Err(EngineError::TypeMismatch { src, dst });
        }
        if !src_port.active {
            return Err(EngineError::InactivePort { port: src });
        }
        if !dst_port.active {
            return Err(EngineError::InactivePort { port: dst });
        }
        Ok(())
    }

    /// Connects an output port to an input port.
    pub fn connect(&self, src: PortId, dst: PortId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        Self::check_ports_locked(&inner, src, dst)?;
        if inner.connections.contains(&(src, dst)) {
            return Err(EngineError::DuplicateConnection { src, dst });
        }
        let src_count = inner
            .connections
            .iter()
            .filter(|&&(s, d)| s == src || d == src)
            .count();
        let dst_count = inner
            .connections
            .iter()
            .filter(|&&(s, d)| s == dst || d == dst)
            .count();
        if src_count >= CONNECTION_CAP_PER_PORT || dst_count >= CONNECTION_CAP_PER_PORT {
            return Err(EngineError::ConnectionCapReached {
                port: if src_count >= CONNECTION_CAP_PER_PORT {
                    src
                } else {
                    dst
                },
            });
        }
        inner.connections.push((src, dst));
        tracing::debug!(%src, %dst, "ports connected");
        self.stage(&mut inner);
        Ok(())
    }

    /// Removes one connection.
    pub fn disconnect(&self, src: PortId, dst: PortId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let before = inner.connections.len();
        inner.connections.retain(|&pair| pair != (src, dst));
        if inner.connections.len() == before {
            return Err(EngineError::NoSuchConnection { src, dst });
        }
        tracing::debug!(%src, %dst, "ports disconnected");
        self.stage(&mut inner);
        Ok(())
    }

    /// Clears the port list and timing record for a fresh refnum.
    pub fn init_refnum(&self, refnum: usize) {
        if refnum >= CLIENT_MAX {
            return;
        }
        let mut inner = self.inner.lock();
        inner.client_ports[refnum].clear();
        inner.active_clients[refnum] = false;
        drop(inner);
        self.timing[refnum].reset();
    }

    /// Drops every port owned by `refnum` along with their connections.
    pub fn remove_all_ports(&self, refnum: usize) {
        if refnum >= CLIENT_MAX {
            return;
        }
        let mut inner = self.inner.lock();
        let ports: Vec<PortId> = inner.client_ports[refnum].drain(..).collect();
        for id in &ports {
            inner
                .connections
                .retain(|&(src, dst)| src != *id && dst != *id);
            inner.ports[id.0 as usize] = None;
        }
        if !ports.is_empty() {
            tracing::debug!(refnum, count = ports.len(), "removed remaining ports");
        }
        self.stage(&mut inner);
    }

    /// Adds `refnum` to the evaluation order.
    pub fn activate_client(&self, refnum: usize) {
        if refnum >= CLIENT_MAX {
            return;
        }
        let mut inner = self.inner.lock();
        inner.active_clients[refnum] = true;
        self.stage(&mut inner);
    }

    /// Removes `refnum` from the evaluation order.
    pub fn deactivate_client(&self, refnum: usize) {
        if refnum >= CLIENT_MAX {
            return;
        }
        let mut inner = self.inner.lock();
        inner.active_clients[refnum] = false;
        self.stage(&mut inner);
    }

    /// Renames a port, returning the previous name.
    pub fn rename_port(&self, id: PortId, name: &str) -> Result<String, EngineError> {
        let mut inner = self.inner.lock();
        if inner.ports.iter().flatten().any(|port| port.name == name) {
            return Err(EngineError::PortNameExists {
                name: name.to_string(),
            });
        }
        let port = inner
            .ports
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(EngineError::InvalidPort { port: id })?;
        let old = std::mem::replace(&mut port.name, name.to_string());
        Ok(old)
    }

    /// Resizes every port buffer for a new period length. Non-realtime.
    pub fn set_buffer_size(&self, frames: usize) {
        let mut inner = self.inner.lock();
        inner.buffer_size = frames;
        for port in inner.ports.iter().flatten() {
            port.buffer.resize(frames);
        }
        self.stage(&mut inner);
    }

    // ---- queries ----

    /// Input ports of `refnum`, in registration order.
    pub fn get_input_ports(&self, refnum: usize) -> Vec<PortId> {
        self.ports_of(refnum, PortDirection::Input)
    }

    /// Output ports of `refnum`, in registration order.
    pub fn get_output_ports(&self, refnum: usize) -> Vec<PortId> {
        self.ports_of(refnum, PortDirection::Output)
    }

    fn ports_of(&self, refnum: usize, direction: PortDirection) -> Vec<PortId> {
        let inner = self.inner.lock();
        let Some(ports) = inner.client_ports.get(refnum) else {
            return Vec::new();
        };
        ports
            .iter()
            .filter(|id| {
                inner.ports[id.0 as usize]
                    .as_ref()
                    .is_some_and(|port| port.direction == direction)
            })
            .copied()
            .collect()
    }

    /// Every port connected to `id`, regardless of direction.
    pub fn get_connections(&self, id: PortId) -> Vec<PortId> {
        let inner = self.inner.lock();
        inner
            .connections
            .iter()
            .filter_map(|&(src, dst)| {
                if src == id {
                    Some(dst)
                } else if dst == id {
                    Some(src)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Resolves a port by its `client:port` name.
    pub fn get_port(&self, name: &str) -> Option<PortId> {
        let inner = self.inner.lock();
        inner
            .ports
            .iter()
            .flatten()
            .find(|port| port.name == name)
            .map(|port| port.id)
    }

    /// Metadata snapshot for one port.
    pub fn port_info(&self, id: PortId) -> Option<PortInfo> {
        let inner = self.inner.lock();
        inner
            .ports
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(Port::info)
    }

    /// The shared buffer behind one port.
    pub fn port_buffer(&self, id: PortId) -> Option<PortBuffer> {
        let inner = self.inner.lock();
        inner
            .ports
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(|port| port.buffer.clone())
    }

    /// Resolves a source/destination name pair in one lock.
    pub fn get_two_ports(&self, src: &str, dst: &str) -> Result<(PortId, PortId), EngineError> {
        let inner = self.inner.lock();
        let find = |name: &str| {
            inner
                .ports
                .iter()
                .flatten()
                .find(|port| port.name == name)
                .map(|port| port.id)
                .ok_or_else(|| EngineError::UnknownPort {
                    name: name.to_string(),
                })
        };
        Ok((find(src)?, find(dst)?))
    }

    /// The timing record for `refnum`.
    ///
    /// # Panics
    ///
    /// Panics when `refnum` is outside the client table.
    pub fn client_timing(&self, refnum: usize) -> &ClientTiming {
        &self.timing[refnum]
    }

    /// Version of the staged or current topology, for tests and logs.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Refnums in the currently adopted evaluation order.
    pub fn current_order(&self) -> Vec<usize> {
        self.current
            .read()
            .clients
            .iter()
            .map(|client| client.refnum)
            .collect()
    }

    // ---- realtime side ----

    /// Adopts the staged snapshot if there is one. Returns true when a
    /// switch actually occurred; the caller fans out the reorder
    /// notification. Never blocks.
    pub fn run_next_graph(&self) -> bool {
        let Some(mut staged) = self.staged.try_lock() else {
            // A mutator holds the slot right now; adopt next cycle.
            return false;
        };
        match staged.take() {
            Some(next) => {
                let version = next.version;
                *self.current.write() = next;
                tracing::debug!(version, "graph switched");
                true
            }
            None => false,
        }
    }

    /// True when every client of the adopted order completed (or never
    /// ran in) its last cycle.
    pub fn is_finished_graph(&self) -> bool {
        self.current.read().clients.iter().all(|client| {
            matches!(
                self.timing[client.refnum].status(),
                ClientStatus::NotTriggered | ClientStatus::Finished
            )
        })
    }

    /// Walks the adopted order: mixes each client's inputs, triggers
    /// it, and waits for its timing record to reach `Finished`.
    pub(crate) fn run_current_graph(
        &self,
        activator: &dyn ClientActivator,
        frames: u32,
        timeout: Duration,
    ) {
        let order = Arc::clone(&self.current.read());
        for client in &order.clients {
            let timing = &self.timing[client.refnum];

            for feed in &client.inputs {
                Self::mix_input(feed);
            }

            timing.mark_awake(activator.now_us());
            match activator.trigger(client.refnum, frames) {
                TriggerOutcome::Finished => timing.mark_finished(activator.now_us()),
                TriggerOutcome::Pending => {
                    if !activator.wait_finished(client.refnum, timeout) {
                        tracing::warn!(refnum = client.refnum, "client missed its cycle slot");
                        timing.set_status(ClientStatus::Timeout);
                    }
                }
                TriggerOutcome::Absent => timing.reset(),
            }
        }
    }

    /// Sums every connected source into the destination buffer, or
    /// silences it when nothing is connected.
    fn mix_input(feed: &InputFeed) {
        feed.dst.with(|dst| {
            dst.fill(0.0);
            for source in &feed.sources {
                source.with(|src| {
                    for (d, s) in dst.iter_mut().zip(src.iter()) {
                        *d += *s;
                    }
                });
            }
        });
    }

    /// Rebuilds the evaluation order from the tables and stages it,
    /// replacing any snapshot the realtime side has not adopted yet.
    fn stage(&self, inner: &mut GraphInner) {
        inner.version += 1;

        let edges: Vec<(usize, usize)> = inner
            .connections
            .iter()
            .filter_map(|&(src, dst)| {
                let src_port = inner.ports[src.0 as usize].as_ref()?;
                let dst_port = inner.ports[dst.0 as usize].as_ref()?;
                (src_port.active && dst_port.active && src_port.owner != dst_port.owner)
                    .then_some((src_port.owner, dst_port.owner))
            })
            .collect();
        let order = state::sort_clients(&inner.active_clients, &edges);

        let clients = order
            .into_iter()
            .map(|refnum| ScheduledClient {
                refnum,
                inputs: inner.client_ports[refnum]
                    .iter()
                    .filter_map(|&id| {
                        let port = inner.ports[id.0 as usize].as_ref()?;
                        (port.direction == PortDirection::Input && port.active).then(|| InputFeed {
                            dst: port.buffer.clone(),
                            sources: inner
                                .connections
                                .iter()
                                .filter(|&&(_, dst)| dst == id)
                                .filter_map(|&(src, _)| {
                                    let src_port = inner.ports[src.0 as usize].as_ref()?;
                                    src_port.active.then(|| src_port.buffer.clone())
                                })
                                .collect(),
                        })
                    })
                    .collect(),
            })
            .collect();

        *self.staged.lock() = Some(Arc::new(GraphOrder {
            clients,
            version: inner.version,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> GraphManager {
        GraphManager::new(32, 64)
    }

    fn audio_port(
        graph: &GraphManager,
        refnum: usize,
        name: &str,
        direction: PortDirection,
    ) -> PortId {
        let id = graph
            .allocate_port(
                refnum,
                name,
                PortType::Audio,
                direction,
                PortFlags::default(),
                LatencyRange::default(),
            )
            .unwrap();
        graph.activate_port(id).unwrap();
        id
    }

    #[test]
    fn test_port_names_are_unique() {
        let graph = manager();
        audio_port(&graph, 1, "a:out", PortDirection::Output);
        let err = graph
            .allocate_port(
                2,
                "a:out",
                PortType::Audio,
                PortDirection::Output,
                PortFlags::default(),
                LatencyRange::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::PortNameExists { .. }));
    }

    #[test]
    fn test_connections_are_symmetric() {
        let graph = manager();
        let src = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let dst = audio_port(&graph, 2, "b:in", PortDirection::Input);

        graph.connect(src, dst).unwrap();
        assert_eq!(graph.get_connections(src), vec![dst]);
        assert_eq!(graph.get_connections(dst), vec![src]);

        graph.disconnect(src, dst).unwrap();
        assert!(graph.get_connections(src).is_empty());
        assert!(graph.get_connections(dst).is_empty());
    }

    #[test]
    fn test_duplicate_connection_is_an_error() {
        let graph = manager();
        let src = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let dst = audio_port(&graph, 2, "b:in", PortDirection::Input);

        graph.connect(src, dst).unwrap();
        assert!(matches!(
            graph.connect(src, dst),
            Err(EngineError::DuplicateConnection { .. })
        ));
        // Still exactly one connection either side.
        assert_eq!(graph.get_connections(src).len(), 1);
    }

    #[test]
    fn test_check_ports_rejects_bad_pairs() {
        let graph = manager();
        let out1 = audio_port(&graph, 1, "a:out1", PortDirection::Output);
        let out2 = audio_port(&graph, 1, "a:out2", PortDirection::Output);
        let input = audio_port(&graph, 2, "b:in", PortDirection::Input);

        assert!(matches!(
            graph.check_ports(out1, out2),
            Err(EngineError::DirectionMismatch { .. })
        ));
        assert!(matches!(
            graph.check_ports(input, out1),
            Err(EngineError::DirectionMismatch { .. })
        ));

        let midi = graph
            .allocate_port(
                2,
                "b:midi",
                PortType::Midi,
                PortDirection::Input,
                PortFlags::default(),
                LatencyRange::default(),
            )
            .unwrap();
        graph.activate_port(midi).unwrap();
        assert!(matches!(
            graph.check_ports(out1, midi),
            Err(EngineError::TypeMismatch { .. })
        ));

        let inactive = graph
            .allocate_port(
                2,
                "b:in2",
                PortType::Audio,
                PortDirection::Input,
                PortFlags::default(),
                LatencyRange::default(),
            )
            .unwrap();
        assert!(matches!(
            graph.check_ports(out1, inactive),
            Err(EngineError::InactivePort { .. })
        ));
    }

    #[test]
    fn test_release_port_drops_connections() {
        let graph = manager();
        let src = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let dst = audio_port(&graph, 2, "b:in", PortDirection::Input);
        graph.connect(src, dst).unwrap();

        graph.release_port(2, dst).unwrap();
        assert!(graph.get_connections(src).is_empty());
        assert!(graph.port_info(dst).is_none());
        assert!(graph.get_port("b:in").is_none());
    }

    #[test]
    fn test_release_rejects_non_owner() {
        let graph = manager();
        let src = audio_port(&graph, 1, "a:out", PortDirection::Output);
        assert!(matches!(
            graph.release_port(3, src),
            Err(EngineError::NotPortOwner { .. })
        ));
    }

    #[test]
    fn test_port_lists_track_registration() {
        let graph = manager();
        let out = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let input = audio_port(&graph, 1, "a:in", PortDirection::Input);

        assert_eq!(graph.get_output_ports(1), vec![out]);
        assert_eq!(graph.get_input_ports(1), vec![input]);

        graph.release_port(1, out).unwrap();
        assert!(graph.get_output_ports(1).is_empty());
    }

    #[test]
    fn test_rename_port_returns_old_name() {
        let graph = manager();
        let id = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let old = graph.rename_port(id, "a:main").unwrap();
        assert_eq!(old, "a:out");
        assert_eq!(graph.get_port("a:main"), Some(id));
        assert!(graph.get_port("a:out").is_none());
    }

    #[test]
    fn test_snapshot_adoption_at_cycle_boundary() {
        let graph = manager();
        graph.activate_client(1);
        graph.activate_client(2);
        let src = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let dst = audio_port(&graph, 2, "b:in", PortDirection::Input);
        graph.connect(src, dst).unwrap();

        // Nothing adopted yet.
        assert!(graph.current_order().is_empty());

        assert!(graph.run_next_graph());
        assert_eq!(graph.current_order(), vec![1, 2]);

        // No further mutation: nothing to adopt, order unchanged.
        assert!(!graph.run_next_graph());
        assert_eq!(graph.current_order(), vec![1, 2]);
    }

    #[test]
    fn test_order_follows_connections() {
        let graph = manager();
        for refnum in [1, 2, 3] {
            graph.activate_client(refnum);
        }
        let a_out = audio_port(&graph, 3, "a:out", PortDirection::Output);
        let b_in = audio_port(&graph, 2, "b:in", PortDirection::Input);
        let b_out = audio_port(&graph, 2, "b:out", PortDirection::Output);
        let c_in = audio_port(&graph, 1, "c:in", PortDirection::Input);
        graph.connect(a_out, b_in).unwrap();
        graph.connect(b_out, c_in).unwrap();

        graph.run_next_graph();
        assert_eq!(graph.current_order(), vec![3, 2, 1]);
    }

    #[test]
    fn test_remove_all_ports_clears_owner() {
        let graph = manager();
        let src = audio_port(&graph, 1, "a:out", PortDirection::Output);
        let dst = audio_port(&graph, 2, "b:in", PortDirection::Input);
        graph.connect(src, dst).unwrap();

        graph.remove_all_ports(1);
        assert!(graph.get_output_ports(1).is_empty());
        assert!(graph.get_connections(dst).is_empty());
        assert!(graph.port_info(src).is_none());
    }
}
