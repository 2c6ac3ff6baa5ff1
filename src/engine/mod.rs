//! The engine: client lifecycle, notification fan-out, and the
//! realtime cycle.
//!
//! Request-thread operations (open, close, register, connect...) are
//! serialized by one engine mutex and mutate the client table and the
//! graph's master copy. The realtime cycle never takes that mutex: it
//! reads client slots through per-slot try-locks, walks the published
//! graph snapshot, and pushes its notifications (xrun, reorder) through
//! a channel drained by the server's notification pump.
//!
//! Notification callbacks never run under the engine mutex: every
//! operation queues deliveries with their recipients resolved, drops
//! the lock, then delivers.

pub mod client;
pub mod control;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::config::SelfConnectMode;
use crate::error::EngineError;
use crate::event::{Notification, NotificationKind};
use crate::graph::{
    ClientActivator, ClientStatus, GraphManager, LatencyRange, PortDirection, PortFlags, PortId,
    PortType,
};
use crate::server::ShutdownReason;
use client::{
    generate_unique_name, ClientControl, ClientInterface, ClientKind, ClientSlot, TriggerOutcome,
    CLIENT_MAX, CLIENT_NAME_MAX, PROTOCOL_VERSION,
};
use control::EngineControl;

/// How long a client open waits for proof that the realtime thread is
/// cycling.
const DRIVER_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counting wakeup: a condvar over a generation counter, the stand-in
/// for the per-client semaphores of the original design.
struct Synchro {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Synchro {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.generation.lock() += 1;
        self.cv.notify_all();
    }

    /// Waits for the next signal. False on timeout.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        let start = *generation;
        while *generation == start {
            if self.cv.wait_until(&mut generation, deadline).timed_out() {
                return *generation != start;
            }
        }
        true
    }
}

/// A notification with its recipients resolved at queue time, so
/// delivery can happen after the engine mutex is released without
/// changing who sees it.
struct Delivery {
    recipients: Vec<(String, Arc<dyn ClientInterface>)>,
    note: Notification,
}

type Outbox = Vec<Delivery>;

/// What an external client gets back from open: its refnum and the
/// indices of the shared regions it maps.
#[derive(Debug, Clone, Copy)]
pub struct ExternalOpenResult {
    /// The allocated refnum.
    pub refnum: usize,
    /// Arena index of the engine control region.
    pub shared_engine: usize,
    /// Arena index of the graph manager region.
    pub shared_graph: usize,
}

/// Decision of the self-connect policy for one request.
enum SelfConnectDecision {
    Proceed,
    Ignore,
}

/// The server engine. See the module docs for the locking story.
pub struct Engine {
    slots: Vec<RwLock<Option<ClientSlot>>>,
    graph: Arc<GraphManager>,
    control: Arc<EngineControl>,
    self_connect_mode: SelfConnectMode,
    /// Leading table slots occupied by drivers.
    driver_count: AtomicUsize,
    last_switch_us: AtomicU64,
    /// Signalled every time the cycle reaches a boundary switch; open,
    /// close and activate wait on it to confirm the cycle is live.
    cycle_signal: Synchro,
    client_synchro: Vec<Synchro>,
    rt_notifier: Sender<Notification>,
    shutdown_tx: Sender<ShutdownReason>,
    api_lock: Mutex<()>,
    /// Arena indices handed to external clients at open.
    shared_engine_index: usize,
    shared_graph_index: usize,
}

impl Engine {
    /// Builds an engine over an existing graph manager and control
    /// block. `rt_notifier` carries realtime-path notifications to the
    /// server's pump; `shutdown_tx` carries the exit signal.
    pub fn new(
        graph: Arc<GraphManager>,
        control: Arc<EngineControl>,
        self_connect_mode: SelfConnectMode,
        rt_notifier: Sender<Notification>,
        shutdown_tx: Sender<ShutdownReason>,
    ) -> Self {
        Self {
            slots: (0..CLIENT_MAX).map(|_| RwLock::new(None)).collect(),
            graph,
            control,
            self_connect_mode,
            driver_count: AtomicUsize::new(0),
            last_switch_us: AtomicU64::new(0),
            cycle_signal: Synchro::new(),
            client_synchro: (0..CLIENT_MAX).map(|_| Synchro::new()).collect(),
            rt_notifier,
            shutdown_tx,
            api_lock: Mutex::new(()),
            shared_engine_index: 0,
            shared_graph_index: 1,
        }
    }

    /// The graph manager this engine schedules.
    pub fn graph(&self) -> &Arc<GraphManager> {
        &self.graph
    }

    /// The shared control block.
    pub fn control(&self) -> &Arc<EngineControl> {
        &self.control
    }

    // ---- client resource management ----

    /// Bounds-checked slot access: a garbage refnum is an error, never
    /// a panic.
    fn slot(&self, refnum: usize) -> Result<&RwLock<Option<ClientSlot>>, EngineError> {
        self.slots
            .get(refnum)
            .ok_or(EngineError::NoSuchClient { refnum })
    }

    fn name_taken(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| {
            slot.read()
                .as_ref()
                .is_some_and(|client| client.control.name == name)
        })
    }

    fn allocate_refnum(&self) -> Result<usize, EngineError> {
        for (refnum, slot) in self.slots.iter().enumerate() {
            if slot.read().is_none() {
                tracing::debug!(refnum, "allocated refnum");
                return Ok(refnum);
            }
        }
        Err(EngineError::NoFreeSlot)
    }

    /// Validates protocol and name, resolving collisions.
    ///
    /// On a collision the returned name carries a `-01`..`-99` suffix
    /// unless `use_exact_name` is set, in which case the collision is
    /// an error.
    pub fn client_check(
        &self,
        name: &str,
        protocol: u32,
        use_exact_name: bool,
    ) -> Result<String, EngineError> {
        if protocol != PROTOCOL_VERSION {
            tracing::error!(client = protocol, server = PROTOCOL_VERSION, "protocol mismatch");
            return Err(EngineError::VersionMismatch {
                client: protocol,
                server: PROTOCOL_VERSION,
            });
        }
        if name.len() > CLIENT_NAME_MAX {
            return Err(EngineError::NameTooLong {
                name: name.to_string(),
            });
        }
        if !self.name_taken(name) {
            return Ok(name.to_string());
        }
        if use_exact_name {
            tracing::error!(name, "cannot create new client, name exists");
            return Err(EngineError::NameNotUnique {
                name: name.to_string(),
            });
        }
        generate_unique_name(name, |candidate| self.name_taken(candidate))
    }

    fn subscribers(&self, kind: NotificationKind) -> Vec<(String, Arc<dyn ClientInterface>)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.read();
                let client = slot.as_ref()?;
                client
                    .control
                    .callbacks
                    .contains(kind)
                    .then(|| (client.control.name.clone(), Arc::clone(&client.iface)))
            })
            .collect()
    }

    fn queue_all(&self, outbox: &mut Outbox, note: Notification) {
        outbox.push(Delivery {
            recipients: self.subscribers(note.kind()),
            note,
        });
    }

    fn queue_one(&self, outbox: &mut Outbox, refnum: usize, note: Notification) {
        let slot = self.slots[refnum].read();
        let Some(client) = slot.as_ref() else {
            return;
        };
        if client.control.callbacks.contains(note.kind()) {
            outbox.push(Delivery {
                recipients: vec![(client.control.name.clone(), Arc::clone(&client.iface))],
                note,
            });
        }
    }

    fn deliver(outbox: Outbox) {
        for delivery in outbox {
            for (name, iface) in &delivery.recipients {
                if let Err(err) = iface.notify(&delivery.note) {
                    tracing::error!(client = %name, note = ?delivery.note.kind(), %err, "notification failed");
                }
            }
        }
    }

    /// Fans one notification out to every live subscriber. Used by the
    /// server's notification pump for realtime-path events.
    pub fn notify_all(&self, note: &Notification) {
        let mut outbox = Outbox::new();
        self.queue_all(&mut outbox, note.clone());
        Self::deliver(outbox);
    }

    /// Tells every existing client about the newcomer and the newcomer
    /// about every existing client. A failure aborts the open.
    fn notify_add_client(
        &self,
        new_iface: &Arc<dyn ClientInterface>,
        name: &str,
        refnum: usize,
    ) -> Result<(), EngineError> {
        for (other_refnum, slot) in self.slots.iter().enumerate() {
            if other_refnum == refnum {
                continue;
            }
            let (other_name, other_iface) = {
                let slot = slot.read();
                match slot.as_ref() {
                    Some(client) => (
                        client.control.name.clone(),
                        Arc::clone(&client.iface),
                    ),
                    None => continue,
                }
            };
            if other_iface
                .notify(&Notification::AddClient {
                    refnum,
                    name: name.to_string(),
                })
                .is_err()
            {
                tracing::error!(client = %other_name, "add-client notification rejected");
                return Err(EngineError::NotificationFailed { name: other_name });
            }
            if new_iface
                .notify(&Notification::AddClient {
                    refnum: other_refnum,
                    name: other_name.clone(),
                })
                .is_err()
            {
                tracing::error!(client = %name, "new client rejected add-client notification");
                return Err(EngineError::NotificationFailed {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn open_common(
        &self,
        _guard: &MutexGuard<'_, ()>,
        name: &str,
        pid: u32,
        kind: ClientKind,
        iface: Arc<dyn ClientInterface>,
        wait: bool,
    ) -> Result<usize, EngineError> {
        if self.name_taken(name) {
            return Err(EngineError::NameNotUnique {
                name: name.to_string(),
            });
        }
        let refnum = self.allocate_refnum()?;

        // Proof that the cycle is alive before this client can be
        // scheduled into it.
        if wait && self.driver_count.load(Ordering::Relaxed) > 0 && !self.cycle_signal.wait(DRIVER_OPEN_TIMEOUT)
        {
            tracing::error!(name, "driver is not running");
            return Err(EngineError::DriverNotRunning);
        }

        *self.slots[refnum].write() = Some(ClientSlot {
            kind,
            control: ClientControl::new(name, pid),
            iface: Arc::clone(&iface),
        });
        if kind == ClientKind::Driver {
            self.driver_count.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(err) = self.notify_add_client(&iface, name, refnum) {
            *self.slots[refnum].write() = None;
            if kind == ClientKind::Driver {
                self.driver_count.fetch_sub(1, Ordering::Relaxed);
            }
            return Err(err);
        }

        self.graph.init_refnum(refnum);
        self.control.reset_rolling_stats();
        tracing::info!(name, refnum, ?kind, "client opened");
        Ok(refnum)
    }

    /// Opens an out-of-process client. `iface` is the notification and
    /// wake transport bound to that process.
    pub fn client_external_open(
        &self,
        name: &str,
        pid: u32,
        iface: Arc<dyn ClientInterface>,
    ) -> Result<ExternalOpenResult, EngineError> {
        let guard = self.api_lock.lock();
        let refnum = self.open_common(&guard, name, pid, ClientKind::External, iface, true)?;
        Ok(ExternalOpenResult {
            refnum,
            shared_engine: self.shared_engine_index,
            shared_graph: self.shared_graph_index,
        })
    }

    /// Opens an in-process client (or a driver when `kind` says so).
    pub fn client_internal_open(
        &self,
        name: &str,
        kind: ClientKind,
        iface: Arc<dyn ClientInterface>,
        wait: bool,
    ) -> Result<usize, EngineError> {
        let guard = self.api_lock.lock();
        self.open_common(&guard, name, 0, kind, iface, wait)
    }

    /// Removes the slot, raising the temporary-exit signal when the
    /// last non-driver client leaves in temporary mode.
    fn release_refnum(&self, refnum: usize) {
        let kind = self.slots[refnum].write().take().map(|slot| slot.kind);
        if kind == Some(ClientKind::Driver) {
            self.driver_count.fetch_sub(1, Ordering::Relaxed);
        }

        if self.control.temporary() {
            let drivers = self.driver_count.load(Ordering::Relaxed);
            let any_left = self.slots[drivers..]
                .iter()
                .any(|slot| slot.read().is_some());
            if !any_left {
                tracing::info!("last client left in temporary mode, shutting down");
                self.control.clear_temporary();
                let _ = self.shutdown_tx.send(ShutdownReason::TemporaryExit);
            }
        }
    }

    fn close_common(&self, refnum: usize, wait: bool) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();

        let (name, active) = {
            let slot = self.slot(refnum)?.read();
            let client = slot
                .as_ref()
                .ok_or(EngineError::NoSuchClient { refnum })?;
            (client.control.name.clone(), client.control.active)
        };
        tracing::info!(name, refnum, "closing client");

        // Unregister every port first so the notifications fan out
        // while the client is still known.
        let mut ports = self.graph.get_input_ports(refnum);
        ports.extend(self.graph.get_output_ports(refnum));
        for port in ports {
            self.port_unregister_inner(refnum, port, active, &mut outbox)?;
        }

        self.release_refnum(refnum);
        self.graph.remove_all_ports(refnum);

        // Give the cycle a chance to release the slot before the caller
        // tears down the client's side of the transport.
        if wait
            && self.driver_count.load(Ordering::Relaxed) > 0
            && !self
                .cycle_signal
                .wait(Duration::from_micros(2 * self.control.client_timeout_us()))
        {
            tracing::error!(refnum, "close wait expired before cycle confirmation");
        }

        self.queue_all(&mut outbox, Notification::RemoveClient { refnum, name });
        self.control.reset_rolling_stats();
        drop(guard);
        Self::deliver(outbox);
        Ok(())
    }

    /// Closes an external client.
    pub fn client_external_close(&self, refnum: usize) -> Result<(), EngineError> {
        self.close_common(refnum, true)
    }

    /// Closes an internal client or driver; `wait` is false when the
    /// realtime thread is already stopped.
    pub fn client_internal_close(&self, refnum: usize, wait: bool) -> Result<(), EngineError> {
        self.close_common(refnum, wait)
    }

    /// Schedules the client into the graph and flips its ports active.
    pub fn client_activate(&self, refnum: usize, is_real_time: bool) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        {
            let slot = self.slot(refnum)?.read();
            if slot.is_none() {
                return Err(EngineError::NoSuchClient { refnum });
            }
        }

        if is_real_time {
            self.graph.activate_client(refnum);
        }

        // The new order must be adopted before the client's first wake.
        // Drivers skip the wait: they are the cycle.
        let drivers = self.driver_count.load(Ordering::Relaxed);
        if drivers > 0
            && refnum >= drivers
            && !self
                .cycle_signal
                .wait(Duration::from_micros(10 * self.control.client_timeout_us()))
        {
            tracing::error!(refnum, "activate wait expired");
            return Err(EngineError::CycleWaitTimeout { refnum });
        }

        let inputs = self.graph.get_input_ports(refnum);
        let outputs = self.graph.get_output_ports(refnum);
        for &port in inputs.iter().chain(&outputs) {
            self.graph.activate_port(port)?;
        }

        if let Some(client) = self.slots[refnum].write().as_mut() {
            client.control.active = true;
        }

        self.queue_one(&mut outbox, refnum, Notification::Activate { refnum });
        for &port in inputs.iter().chain(&outputs) {
            self.queue_all(&mut outbox, Notification::PortRegistered { port });
        }
        drop(guard);
        Self::deliver(outbox);
        Ok(())
    }

    /// Takes the client out of the graph, disconnecting all its ports.
    pub fn client_deactivate(&self, refnum: usize) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        {
            let slot = self.slot(refnum)?.read();
            if slot.is_none() {
                return Err(EngineError::NoSuchClient { refnum });
            }
        }

        let inputs = self.graph.get_input_ports(refnum);
        let outputs = self.graph.get_output_ports(refnum);
        for &port in inputs.iter().chain(&outputs) {
            if let Err(err) = self.disconnect_all_inner(refnum, port, &mut outbox) {
                tracing::debug!(%port, %err, "policy blocked disconnect during deactivate");
            }
            self.graph.deactivate_port(port)?;
        }
        for &port in inputs.iter().chain(&outputs) {
            self.queue_all(&mut outbox, Notification::PortUnregistered { port });
        }

        if let Some(client) = self.slots[refnum].write().as_mut() {
            client.control.active = false;
        }
        self.graph.deactivate_client(refnum);
        // Force a switch on the next cycle even for clients that died
        // without finishing.
        self.last_switch_us.store(0, Ordering::Relaxed);

        let result = if self.driver_count.load(Ordering::Relaxed) > 0
            && !self
                .cycle_signal
                .wait(Duration::from_micros(10 * self.control.client_timeout_us()))
        {
            tracing::error!(refnum, "deactivate wait expired");
            Err(EngineError::CycleWaitTimeout { refnum })
        } else {
            Ok(())
        };
        drop(guard);
        Self::deliver(outbox);
        result
    }

    // ---- client queries ----

    /// Name behind a refnum.
    pub fn client_name(&self, refnum: usize) -> Result<String, EngineError> {
        self.slots
            .get(refnum)
            .and_then(|slot| slot.read().as_ref().map(|c| c.control.name.clone()))
            .ok_or(EngineError::NoSuchClient { refnum })
    }

    /// PID behind a name, zero for in-process clients.
    pub fn client_pid(&self, name: &str) -> Option<u32> {
        self.slots.iter().find_map(|slot| {
            let slot = slot.read();
            let client = slot.as_ref()?;
            (client.control.name == name).then_some(client.control.pid)
        })
    }

    /// Refnum behind a name.
    pub fn client_refnum(&self, name: &str) -> Option<usize> {
        self.slots.iter().enumerate().find_map(|(refnum, slot)| {
            let slot = slot.read();
            let client = slot.as_ref()?;
            (client.control.name == name).then_some(refnum)
        })
    }

    /// Finds a loaded internal client by name.
    pub fn find_internal_client(&self, name: &str) -> Option<usize> {
        self.slots.iter().enumerate().find_map(|(refnum, slot)| {
            let slot = slot.read();
            let client = slot.as_ref()?;
            (client.kind == ClientKind::Internal && client.control.name == name).then_some(refnum)
        })
    }

    /// Closes an internal client by refnum.
    pub fn unload_internal_client(&self, refnum: usize) -> Result<(), EngineError> {
        {
            let slot = self.slot(refnum)?.read();
            match slot.as_ref() {
                Some(client) if client.kind == ClientKind::Internal => {}
                _ => return Err(EngineError::NoSuchClient { refnum }),
            }
        }
        self.close_common(refnum, true)
    }

    /// Updates a client's callback subscriptions.
    pub fn set_callbacks(
        &self,
        refnum: usize,
        callbacks: crate::event::CallbackMask,
    ) -> Result<(), EngineError> {
        let mut slot = self.slot(refnum)?.write();
        let client = slot
            .as_mut()
            .ok_or(EngineError::NoSuchClient { refnum })?;
        client.control.callbacks = callbacks;
        Ok(())
    }

    // ---- port management ----

    /// Registers a port for `refnum`.
    pub fn port_register(
        &self,
        refnum: usize,
        name: &str,
        port_type: PortType,
        direction: PortDirection,
        flags: PortFlags,
        latency: LatencyRange,
    ) -> Result<PortId, EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        let active = {
            let slot = self.slot(refnum)?.read();
            slot.as_ref()
                .ok_or(EngineError::NoSuchClient { refnum })?
                .control
                .active
        };
        if self.graph.get_port(name).is_some() {
            return Err(EngineError::PortNameExists {
                name: name.to_string(),
            });
        }
        let port = self
            .graph
            .allocate_port(refnum, name, port_type, direction, flags, latency)?;
        // Ports of active clients join the graph immediately.
        if active {
            self.graph.activate_port(port)?;
            self.queue_all(&mut outbox, Notification::PortRegistered { port });
        }
        drop(guard);
        Self::deliver(outbox);
        Ok(port)
    }

    fn port_unregister_inner(
        &self,
        refnum: usize,
        port: PortId,
        owner_active: bool,
        outbox: &mut Outbox,
    ) -> Result<(), EngineError> {
        // A connect policy must not wedge cleanup: whatever the fan-out
        // leaves behind, releasing the port severs at the graph level.
        if let Err(err) = self.disconnect_all_inner(refnum, port, outbox) {
            tracing::debug!(%port, %err, "policy blocked disconnect during unregister");
        }
        self.graph.release_port(refnum, port)?;
        if owner_active {
            self.queue_all(outbox, Notification::PortUnregistered { port });
        }
        Ok(())
    }

    /// Unregisters a port, disconnecting it first.
    pub fn port_unregister(&self, refnum: usize, port: PortId) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        let active = {
            let slot = self.slot(refnum)?.read();
            slot.as_ref()
                .ok_or(EngineError::NoSuchClient { refnum })?
                .control
                .active
        };
        self.port_unregister_inner(refnum, port, active, &mut outbox)?;
        drop(guard);
        Self::deliver(outbox);
        Ok(())
    }

    /// Applies the self-connect policy for `caller` on a pair.
    fn check_self_connect(
        &self,
        caller: usize,
        src: PortId,
        dst: PortId,
    ) -> Result<SelfConnectDecision, EngineError> {
        let src_owner = self
            .graph
            .port_info(src)
            .ok_or(EngineError::InvalidPort { port: src })?
            .owner;
        let dst_owner = self
            .graph
            .port_info(dst)
            .ok_or(EngineError::InvalidPort { port: dst })?
            .owner;
        let self_count =
            usize::from(src_owner == caller) + usize::from(dst_owner == caller);

        let verdict = match self.self_connect_mode {
            SelfConnectMode::Allow => SelfConnectDecision::Proceed,
            SelfConnectMode::FailExternalOnly if self_count == 1 => {
                tracing::info!(%src, %dst, "rejecting self connect to external port");
                return Err(EngineError::SelfConnectRejected { src, dst });
            }
            SelfConnectMode::IgnoreExternalOnly if self_count == 1 => {
                tracing::info!(%src, %dst, "ignoring self connect to external port");
                SelfConnectDecision::Ignore
            }
            SelfConnectMode::FailAll if self_count != 0 => {
                tracing::info!(%src, %dst, "rejecting self connect");
                return Err(EngineError::SelfConnectRejected { src, dst });
            }
            SelfConnectMode::IgnoreAll if self_count != 0 => {
                tracing::info!(%src, %dst, "ignoring self connect");
                SelfConnectDecision::Ignore
            }
            _ => SelfConnectDecision::Proceed,
        };
        Ok(verdict)
    }

    fn owner_active(&self, port: PortId) -> Result<(), EngineError> {
        let owner = self
            .graph
            .port_info(port)
            .ok_or(EngineError::InvalidPort { port })?
            .owner;
        let slot = self.slots[owner].read();
        let client = slot
            .as_ref()
            .ok_or(EngineError::NoSuchClient { refnum: owner })?;
        if !client.control.active {
            return Err(EngineError::InactiveClient {
                name: client.control.name.clone(),
            });
        }
        Ok(())
    }

    fn port_connect_inner(
        &self,
        caller: usize,
        src: PortId,
        dst: PortId,
        outbox: &mut Outbox,
    ) -> Result<(), EngineError> {
        self.graph.check_ports(src, dst)?;
        self.owner_active(src)?;
        self.owner_active(dst)?;
        match self.check_self_connect(caller, src, dst)? {
            SelfConnectDecision::Ignore => return Ok(()),
            SelfConnectDecision::Proceed => {}
        }
        self.graph.connect(src, dst)?;
        self.queue_all(outbox, Notification::PortsConnected { src, dst });
        Ok(())
    }

    /// Connects two ports by id, subject to the self-connect policy.
    pub fn port_connect(
        &self,
        caller: usize,
        src: PortId,
        dst: PortId,
    ) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        let result = self.port_connect_inner(caller, src, dst, &mut outbox);
        drop(guard);
        Self::deliver(outbox);
        result
    }

    /// Connects two ports by `client:port` name.
    pub fn port_connect_by_name(
        &self,
        caller: usize,
        src: &str,
        dst: &str,
    ) -> Result<(), EngineError> {
        let (src, dst) = self.graph.get_two_ports(src, dst)?;
        self.port_connect(caller, src, dst)
    }

    fn port_disconnect_inner(
        &self,
        caller: usize,
        src: PortId,
        dst: PortId,
        outbox: &mut Outbox,
    ) -> Result<(), EngineError> {
        match self.check_self_connect(caller, src, dst)? {
            SelfConnectDecision::Ignore => return Ok(()),
            SelfConnectDecision::Proceed => {}
        }
        self.graph.disconnect(src, dst)?;
        self.queue_all(outbox, Notification::PortsDisconnected { src, dst });
        Ok(())
    }

    /// Removes one connection.
    pub fn port_disconnect(
        &self,
        caller: usize,
        src: PortId,
        dst: PortId,
    ) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        let result = self.port_disconnect_inner(caller, src, dst, &mut outbox);
        drop(guard);
        Self::deliver(outbox);
        result
    }

    /// Removes one connection, endpoints given by name.
    pub fn port_disconnect_by_name(
        &self,
        caller: usize,
        src: &str,
        dst: &str,
    ) -> Result<(), EngineError> {
        let (src, dst) = self.graph.get_two_ports(src, dst)?;
        self.port_disconnect(caller, src, dst)
    }

    fn disconnect_all_inner(
        &self,
        caller: usize,
        port: PortId,
        outbox: &mut Outbox,
    ) -> Result<(), EngineError> {
        let info = self
            .graph
            .port_info(port)
            .ok_or(EngineError::InvalidPort { port })?;
        let mut result = Ok(());
        for other in self.graph.get_connections(port) {
            let (src, dst) = match info.direction {
                PortDirection::Output => (port, other),
                PortDirection::Input => (other, port),
            };
            if let Err(err) = self.port_disconnect_inner(caller, src, dst, outbox) {
                result = Err(err);
            }
        }
        result
    }

    /// Fans a disconnect out across the port's current connection list.
    pub fn port_disconnect_all(&self, caller: usize, port: PortId) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        let result = self.disconnect_all_inner(caller, port, &mut outbox);
        drop(guard);
        Self::deliver(outbox);
        result
    }

    /// Renames a port owned by `refnum` and notifies with the old name.
    pub fn port_rename(
        &self,
        refnum: usize,
        port: PortId,
        name: &str,
    ) -> Result<(), EngineError> {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        let info = self
            .graph
            .port_info(port)
            .ok_or(EngineError::InvalidPort { port })?;
        if info.owner != refnum {
            return Err(EngineError::NotPortOwner { port, refnum });
        }
        let old_name = self.graph.rename_port(port, name)?;
        self.queue_all(&mut outbox, Notification::PortRenamed { port, old_name });
        drop(guard);
        Self::deliver(outbox);
        Ok(())
    }

    // ---- engine-wide notifications ----

    /// Changes the period length everywhere and tells every client.
    pub fn set_buffer_size(&self, frames: u32) {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        self.control.set_buffer_size(frames);
        self.graph.set_buffer_size(frames as usize);
        self.queue_all(&mut outbox, Notification::BufferSize { frames });
        drop(guard);
        Self::deliver(outbox);
    }

    /// Changes the sample rate everywhere and tells every client.
    pub fn set_sample_rate(&self, rate: u32) {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        self.control.set_sample_rate(rate);
        self.queue_all(&mut outbox, Notification::SampleRate { rate });
        drop(guard);
        Self::deliver(outbox);
    }

    /// Toggles freewheel: saves or restores the realtime flag and
    /// notifies.
    pub fn notify_freewheel(&self, on: bool) {
        let guard = self.api_lock.lock();
        let mut outbox = Outbox::new();
        if on {
            self.control.save_realtime();
            self.queue_all(&mut outbox, Notification::StartFreewheel);
        } else {
            self.control.restore_realtime();
            self.queue_all(&mut outbox, Notification::StopFreewheel);
        }
        drop(guard);
        Self::deliver(outbox);
    }

    /// Announces an unrecoverable failure and raises the shutdown
    /// signal.
    pub fn notify_failure(&self, code: i32, reason: &str) {
        tracing::error!(code, reason, "server failure");
        self.notify_all(&Notification::ShutDown {
            reason: reason.to_string(),
        });
        let _ = self.shutdown_tx.send(ShutdownReason::Failure {
            code,
            reason: reason.to_string(),
        });
    }

    // ---- realtime cycle ----

    /// One cycle, driven by the driver between its read and write.
    /// Returns true when the cycle reached a boundary switch.
    pub fn process(&self, cur_cycle_begin_us: u64, prev_cycle_end_us: u64) -> bool {
        self.control
            .cycle_begin(cur_cycle_begin_us, prev_cycle_end_us);

        let last_switch = self.last_switch_us.load(Ordering::Relaxed);
        let timeout_us = self.control.client_timeout_us();
        let switched = if self.graph.is_finished_graph() {
            self.process_next(cur_cycle_begin_us);
            true
        } else if cur_cycle_begin_us > last_switch + timeout_us {
            tracing::warn!(
                delta_us = cur_cycle_begin_us - last_switch,
                "graph unfinished past timeout, switching late"
            );
            self.process_next(cur_cycle_begin_us);
            true
        } else {
            // Signal xruns only for the first failing cycle.
            if cur_cycle_begin_us < last_switch + 2 * self.control.period_us() {
                self.check_xrun(cur_cycle_begin_us);
            }
            false
        };

        self.graph.run_current_graph(
            self,
            self.control.buffer_size(),
            Duration::from_micros(timeout_us),
        );
        self.control.cycle_end(self.control.now_us());
        switched
    }

    fn process_next(&self, cur_cycle_begin_us: u64) {
        self.last_switch_us
            .store(cur_cycle_begin_us, Ordering::Relaxed);
        if self.graph.run_next_graph() {
            let _ = self.rt_notifier.send(Notification::GraphReorder);
        }
        self.cycle_signal.signal();
    }

    /// Scans non-driver clients for ones that missed the previous
    /// deadline. Clients that finish *after* the current callback began
    /// count as late even though their buffers were consumed.
    fn check_xrun(&self, callback_us: u64) {
        let drivers = self.driver_count.load(Ordering::Relaxed);
        for refnum in drivers..CLIENT_MAX {
            let Some(slot) = self.slots[refnum].try_read() else {
                continue;
            };
            let Some(client) = slot.as_ref() else {
                continue;
            };
            if !client.control.active {
                continue;
            }
            let timing = self.graph.client_timing(refnum);
            let status = timing.status();
            if !matches!(status, ClientStatus::NotTriggered | ClientStatus::Finished) {
                tracing::error!(
                    client = %client.control.name,
                    ?status,
                    "xrun: client was not run"
                );
                let _ = self.rt_notifier.send(Notification::XRun);
            } else if status == ClientStatus::Finished && timing.finished_at() > callback_us {
                tracing::error!(
                    client = %client.control.name,
                    "xrun: client finished after current callback"
                );
                let _ = self.rt_notifier.send(Notification::XRun);
            }
        }
    }

    /// Reports an xrun detected by the driver itself (a missed
    /// interrupt), outside the per-client scan.
    pub fn notify_driver_xrun(&self) {
        let _ = self.rt_notifier.send(Notification::XRun);
    }

    /// Called by an externally-triggered client when its cycle work is
    /// done. Stamps the timing record and wakes the graph walk.
    pub fn cycle_finished(&self, refnum: usize) {
        if refnum >= CLIENT_MAX {
            return;
        }
        self.graph
            .client_timing(refnum)
            .mark_finished(self.control.now_us());
        self.client_synchro[refnum].signal();
    }

    /// Called by an externally-triggered client when it starts its
    /// cycle work.
    pub fn cycle_running(&self, refnum: usize) {
        if refnum < CLIENT_MAX {
            self.graph.client_timing(refnum).mark_running();
        }
    }
}

impl ClientActivator for Engine {
    fn now_us(&self) -> u64 {
        self.control.now_us()
    }

    fn trigger(&self, refnum: usize, frames: u32) -> TriggerOutcome {
        let Some(slot) = self.slots[refnum].try_read() else {
            return TriggerOutcome::Absent;
        };
        match slot.as_ref() {
            Some(client) if client.kind != ClientKind::Driver => client.iface.trigger(frames),
            // Drivers run the cycle; their slot is a bookkeeping entry.
            Some(_) => TriggerOutcome::Finished,
            None => TriggerOutcome::Absent,
        }
    }

    fn wait_finished(&self, refnum: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let synchro = &self.client_synchro[refnum];
        // The finish stamp is written before the signal, so checking it
        // under the synchro lock cannot miss a wakeup.
        let mut generation = synchro.generation.lock();
        loop {
            if self.graph.client_timing(refnum).status() == ClientStatus::Finished {
                return true;
            }
            if synchro.cv.wait_until(&mut generation, deadline).timed_out() {
                return self.graph.client_timing(refnum).status() == ClientStatus::Finished;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crossbeam_channel::unbounded;

    struct NullClient;

    impl ClientInterface for NullClient {
        fn notify(&self, _notification: &Notification) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn engine() -> Engine {
        let graph = Arc::new(GraphManager::new(64, 256));
        let control = Arc::new(EngineControl::new(
            256,
            48000,
            Duration::from_millis(20),
            false,
            0,
            false,
            false,
        ));
        let (rt_tx, _rt_rx) = unbounded();
        let (shutdown_tx, _shutdown_rx) = unbounded();
        Engine::new(graph, control, SelfConnectMode::Allow, rt_tx, shutdown_tx)
    }

    fn open(engine: &Engine, name: &str) -> usize {
        engine
            .client_internal_open(name, ClientKind::Internal, Arc::new(NullClient), false)
            .unwrap()
    }

    #[test]
    fn test_client_check_rejects_bad_protocol() {
        let engine = engine();
        let err = engine.client_check("a", PROTOCOL_VERSION + 1, false).unwrap_err();
        assert!(matches!(err, EngineError::VersionMismatch { .. }));
    }

    #[test]
    fn test_client_check_resolves_collisions() {
        let engine = engine();
        open(&engine, "tape");

        assert!(matches!(
            engine.client_check("tape", PROTOCOL_VERSION, true),
            Err(EngineError::NameNotUnique { .. })
        ));
        assert_eq!(
            engine.client_check("tape", PROTOCOL_VERSION, false).unwrap(),
            "tape-01"
        );
        assert_eq!(
            engine.client_check("fresh", PROTOCOL_VERSION, false).unwrap(),
            "fresh"
        );
    }

    #[test]
    fn test_refnums_allocate_lowest_first() {
        let engine = engine();
        assert_eq!(open(&engine, "a"), 0);
        assert_eq!(open(&engine, "b"), 1);

        engine.client_internal_close(0, false).unwrap();
        assert_eq!(open(&engine, "c"), 0);
    }

    #[test]
    fn test_open_rejects_duplicate_name() {
        let engine = engine();
        open(&engine, "a");
        let err = engine
            .client_internal_open("a", ClientKind::Internal, Arc::new(NullClient), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::NameNotUnique { .. }));
    }

    #[test]
    fn test_lookups_by_name() {
        let engine = engine();
        let refnum = open(&engine, "sampler");
        assert_eq!(engine.client_refnum("sampler"), Some(refnum));
        assert_eq!(engine.client_pid("sampler"), Some(0));
        assert_eq!(engine.client_name(refnum).unwrap(), "sampler");
        assert_eq!(engine.client_refnum("missing"), None);
    }

    #[test]
    fn test_find_and_unload_internal_client() {
        let engine = engine();
        let refnum = open(&engine, "fx");
        assert_eq!(engine.find_internal_client("fx"), Some(refnum));

        engine.unload_internal_client(refnum).unwrap();
        assert_eq!(engine.find_internal_client("fx"), None);
        assert!(matches!(
            engine.unload_internal_client(refnum),
            Err(EngineError::NoSuchClient { .. })
        ));
    }

    #[test]
    fn test_close_unknown_client_fails() {
        let engine = engine();
        assert!(matches!(
            engine.client_internal_close(7, false),
            Err(EngineError::NoSuchClient { .. })
        ));
    }
}
