//! Integration tests for the engine: client lifecycle, port and
//! connection management, self-connect policy, cycle scheduling and
//! xrun reporting.
//!
//! Everything here runs without a driver thread: cycles are driven by
//! calling `Engine::process` with explicit timestamps, and
//! realtime-path notifications are pumped by hand, which makes the
//! per-cycle behavior fully deterministic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use graph_audio::{
    CallbackMask, ClientInterface, ClientKind, ClientStatus, Engine, EngineControl, EngineError,
    GraphManager, LatencyRange, Notification, NotificationKind, PortDirection, PortFlags,
    PortType, SelfConnectMode, ShutdownReason, TriggerOutcome, PROTOCOL_VERSION,
};

/// Collects every notification a client sees.
#[derive(Default)]
struct Recorder {
    notes: Mutex<Vec<Notification>>,
}

impl Recorder {
    fn push(&self, note: &Notification) {
        self.notes.lock().unwrap().push(note.clone());
    }

    fn count(&self, kind: NotificationKind) -> usize {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .filter(|note| note.kind() == kind)
            .count()
    }

    fn all(&self) -> Vec<Notification> {
        self.notes.lock().unwrap().clone()
    }
}

/// A test client: records notifications; processes inline, stalls
/// forever, or hands the wake to an external thread via a channel.
enum Behavior {
    Inline,
    Stall,
    Channel(Sender<u32>),
}

struct TestClient {
    recorder: Arc<Recorder>,
    behavior: Behavior,
}

impl ClientInterface for TestClient {
    fn notify(&self, notification: &Notification) -> Result<(), EngineError> {
        self.recorder.push(notification);
        Ok(())
    }

    fn trigger(&self, frames: u32) -> TriggerOutcome {
        match &self.behavior {
            Behavior::Inline => TriggerOutcome::Finished,
            Behavior::Stall => TriggerOutcome::Pending,
            Behavior::Channel(tx) => {
                let _ = tx.send(frames);
                TriggerOutcome::Pending
            }
        }
    }
}

struct Harness {
    engine: Arc<Engine>,
    rt_rx: Receiver<Notification>,
    shutdown_rx: Receiver<ShutdownReason>,
}

impl Harness {
    fn new(mode: SelfConnectMode, temporary: bool, timeout: Duration) -> Self {
        let graph = Arc::new(GraphManager::new(64, 256));
        let control = Arc::new(EngineControl::new(
            256, 48000, timeout, false, 0, temporary, false,
        ));
        let (rt_tx, rt_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        Self {
            engine: Arc::new(Engine::new(graph, control, mode, rt_tx, shutdown_tx)),
            rt_rx,
            shutdown_rx,
        }
    }

    fn open(&self, name: &str, behavior: Behavior) -> (usize, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let refnum = self
            .engine
            .client_internal_open(
                name,
                ClientKind::Internal,
                Arc::new(TestClient {
                    recorder: Arc::clone(&recorder),
                    behavior,
                }),
                false,
            )
            .unwrap();
        self.engine
            .set_callbacks(refnum, CallbackMask::all())
            .unwrap();
        (refnum, recorder)
    }

    fn register(
        &self,
        refnum: usize,
        name: &str,
        direction: PortDirection,
    ) -> graph_audio::PortId {
        self.engine
            .port_register(
                refnum,
                name,
                PortType::Audio,
                direction,
                PortFlags::default(),
                LatencyRange::default(),
            )
            .unwrap()
    }

    /// Hand-pumps realtime-path notifications, returning how many xruns
    /// went by.
    fn pump(&self) -> usize {
        let mut xruns = 0;
        while let Ok(note) = self.rt_rx.try_recv() {
            if note.kind() == NotificationKind::XRun {
                xruns += 1;
            }
            self.engine.notify_all(&note);
        }
        xruns
    }
}

fn default_harness() -> Harness {
    Harness::new(SelfConnectMode::Allow, false, Duration::from_millis(10))
}

// S1: unique client names.
#[test]
fn test_unique_name_registration() {
    let h = default_harness();
    h.open("a", Behavior::Inline);

    // Exact-name open of a colliding name fails.
    assert!(matches!(
        h.engine.client_check("a", PROTOCOL_VERSION, true),
        Err(EngineError::NameNotUnique { .. })
    ));

    // Without exact-name, the engine proposes "a-01" and the open under
    // that name succeeds.
    let proposed = h.engine.client_check("a", PROTOCOL_VERSION, false).unwrap();
    assert_eq!(proposed, "a-01");
    let (refnum, _) = h.open(&proposed, Behavior::Inline);
    assert_eq!(h.engine.client_name(refnum).unwrap(), "a-01");
}

// S2: port lifecycle across client close.
#[test]
fn test_close_releases_ports_and_connections() {
    let h = default_harness();
    let (system, _) = h.open("system_like", Behavior::Inline);
    let (a, _) = h.open("a", Behavior::Inline);

    let capture = h.register(system, "system_like:capture_1", PortDirection::Output);
    let input = h.register(a, "a:in1", PortDirection::Input);
    h.engine.client_activate(system, true).unwrap();
    h.engine.client_activate(a, true).unwrap();

    h.engine
        .port_connect_by_name(a, "system_like:capture_1", "a:in1")
        .unwrap();
    assert_eq!(h.engine.graph().get_connections(capture), vec![input]);

    h.engine.client_internal_close(a, false).unwrap();

    assert!(h.engine.graph().get_connections(capture).is_empty());
    assert!(h.engine.graph().get_port("a:in1").is_none());
    assert!(h.engine.graph().port_info(input).is_none());
}

// S3: self-connect policy matrix.
#[test]
fn test_self_connect_policy() {
    for (mode, own_ok, cross_ok) in [
        (SelfConnectMode::FailAll, false, false),
        (SelfConnectMode::FailExternalOnly, true, false),
        (SelfConnectMode::Allow, true, true),
    ] {
        let h = Harness::new(mode, false, Duration::from_millis(10));
        let (a, _) = h.open("a", Behavior::Inline);
        let (b, _) = h.open("b", Behavior::Inline);

        let a_out = h.register(a, "a:out1", PortDirection::Output);
        let a_in = h.register(a, "a:in1", PortDirection::Input);
        let b_in = h.register(b, "b:in1", PortDirection::Input);
        h.engine.client_activate(a, true).unwrap();
        h.engine.client_activate(b, true).unwrap();

        // Caller a connecting its own two ports.
        let own = h.engine.port_connect(a, a_out, a_in);
        assert_eq!(own.is_ok(), own_ok, "{mode:?} own-port connect");
        if !own_ok {
            assert!(matches!(own, Err(EngineError::SelfConnectRejected { .. })));
        }

        // Caller a hooking its port into another client's port.
        let cross = h.engine.port_connect(a, a_out, b_in);
        assert_eq!(cross.is_ok(), cross_ok, "{mode:?} cross connect");

        // A third-party patchbay (the caller owns neither port) is
        // always allowed.
        let (c, _) = h.open("c", Behavior::Inline);
        if h.engine.graph().get_connections(a_out).is_empty() {
            assert!(h.engine.port_connect(c, a_out, b_in).is_ok());
        }
    }
}

// The ignore variants are distinct: the connect is a silent no-op.
#[test]
fn test_self_connect_ignore_is_silent() {
    let h = Harness::new(
        SelfConnectMode::IgnoreAll,
        false,
        Duration::from_millis(10),
    );
    let (a, _) = h.open("a", Behavior::Inline);
    let a_out = h.register(a, "a:out1", PortDirection::Output);
    let a_in = h.register(a, "a:in1", PortDirection::Input);
    h.engine.client_activate(a, true).unwrap();

    h.engine.port_connect(a, a_out, a_in).unwrap();
    assert!(h.engine.graph().get_connections(a_out).is_empty());
}

// Disconnect of every connection on a port in one call.
#[test]
fn test_disconnect_all_empties_connection_list() {
    let h = default_harness();
    let (a, _) = h.open("a", Behavior::Inline);
    let (b, _) = h.open("b", Behavior::Inline);

    let a_out = h.register(a, "a:out1", PortDirection::Output);
    let b_in1 = h.register(b, "b:in1", PortDirection::Input);
    let b_in2 = h.register(b, "b:in2", PortDirection::Input);
    h.engine.client_activate(a, true).unwrap();
    h.engine.client_activate(b, true).unwrap();

    h.engine.port_connect(a, a_out, b_in1).unwrap();
    h.engine.port_connect(a, a_out, b_in2).unwrap();
    assert_eq!(h.engine.graph().get_connections(a_out).len(), 2);

    h.engine.port_disconnect_all(a, a_out).unwrap();
    assert!(h.engine.graph().get_connections(a_out).is_empty());
    assert!(h.engine.graph().get_connections(b_in1).is_empty());
}

// S4: one xrun notification per late cycle, and only for the first
// failing cycle after a switch.
#[test]
fn test_xrun_notified_once_per_late_cycle() {
    let h = default_harness();
    let (staller, _) = h.open("stall", Behavior::Stall);
    let (_, listener) = h.open("listener", Behavior::Inline);
    h.engine.client_activate(staller, true).unwrap();

    // Cycle 1 adopts the graph and triggers the staller, which times
    // out. No xrun yet: the failure is only observable next cycle.
    let t1: u64 = 1_000_000;
    h.engine.process(t1, 0);
    assert_eq!(h.pump(), 0);
    assert_eq!(
        h.engine.graph().client_timing(staller).status(),
        ClientStatus::Timeout
    );

    // Cycle 2 sees the unfinished client: exactly one xrun fan-out.
    let period: u64 = 256 * 1_000_000 / 48_000;
    let t2 = t1 + period;
    h.engine.process(t2, t1 + period / 2);
    assert_eq!(h.pump(), 1);
    assert_eq!(listener.count(NotificationKind::XRun), 1);

    // Cycle 3 is past the switch timeout: the engine force-switches
    // instead of reporting the same xrun again.
    let t3 = t2 + period;
    h.engine.process(t3, t2 + period / 2);
    assert_eq!(h.pump(), 0);
    assert_eq!(listener.count(NotificationKind::XRun), 1);
}

// An externally-triggered client that finishes on time.
#[test]
fn test_external_trigger_completes_through_cycle_finished() {
    let h = Harness::new(SelfConnectMode::Allow, false, Duration::from_millis(200));
    let (wake_tx, wake_rx) = unbounded::<u32>();
    let recorder = Arc::new(Recorder::default());
    let refnum = h
        .engine
        .client_internal_open(
            "worker",
            ClientKind::External,
            Arc::new(TestClient {
                recorder,
                behavior: Behavior::Channel(wake_tx),
            }),
            false,
        )
        .unwrap();
    h.engine.client_activate(refnum, true).unwrap();

    // The client's process thread.
    let engine = Arc::clone(&h.engine);
    let worker = std::thread::spawn(move || {
        for _frames in wake_rx.iter().take(2) {
            engine.cycle_running(refnum);
            engine.cycle_finished(refnum);
        }
    });

    h.engine.process(1_000_000, 0);
    assert_eq!(
        h.engine.graph().client_timing(refnum).status(),
        ClientStatus::Finished
    );
    assert!(h.engine.graph().is_finished_graph());
    let finished_at = h.engine.graph().client_timing(refnum).finished_at();
    assert!(finished_at > 0);

    h.engine.process(1_010_000, 1_005_000);
    worker.join().unwrap();
}

// External clients go through the same lifecycle, with the shared
// region indices handed back at open.
#[test]
fn test_external_open_returns_shared_indices() {
    let h = default_harness();
    let recorder = Arc::new(Recorder::default());
    let opened = h
        .engine
        .client_external_open(
            "remote",
            4242,
            Arc::new(TestClient {
                recorder,
                behavior: Behavior::Inline,
            }),
        )
        .unwrap();
    assert_eq!(opened.refnum, 0);
    assert_ne!(opened.shared_engine, opened.shared_graph);
    assert_eq!(h.engine.client_pid("remote"), Some(4242));

    h.engine.client_external_close(opened.refnum).unwrap();
    assert_eq!(h.engine.client_refnum("remote"), None);
}

// Two cycles with no mutations keep the same order; mutations publish
// at the next boundary.
#[test]
fn test_graph_order_is_stable_between_mutations() {
    let h = default_harness();
    let (a, _) = h.open("a", Behavior::Inline);
    let (b, _) = h.open("b", Behavior::Inline);
    h.engine.client_activate(a, true).unwrap();
    h.engine.client_activate(b, true).unwrap();

    h.engine.process(1_000_000, 0);
    let order1 = h.engine.graph().current_order();
    h.engine.process(1_010_000, 1_005_000);
    let order2 = h.engine.graph().current_order();
    assert_eq!(order1, order2);

    // A connection creates an ordering constraint, adopted next cycle.
    let b_out = h.register(b, "b:out", PortDirection::Output);
    let a_in = h.register(a, "a:in", PortDirection::Input);
    h.engine.port_connect(b, b_out, a_in).unwrap();

    h.engine.process(1_020_000, 1_015_000);
    assert_eq!(h.engine.graph().current_order(), vec![b, a]);
}

// Clients hear about each other and about ports and connections.
#[test]
fn test_notification_fan_out() {
    let h = default_harness();
    let (_, first) = h.open("first", Behavior::Inline);
    let (second_ref, _) = h.open("second", Behavior::Inline);

    // The add-client exchange reached the first client.
    assert_eq!(first.count(NotificationKind::AddClient), 1);

    let port = h.register(second_ref, "second:out", PortDirection::Output);
    // Ports of an inactive client are invisible until activation.
    assert_eq!(first.count(NotificationKind::PortRegistrationOn), 0);

    h.engine.client_activate(second_ref, true).unwrap();
    assert_eq!(first.count(NotificationKind::PortRegistrationOn), 1);

    h.engine.port_rename(second_ref, port, "second:main").unwrap();
    let renames: Vec<_> = first
        .all()
        .into_iter()
        .filter_map(|note| match note {
            Notification::PortRenamed { old_name, .. } => Some(old_name),
            _ => None,
        })
        .collect();
    assert_eq!(renames, vec!["second:out".to_string()]);

    h.engine.client_internal_close(second_ref, false).unwrap();
    assert_eq!(first.count(NotificationKind::PortRegistrationOff), 1);
    assert_eq!(first.count(NotificationKind::RemoveClient), 1);
}

// Buffer size changes resize port buffers and notify synchronously.
#[test]
fn test_buffer_size_change_propagates() {
    let h = default_harness();
    let (a, recorder) = h.open("a", Behavior::Inline);
    let port = h.register(a, "a:out", PortDirection::Output);

    h.engine.set_buffer_size(512);
    assert_eq!(
        h.engine.graph().port_buffer(port).unwrap().len(),
        512
    );
    assert!(recorder
        .all()
        .contains(&Notification::BufferSize { frames: 512 }));
}

// Freewheel drops and restores the realtime flag around notifications.
#[test]
fn test_freewheel_toggles_realtime_flag() {
    let graph = Arc::new(GraphManager::new(16, 64));
    let control = Arc::new(EngineControl::new(
        64,
        48000,
        Duration::from_millis(10),
        true,
        10,
        false,
        false,
    ));
    let (rt_tx, _rt_rx) = unbounded();
    let (shutdown_tx, _shutdown_rx) = unbounded();
    let engine = Engine::new(
        Arc::clone(&graph),
        Arc::clone(&control),
        SelfConnectMode::Allow,
        rt_tx,
        shutdown_tx,
    );

    assert!(control.realtime());
    engine.notify_freewheel(true);
    assert!(!control.realtime());
    engine.notify_freewheel(false);
    assert!(control.realtime());
}

// Temporary mode: the last non-driver client leaving raises the exit
// signal.
#[test]
fn test_temporary_mode_signals_exit_on_last_close() {
    let h = Harness::new(SelfConnectMode::Allow, true, Duration::from_millis(10));
    let (a, _) = h.open("a", Behavior::Inline);
    let (b, _) = h.open("b", Behavior::Inline);

    h.engine.client_internal_close(a, false).unwrap();
    assert!(h.shutdown_rx.try_recv().is_err());

    h.engine.client_internal_close(b, false).unwrap();
    assert_eq!(
        h.shutdown_rx.try_recv().unwrap(),
        ShutdownReason::TemporaryExit
    );
}

// Failure notifications reach clients and the shutdown channel.
#[test]
fn test_failure_notifies_and_signals_shutdown() {
    let h = default_harness();
    let (_, recorder) = h.open("a", Behavior::Inline);

    h.engine.notify_failure(-1, "backend died");
    assert_eq!(recorder.count(NotificationKind::ShutDown), 1);
    assert!(matches!(
        h.shutdown_rx.try_recv().unwrap(),
        ShutdownReason::Failure { code: -1, .. }
    ));
}
