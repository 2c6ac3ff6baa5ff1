//! Server lifecycle.
//!
//! One [`Server`] owns the engine, the graph manager, the control block
//! and the primary driver thread. It replaces the global singleton of
//! older designs with an explicit object: build it with
//! [`Server::start`], hand out [`Server::engine`] to in-process
//! clients, and tear everything down with [`Server::stop`].
//!
//! Unrecoverable conditions never unwind through the stack; they are
//! posted as a [`ShutdownReason`] on the shutdown channel, which the
//! embedder's main loop reads to decide when to exit.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::ServerConfig;
use crate::driver::{AudioDriver, ConfiguredDriver, ThreadedDriver};
use crate::engine::control::EngineControl;
use crate::engine::Engine;
use crate::error::DriverError;
use crate::graph::GraphManager;

/// Why the server is going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Temporary mode: the last external client closed.
    TemporaryExit,
    /// Something unrecoverable happened.
    Failure {
        /// Process exit code the embedder should use.
        code: i32,
        /// Human-readable description.
        reason: String,
    },
}

/// A running audio server.
pub struct Server {
    engine: Arc<Engine>,
    graph: Arc<GraphManager>,
    control: Arc<EngineControl>,
    driver: Option<ThreadedDriver>,
    pump: Option<JoinHandle<()>>,
    pump_stop: Sender<()>,
    shutdown_rx: Receiver<ShutdownReason>,
}

impl Server {
    /// Builds the shared state, opens and starts the driver, and spawns
    /// the notification pump.
    pub fn start(config: ServerConfig, driver: ConfiguredDriver) -> Result<Self, DriverError> {
        tracing::info!(name = %config.name, "starting server");

        let control = Arc::new(EngineControl::new(
            driver.open.buffer_size,
            driver.open.sample_rate,
            config.client_timeout,
            config.realtime,
            config.realtime_priority,
            config.temporary,
            config.sync,
        ));
        let graph = Arc::new(GraphManager::new(
            config.port_max,
            driver.open.buffer_size as usize,
        ));

        let (rt_tx, rt_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let engine = Arc::new(Engine::new(
            Arc::clone(&graph),
            Arc::clone(&control),
            config.self_connect_mode,
            rt_tx,
            shutdown_tx,
        ));

        // Realtime-path notifications are fanned out from this thread,
        // never from the cycle itself.
        let (pump_stop, pump_stop_rx) = unbounded();
        let pump_engine = Arc::clone(&engine);
        let pump = std::thread::Builder::new()
            .name("graph-audio-notify".to_string())
            .spawn(move || notification_pump(&pump_engine, &rt_rx, &pump_stop_rx))
            .map_err(|err| DriverError::backend(format!("cannot spawn pump: {err}")))?;

        let mut audio_driver = AudioDriver::open(
            Arc::clone(&engine),
            driver.backend,
            driver.open,
        )?;
        audio_driver.attach()?;
        let driver = ThreadedDriver::start(audio_driver)?;

        Ok(Self {
            engine,
            graph,
            control,
            driver: Some(driver),
            pump: Some(pump),
            pump_stop,
            shutdown_rx,
        })
    }

    /// The engine, for in-process clients and request servicing.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The graph manager region, arena index 1.
    pub fn graph(&self) -> &Arc<GraphManager> {
        &self.graph
    }

    /// The engine control region, arena index 0.
    pub fn control(&self) -> &Arc<EngineControl> {
        &self.control
    }

    /// The channel carrying the exit signal. Clone-free: the receiver
    /// is shared by reference.
    pub fn shutdown_channel(&self) -> &Receiver<ShutdownReason> {
        &self.shutdown_rx
    }

    /// Blocks until something posts a shutdown reason.
    pub fn wait_for_shutdown(&self) -> ShutdownReason {
        match self.shutdown_rx.recv() {
            Ok(reason) => reason,
            // All senders gone means the engine was torn down already.
            Err(_) => ShutdownReason::Failure {
                code: -1,
                reason: "shutdown channel closed".to_string(),
            },
        }
    }

    /// Stops the driver thread and the notification pump, in that
    /// order, then drops the shared state.
    pub fn stop(mut self) -> Result<(), DriverError> {
        tracing::info!("stopping server");
        if let Some(driver) = self.driver.take() {
            driver.stop()?;
        }
        let _ = self.pump_stop.send(());
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            tracing::warn!("server dropped without stop(), stopping driver");
            let _ = driver.stop();
        }
        let _ = self.pump_stop.send(());
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn notification_pump(
    engine: &Arc<Engine>,
    notifications: &Receiver<crate::event::Notification>,
    stop: &Receiver<()>,
) {
    loop {
        crossbeam_channel::select! {
            recv(notifications) -> note => match note {
                Ok(note) => engine.notify_all(&note),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    // Drain anything the cycle posted while we were stopping.
    while let Ok(note) = notifications.try_recv() {
        engine.notify_all(&note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::dummy;
    use crate::driver::{DriverParam, ParamValue};
    use std::time::Duration;

    fn quiet_config() -> ServerConfig {
        ServerConfig {
            client_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_server_start_and_stop() {
        let driver = dummy::initialize(&[
            DriverParam::set('p', ParamValue::UInt(64)),
            DriverParam::set('r', ParamValue::UInt(48000)),
            // Spin fast so the test does not sleep through real periods.
            DriverParam::set('w', ParamValue::UInt(500)),
        ])
        .unwrap();
        let server = Server::start(quiet_config(), driver).unwrap();

        // The driver occupies the first slot and registers its ports.
        assert_eq!(server.engine().client_refnum("system"), Some(0));
        assert!(server.graph().get_port("system:capture_1").is_some());
        assert!(server.graph().get_port("system:playback_1").is_some());

        server.stop().unwrap();
    }

    #[test]
    fn test_shutdown_channel_is_empty_until_signalled() {
        let driver = dummy::initialize(&[DriverParam::set('w', ParamValue::UInt(500))]).unwrap();
        let server = Server::start(quiet_config(), driver).unwrap();
        assert!(server.shutdown_channel().try_recv().is_err());
        server.stop().unwrap();
    }
}
