//! The engine control block: period parameters, realtime flags, and
//! rolling cycle statistics.
//!
//! One instance is shared by the engine, the drivers and (conceptually)
//! every client; in the original system this block lives in shared
//! memory and clients hold an index to it. Readers on the realtime path
//! see plain atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Entries in the rolling cycle-time window.
const ROLLING_COUNT: usize = 32;

#[derive(Debug, Default)]
struct RollingStats {
    window: [u64; ROLLING_COUNT],
    index: usize,
    filled: bool,
    last_begin_us: u64,
}

/// Shared engine parameters and timing statistics.
#[derive(Debug)]
pub struct EngineControl {
    buffer_size: AtomicU32,
    sample_rate: AtomicU32,
    period_us: AtomicU64,
    client_timeout_us: AtomicU64,
    realtime: AtomicBool,
    saved_realtime: AtomicBool,
    realtime_priority: i32,
    temporary: AtomicBool,
    sync_mode: bool,
    /// Load percentage, f32 bits. Written by the cycle, read anywhere.
    cpu_load_bits: AtomicU32,
    max_cycle_us: AtomicU64,
    stats: Mutex<RollingStats>,
    epoch: Instant,
}

impl EngineControl {
    /// Creates a control block for the given period configuration.
    pub fn new(
        buffer_size: u32,
        sample_rate: u32,
        client_timeout: std::time::Duration,
        realtime: bool,
        realtime_priority: i32,
        temporary: bool,
        sync_mode: bool,
    ) -> Self {
        let control = Self {
            buffer_size: AtomicU32::new(buffer_size),
            sample_rate: AtomicU32::new(sample_rate.max(1)),
            period_us: AtomicU64::new(0),
            client_timeout_us: AtomicU64::new(client_timeout.as_micros() as u64),
            realtime: AtomicBool::new(realtime),
            saved_realtime: AtomicBool::new(false),
            realtime_priority,
            temporary: AtomicBool::new(temporary),
            sync_mode,
            cpu_load_bits: AtomicU32::new(0.0f32.to_bits()),
            max_cycle_us: AtomicU64::new(0),
            stats: Mutex::new(RollingStats::default()),
            epoch: Instant::now(),
        };
        control.recompute_period();
        control
    }

    fn recompute_period(&self) {
        let frames = u64::from(self.buffer_size.load(Ordering::Relaxed));
        let rate = u64::from(self.sample_rate.load(Ordering::Relaxed));
        self.period_us
            .store(frames * 1_000_000 / rate.max(1), Ordering::Relaxed);
    }

    /// Microseconds on the engine's monotonic clock.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Frames per period.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Relaxed)
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// One period, in microseconds.
    pub fn period_us(&self) -> u64 {
        self.period_us.load(Ordering::Relaxed)
    }

    /// Per-client cycle wait, in microseconds.
    pub fn client_timeout_us(&self) -> u64 {
        self.client_timeout_us.load(Ordering::Relaxed)
    }

    /// Whether the cycle runs under realtime scheduling right now.
    pub fn realtime(&self) -> bool {
        self.realtime.load(Ordering::Relaxed)
    }

    /// Configured realtime priority.
    pub fn realtime_priority(&self) -> i32 {
        self.realtime_priority
    }

    /// Whether the graph runs in synchronous mode.
    pub fn sync_mode(&self) -> bool {
        self.sync_mode
    }

    /// Whether the server exits with its last external client.
    pub fn temporary(&self) -> bool {
        self.temporary.load(Ordering::Relaxed)
    }

    /// Clears temporary mode (used once the exit signal is raised).
    pub fn clear_temporary(&self) {
        self.temporary.store(false, Ordering::Relaxed);
    }

    /// Updates the period length and derived timing.
    pub fn set_buffer_size(&self, frames: u32) {
        self.buffer_size.store(frames, Ordering::Relaxed);
        self.recompute_period();
    }

    /// Updates the sample rate and derived timing.
    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate.max(1), Ordering::Relaxed);
        self.recompute_period();
    }

    /// Drops realtime scheduling for freewheel, remembering the old
    /// state.
    pub fn save_realtime(&self) {
        self.saved_realtime
            .store(self.realtime.load(Ordering::Relaxed), Ordering::Relaxed);
        self.realtime.store(false, Ordering::Relaxed);
    }

    /// Restores the pre-freewheel scheduling state.
    pub fn restore_realtime(&self) {
        self.realtime.store(
            self.saved_realtime.swap(false, Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    /// Smoothed DSP load over the rolling window, percent of a period.
    pub fn cpu_load(&self) -> f32 {
        f32::from_bits(self.cpu_load_bits.load(Ordering::Relaxed))
    }

    /// Longest observed cycle since the last stats reset, microseconds.
    pub fn max_cycle_us(&self) -> u64 {
        self.max_cycle_us.load(Ordering::Relaxed)
    }

    /// Folds a new cycle boundary into the rolling statistics. `prev_end`
    /// is when the previous cycle's work finished; the window tracks
    /// work time as a share of the period.
    pub fn cycle_begin(&self, cur_begin_us: u64, prev_end_us: u64) {
        let mut stats = self.stats.lock();
        if stats.last_begin_us > 0 && prev_end_us > stats.last_begin_us {
            let work = prev_end_us - stats.last_begin_us;
            let idx = stats.index;
            stats.window[idx] = work;
            stats.index = (stats.index + 1) % ROLLING_COUNT;
            if stats.index == 0 {
                stats.filled = true;
            }
            self.max_cycle_us.fetch_max(work, Ordering::Relaxed);

            let len = if stats.filled {
                ROLLING_COUNT
            } else {
                stats.index.max(1)
            };
            let peak = stats.window[..len].iter().copied().max().unwrap_or(0);
            let period = self.period_us().max(1);
            let load = (peak as f32 / period as f32) * 100.0;
            self.cpu_load_bits.store(load.to_bits(), Ordering::Relaxed);
        }
        stats.last_begin_us = cur_begin_us;
    }

    /// Closes out one cycle's accounting. Present for symmetry with
    /// `cycle_begin`; all derived values refresh on the next begin.
    pub fn cycle_end(&self, _end_us: u64) {}

    /// Forgets rolling statistics, as done whenever a client joins or
    /// leaves.
    pub fn reset_rolling_stats(&self) {
        let mut stats = self.stats.lock();
        *stats = RollingStats::default();
        self.max_cycle_us.store(0, Ordering::Relaxed);
        self.cpu_load_bits
            .store(0.0f32.to_bits(), Ordering::Relaxed);
    }
}
