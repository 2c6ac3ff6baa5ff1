//! Clock-domain bridge between a host audio callback and an off-clock
//! consumer.
//!
//! The adapter owns one resampling pipe per capture and playback
//! channel. The *host* side (the thread that owns the real device)
//! pushes captured input and pulls playback output with raw,
//! non-converting transfers. The *adapted* side (a foreign clock) drains
//! and feeds the same pipes through sample-rate converters whose ratio
//! is steered by a PI controller per direction, so the two clock domains
//! converge without a shared clock.
//!
//! The two sides are split into separate handles, [`AdapterHost`] for
//! the device callback and [`AudioAdapter`] for the adapted thread,
//! the same way a ring buffer splits into producer and consumer halves.
//! Neither side ever takes a lock.

mod controller;
mod resampler;
mod ringpipe;

pub use controller::PiController;
pub use resampler::{Quality, Resampler};
pub use ringpipe::RingPipe;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Hard ceiling on the ring size, in frames per channel. Fixed sizes are
/// clamped here and adaptive growth stops here.
pub const MAX_RING_FRAMES: usize = 32 * 1024;

/// How the adapter sizes its rings at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RingSize {
    /// `4 * max(host_buffer, adapted_buffer)` frames.
    #[default]
    Adaptive,
    /// A fixed frame count, clamped to [`MAX_RING_FRAMES`].
    Fixed(usize),
}

/// Static description of one adapter instance.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Frames per period on the host (device) side.
    pub host_buffer_size: usize,
    /// Host sample rate in Hz.
    pub host_sample_rate: u32,
    /// Frames per period on the adapted side.
    pub adapted_buffer_size: usize,
    /// Adapted sample rate in Hz.
    pub adapted_sample_rate: u32,
    /// Capture channels (host input -> adapted consumer).
    pub capture_channels: usize,
    /// Playback channels (adapted producer -> host output).
    pub playback_channels: usize,
    /// Converter quality.
    pub quality: Quality,
    /// Ring sizing policy.
    pub ring_size: RingSize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            host_buffer_size: 1024,
            host_sample_rate: 48000,
            adapted_buffer_size: 1024,
            adapted_sample_rate: 48000,
            capture_channels: 2,
            playback_channels: 2,
            quality: Quality::default(),
            ring_size: RingSize::default(),
        }
    }
}

/// State shared by the two sides.
struct AdapterShared {
    capture_pipes: Vec<Arc<RingPipe>>,
    playback_pipes: Vec<Arc<RingPipe>>,
    /// Set by the adapted side's first cycle; until then the host side
    /// is a no-op so the rings keep their primed fill.
    running: AtomicBool,
    /// Microseconds (since `epoch`) of the last host push, zero before
    /// the first one.
    last_push_us: AtomicU64,
    epoch: Instant,
}

impl AdapterShared {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// The host-clock half of an adapter: raw transfers only, safe to call
/// from a device callback.
#[derive(Clone)]
pub struct AdapterHost {
    shared: Arc<AdapterShared>,
}

impl AdapterHost {
    /// Pushes captured frames into the capture pipes and pulls playback
    /// frames out of the playback pipes, then records the push
    /// timestamp. Called once per host period.
    ///
    /// Does nothing until the adapted side has run its first cycle.
    /// Returns `false` if any pipe over- or underran; recovery is the
    /// adapted side's job.
    pub fn push_and_pull(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> bool {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            for out in outputs.iter_mut() {
                out.fill(0.0);
            }
            return true;
        }

        let mut clean = true;
        for (pipe, input) in shared.capture_pipes.iter().zip(inputs) {
            if pipe.write_space_samples() < input.len() {
                clean = false;
            }
            pipe.write_exact_samples(input);
        }
        for (pipe, output) in shared.playback_pipes.iter().zip(outputs.iter_mut()) {
            if pipe.read_space_samples() < output.len() {
                clean = false;
            }
            pipe.read_exact_samples(output);
        }

        shared
            .last_push_us
            .store(shared.now_us().max(1), Ordering::Release);
        clean
    }
}

/// The adapted-clock half: resampling transfers plus ratio control.
pub struct AudioAdapter {
    shared: Arc<AdapterShared>,
    capture: Vec<Resampler>,
    playback: Vec<Resampler>,
    pi_capture: PiController,
    pi_playback: PiController,
    host_buffer_size: usize,
    adapted_buffer_size: usize,
    adapted_sample_rate: u32,
    /// Current ring size in frames per channel.
    ring_frames: usize,
}

impl AudioAdapter {
    /// Builds the adapter and primes every ring at its target fill.
    pub fn new(config: &AdapterConfig) -> Self {
        let ring_frames = match config.ring_size {
            RingSize::Adaptive => 4 * config.host_buffer_size.max(config.adapted_buffer_size),
            RingSize::Fixed(frames) => frames.min(MAX_RING_FRAMES),
        };
        tracing::info!(
            ring_frames,
            adaptive = matches!(config.ring_size, RingSize::Adaptive),
            "adapter ringbuffer size"
        );

        let capture: Vec<Resampler> = (0..config.capture_channels)
            .map(|_| Resampler::new(config.quality, MAX_RING_FRAMES))
            .collect();
        let playback: Vec<Resampler> = (0..config.playback_channels)
            .map(|_| Resampler::new(config.quality, MAX_RING_FRAMES))
            .collect();

        let shared = Arc::new(AdapterShared {
            capture_pipes: capture.iter().map(Resampler::pipe).collect(),
            playback_pipes: playback.iter().map(Resampler::pipe).collect(),
            running: AtomicBool::new(false),
            last_push_us: AtomicU64::new(0),
            epoch: Instant::now(),
        });

        let nominal = f64::from(config.host_sample_rate) / f64::from(config.adapted_sample_rate);
        let mut adapter = Self {
            shared,
            capture,
            playback,
            pi_capture: PiController::new(nominal),
            pi_playback: PiController::new(nominal),
            host_buffer_size: config.host_buffer_size,
            adapted_buffer_size: config.adapted_buffer_size,
            adapted_sample_rate: config.adapted_sample_rate,
            ring_frames,
        };
        adapter.reset();
        adapter
    }

    /// The host-side handle. Clone it into the device callback.
    pub fn host(&self) -> AdapterHost {
        AdapterHost {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current ring size in frames per channel.
    pub fn ring_frames(&self) -> usize {
        self.ring_frames
    }

    /// Readable frames in the first capture ring: the fill level the
    /// capture controller steers. Zero without capture channels.
    pub fn capture_fill(&self) -> usize {
        self.capture.first().map_or(0, Resampler::read_space)
    }

    /// Readable frames in the first playback ring. Zero without
    /// playback channels.
    pub fn playback_fill(&self) -> usize {
        self.playback.first().map_or(0, Resampler::read_space)
    }

    /// Capture fill target: half the ring plus half a host period.
    fn capture_target(&self) -> usize {
        self.ring_frames / 2 + self.host_buffer_size / 2
    }

    /// Playback fill target, expressed as read space.
    fn playback_target(&self) -> usize {
        self.ring_frames / 2 - self.host_buffer_size / 2 + self.adapted_buffer_size
    }

    /// Re-centers every ring at its target fill and stops the host side
    /// until the adapted side runs again. Not realtime-safe.
    pub fn reset(&mut self) {
        self.ring_frames = self.ring_frames.min(MAX_RING_FRAMES);
        let (ring, host_half) = (self.ring_frames, self.host_buffer_size / 2);
        for rs in &mut self.capture {
            rs.reset(ring);
            rs.hard_adjust_read(ring / 2 + host_half);
        }
        for rs in &mut self.playback {
            rs.reset(ring);
            rs.hard_adjust_write(ring / 2 - host_half);
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.last_push_us.store(0, Ordering::Release);
    }

    /// Doubles the ring size for the next [`reset`](Self::reset).
    ///
    /// The caller decides when repeated boundary events warrant growth;
    /// the adapter only provides the mechanism.
    pub fn grow_ring_buffer(&mut self) {
        self.ring_frames = (self.ring_frames * 2).min(MAX_RING_FRAMES);
        tracing::info!(ring_frames = self.ring_frames, "adapter ringbuffer grown");
    }

    /// One adapted-side cycle: refresh the ratio from the fill error,
    /// then read-resample capture into `capture_out` and write-resample
    /// `playback_in` toward the host.
    ///
    /// Called once per adapted period from the adapted thread.
    pub fn pull_and_push(&mut self, capture_out: &mut [&mut [f32]], playback_in: &[&[f32]]) {
        self.shared.running.store(true, Ordering::Release);

        // Finer estimate of where the host is inside its period: frames
        // (at the adapted rate) elapsed since the last push.
        let last_push = self.shared.last_push_us.load(Ordering::Acquire);
        let delta_frames = if last_push > 0 {
            let elapsed = self.shared.now_us().saturating_sub(last_push);
            (elapsed as f64 * f64::from(self.adapted_sample_rate) / 1.0e6) as i64
        } else {
            0
        };

        let ring = self.ring_frames;
        let host = self.host_buffer_size;
        let adapted = self.adapted_buffer_size;

        if !self.capture.is_empty() {
            let fill = self.capture[0].read_space();
            if fill < host + 10 || fill > ring || self.capture[0].has_xrun() {
                tracing::warn!(fill, ring, "capture ring out of bounds, re-centering");
                let target = self.capture_target();
                for rs in &mut self.capture {
                    rs.hard_adjust_read(target);
                }
                self.pi_capture.out_of_bounds();
            }

            let error = fill as i64 - self.capture_target() as i64 + delta_frames;
            let ratio = self.pi_capture.ratio(error as f64);
            for (rs, out) in self.capture.iter_mut().zip(capture_out.iter_mut()) {
                rs.set_ratio(1.0 / ratio);
                let frames = out.len();
                if rs.read_resample(out) < frames {
                    tracing::debug!("capture ring ran short this cycle");
                }
            }
        }

        if !self.playback.is_empty() {
            let fill = self.playback[0].read_space();
            if fill < adapted + 2 || fill > ring + adapted || self.playback[0].has_xrun() {
                tracing::warn!(fill, ring, "playback ring out of bounds, re-centering");
                let target = self.playback_target();
                for rs in &mut self.playback {
                    rs.hard_adjust_write(target);
                }
                self.pi_playback.out_of_bounds();
            }

            let error = fill as i64 - self.playback_target() as i64 - delta_frames;
            let ratio = self.pi_playback.ratio(error as f64);
            for (rs, input) in self.playback.iter_mut().zip(playback_in) {
                rs.set_ratio(ratio);
                if rs.write_resample(input) < input.len() {
                    tracing::warn!("playback ring overflow, resetting pipe");
                    rs.reset(ring);
                }
            }
        }
    }
}

impl std::fmt::Debug for AudioAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioAdapter")
            .field("capture_channels", &self.capture.len())
            .field("playback_channels", &self.playback.len())
            .field("ring_frames", &self.ring_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdapterConfig {
        AdapterConfig {
            host_buffer_size: 256,
            host_sample_rate: 48000,
            adapted_buffer_size: 256,
            adapted_sample_rate: 48000,
            capture_channels: 1,
            playback_channels: 1,
            quality: Quality::Linear,
            ring_size: RingSize::Adaptive,
        }
    }

    #[test]
    fn test_adaptive_sizing_is_four_periods() {
        let adapter = AudioAdapter::new(&config());
        assert_eq!(adapter.ring_frames(), 4 * 256);

        let mut cfg = config();
        cfg.adapted_buffer_size = 512;
        let adapter = AudioAdapter::new(&cfg);
        assert_eq!(adapter.ring_frames(), 4 * 512);
    }

    #[test]
    fn test_fixed_sizing_is_clamped() {
        let mut cfg = config();
        cfg.ring_size = RingSize::Fixed(1 << 20);
        let adapter = AudioAdapter::new(&cfg);
        assert_eq!(adapter.ring_frames(), MAX_RING_FRAMES);
    }

    #[test]
    fn test_host_side_is_noop_until_adapted_side_runs() {
        let adapter = AudioAdapter::new(&config());
        let host = adapter.host();

        let input = vec![1.0f32; 256];
        let mut output = vec![0.5f32; 256];
        let before = adapter.capture[0].read_space();
        assert!(host.push_and_pull(&[&input], &mut [&mut output[..]]));

        // Nothing moved, playback output silenced.
        assert_eq!(adapter.capture[0].read_space(), before);
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_create_primes_rings_at_target_fill() {
        let adapter = AudioAdapter::new(&config());
        // Capture: half ring plus half a host period readable.
        assert_eq!(adapter.capture[0].read_space(), 1024 / 2 + 128);
        // Playback: half ring minus half a host period writable.
        assert_eq!(adapter.playback[0].write_space(), 1024 / 2 - 128);
    }

    #[test]
    fn test_grow_doubles_until_max() {
        let mut adapter = AudioAdapter::new(&config());
        adapter.grow_ring_buffer();
        assert_eq!(adapter.ring_frames(), 2048);
        for _ in 0..20 {
            adapter.grow_ring_buffer();
        }
        assert_eq!(adapter.ring_frames(), MAX_RING_FRAMES);
    }

    #[test]
    fn test_recenter_restores_target_exactly() {
        let mut adapter = AudioAdapter::new(&config());
        let host = adapter.host();

        let input = vec![0.1f32; 256];
        let mut capture_out = vec![0.0f32; 256];
        let silence = vec![0.0f32; 256];
        let mut playback_out = vec![0.0f32; 256];

        // Run once so the host side engages, then flood the capture
        // ring past its upper bound.
        adapter.pull_and_push(&mut [&mut capture_out[..]], &[&silence]);
        for _ in 0..16 {
            host.push_and_pull(&[&input], &mut [&mut playback_out[..]]);
        }

        adapter.pull_and_push(&mut [&mut capture_out[..]], &[&silence]);
        // The out-of-bounds path re-centered before this cycle's read,
        // which then consumed one adapted period at the nominal ratio.
        let fill = adapter.capture[0].read_space();
        let target = adapter.capture_target() as i64;
        assert!(
            (fill as i64 - target).abs() <= 256 + 1,
            "fill {fill} not within one period of {target}"
        );
    }
}
