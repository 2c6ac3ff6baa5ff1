//! Integration tests for the clock-domain adapter: rate convergence
//! between mismatched clocks, boundary recovery, and the controller
//! contract seen through the public API.

use graph_audio::{AdapterConfig, AdapterHost, AudioAdapter, PiController, Quality, RingSize};

/// Drives host and adapted sides on their own virtual clocks, events
/// interleaved by timestamp, like two free-running callbacks would be.
struct TwoClockSim {
    adapter: AudioAdapter,
    host: AdapterHost,
    host_period_us: u64,
    adapted_period_us: u64,
    next_push_us: u64,
    next_pull_us: u64,
    frames: usize,
    input: Vec<f32>,
    pushes: usize,
    last_capture: Vec<f32>,
}

impl TwoClockSim {
    fn new(config: &AdapterConfig) -> Self {
        let adapter = AudioAdapter::new(config);
        let host = adapter.host();
        let frames = config.host_buffer_size;
        Self {
            adapter,
            host,
            host_period_us: config.host_buffer_size as u64 * 1_000_000
                / u64::from(config.host_sample_rate),
            adapted_period_us: config.adapted_buffer_size as u64 * 1_000_000
                / u64::from(config.adapted_sample_rate),
            next_push_us: 0,
            next_pull_us: 0,
            frames,
            input: (0..frames).map(|i| (i as f32 * 0.01).sin()).collect(),
            pushes: 0,
            last_capture: vec![0.0; frames],
        }
    }

    /// Runs until `pulls` adapted cycles completed, calling `check`
    /// with the capture fill after each one.
    fn run(&mut self, pulls: usize, mut check: impl FnMut(usize, usize)) {
        let mut playback_out = vec![0.0f32; self.frames];
        let mut capture_out = vec![0.0f32; self.frames];
        let silence = vec![0.0f32; self.frames];

        // The adapted side runs once first so the host engages.
        self.adapter
            .pull_and_push(&mut [&mut capture_out[..]], &[&silence[..]]);

        let mut done = 0;
        while done < pulls {
            if self.next_push_us <= self.next_pull_us {
                self.host
                    .push_and_pull(&[&self.input[..]], &mut [&mut playback_out[..]]);
                self.pushes += 1;
                self.next_push_us += self.host_period_us;
            } else {
                self.adapter
                    .pull_and_push(&mut [&mut capture_out[..]], &[&silence[..]]);
                self.last_capture.copy_from_slice(&capture_out);
                self.next_pull_us += self.adapted_period_us;
                done += 1;
                check(done, self.adapter.capture_fill());
            }
        }
    }
}

// S6: mismatched clocks (48kHz host against a 44.1kHz consumer)
// converge: the fill holds near target and the effective consumption
// rate stays within the five percent clamp around the nominal ratio.
#[test]
fn test_adapter_converges_across_mismatched_rates() {
    let config = AdapterConfig {
        host_buffer_size: 1024,
        host_sample_rate: 48000,
        adapted_buffer_size: 1024,
        adapted_sample_rate: 44100,
        capture_channels: 1,
        playback_channels: 1,
        quality: Quality::Linear,
        ring_size: RingSize::Adaptive,
    };

    let ring = 4 * 1024;
    let target = (ring / 2 + 1024 / 2) as i64;
    let bound = (2 * 1024) as i64;

    let mut sim = TwoClockSim::new(&config);
    let fill_start = sim.adapter.capture_fill() as i64;
    sim.run(1000, |pull, fill| {
        // Allow a transient while the controller settles, then the fill
        // must stay within two adapted periods of the target.
        if pull > 100 {
            let deviation = fill as i64 - target;
            assert!(
                deviation.abs() <= bound,
                "pull {pull}: fill {fill} deviates {deviation} from {target}"
            );
        }
    });

    // Conservation: what went in minus the fill delta is what the
    // resamplers consumed. Per pull that must sit inside the clamp
    // around 1024 * 48000/44100.
    let fill_end = sim.adapter.capture_fill() as i64;
    let consumed = sim.pushes as i64 * 1024 - (fill_end - fill_start);
    let per_pull = consumed as f64 / 1001.0;
    let nominal = 1024.0 * 48000.0 / 44100.0;
    assert!(
        per_pull >= nominal * 0.95 && per_pull <= nominal * 1.05,
        "consumption {per_pull} frames/pull outside the clamp around {nominal}"
    );
}

// Equal rates stay pinned at target without ever re-centering hard.
#[test]
fn test_adapter_holds_target_at_equal_rates() {
    let config = AdapterConfig {
        host_buffer_size: 512,
        host_sample_rate: 48000,
        adapted_buffer_size: 512,
        adapted_sample_rate: 48000,
        capture_channels: 1,
        playback_channels: 1,
        quality: Quality::Linear,
        ring_size: RingSize::Adaptive,
    };
    let target = (4 * 512 / 2 + 512 / 2) as i64;

    let mut sim = TwoClockSim::new(&config);
    sim.run(500, |pull, fill| {
        if pull > 20 {
            let deviation = (fill as i64 - target).abs();
            assert!(
                deviation <= 2 * 512,
                "pull {pull}: fill {fill} drifted {deviation} frames"
            );
        }
    });
}

// A host that goes away starves the capture ring; the next adapted
// cycle recovers by re-centering instead of wedging.
#[test]
fn test_adapter_recovers_from_starvation() {
    let config = AdapterConfig {
        host_buffer_size: 256,
        host_sample_rate: 48000,
        adapted_buffer_size: 256,
        adapted_sample_rate: 48000,
        capture_channels: 1,
        playback_channels: 1,
        quality: Quality::Linear,
        ring_size: RingSize::Adaptive,
    };
    let mut adapter = AudioAdapter::new(&config);
    let target = 4 * 256 / 2 + 256 / 2;

    let mut capture_out = vec![0.0f32; 256];
    let silence = vec![0.0f32; 256];

    // No host pushes at all: the ring drains by one period per cycle
    // and trips the lower bound every other cycle. An odd cycle count
    // lands right after a re-center plus one read.
    for _ in 0..7 {
        adapter.pull_and_push(&mut [&mut capture_out[..]], &[&silence[..]]);
    }
    let fill = adapter.capture_fill() as i64;
    assert!(
        (fill - (target as i64 - 256)).abs() <= 2,
        "fill {fill} after starvation recovery, expected near {}",
        target - 256
    );
}

// Property: a controller fed zero error settles back to nominal within
// a bounded number of iterations, even after heavy wind-up.
#[test]
fn test_controller_returns_to_nominal() {
    let nominal = 48000.0 / 44100.0;
    let mut pi = PiController::new(nominal);

    for _ in 0..1000 {
        pi.ratio(1500.0);
    }
    let mut ratio = pi.ratio(0.0);
    assert!(ratio > nominal);

    for _ in 0..5000 {
        ratio = pi.ratio(0.0);
    }
    assert!(
        (ratio - nominal).abs() < 1e-6 * nominal,
        "ratio {ratio} did not settle to {nominal}"
    );
}

// Cubic quality moves audio too, end to end.
#[test]
fn test_cubic_quality_round_trip() {
    let config = AdapterConfig {
        host_buffer_size: 256,
        host_sample_rate: 48000,
        adapted_buffer_size: 256,
        adapted_sample_rate: 44100,
        capture_channels: 1,
        playback_channels: 0,
        quality: Quality::Cubic,
        ring_size: RingSize::Adaptive,
    };
    let mut sim = TwoClockSim::new(&config);
    sim.run(50, |_, _| {});
    // Signal made it across the clock boundary through the cubic path.
    assert!(
        sim.last_capture.iter().any(|&s| s.abs() > 1e-3),
        "no signal flowed through the cubic resampler"
    );
}
