//! Timer-based backend: no device, just a paced cycle.
//!
//! Useful for running the server on machines without audio hardware and
//! for tests. Each cycle records its begin time on read and sleeps the
//! remainder of the configured wait on write, so the cycle rate matches
//! what a real device at the same period and rate would deliver.

use std::time::{Duration, Instant};

use super::{
    Backend, ConfiguredDriver, DriverContext, DriverDescriptor, DriverParam, OpenParams,
    ParamValue,
};
use crate::error::DriverError;

/// What the dummy backend advertises.
pub fn descriptor() -> DriverDescriptor {
    DriverDescriptor {
        name: "dummy".to_string(),
        description: "Timer based backend".to_string(),
        params: vec![
            DriverParam::new(
                "capture",
                'C',
                ParamValue::UInt(2),
                "Number of capture ports",
            ),
            DriverParam::new(
                "playback",
                'P',
                ParamValue::UInt(2),
                "Number of playback ports",
            ),
            DriverParam::new("rate", 'r', ParamValue::UInt(48000), "Sample rate"),
            DriverParam::new(
                "monitor",
                'm',
                ParamValue::Bool(false),
                "Provide monitor ports for the output",
            ),
            DriverParam::new("period", 'p', ParamValue::UInt(1024), "Frames per period"),
            DriverParam::new(
                "wait",
                'w',
                ParamValue::UInt(0),
                "Number of usecs to wait between engine processes",
            ),
        ],
    }
}

/// Resolves parameters into a ready-to-start dummy driver. A zero
/// `wait` derives the wait from period and rate.
pub fn initialize(overrides: &[DriverParam]) -> Result<ConfiguredDriver, DriverError> {
    let desc = descriptor();
    let get = |c: char| desc.resolve(overrides, c);

    let capture_ports = get('C').and_then(|v| v.as_u32()).unwrap_or(2);
    let playback_ports = get('P').and_then(|v| v.as_u32()).unwrap_or(2);
    let sample_rate = get('r').and_then(|v| v.as_u32()).unwrap_or(48000);
    let monitor = get('m').and_then(|v| v.as_bool()).unwrap_or(false);
    let period_size = get('p').and_then(|v| v.as_u32()).unwrap_or(1024);
    let mut wait_us = u64::from(get('w').and_then(|v| v.as_u32()).unwrap_or(0));

    if sample_rate == 0 || period_size == 0 {
        return Err(DriverError::backend("rate and period must be nonzero"));
    }
    if wait_us == 0 {
        wait_us = wait_from(period_size, sample_rate);
    }

    Ok(ConfiguredDriver {
        backend: Box::new(DummyBackend {
            wait_us,
            sample_rate,
            begin: None,
        }),
        open: OpenParams {
            buffer_size: period_size,
            sample_rate,
            capturing: true,
            playing: true,
            in_channels: capture_ports as usize,
            out_channels: playback_ports as usize,
            monitor,
            capture_name: "dummy".to_string(),
            playback_name: "dummy".to_string(),
            capture_latency: 0,
            playback_latency: 0,
        },
    })
}

fn wait_from(period: u32, rate: u32) -> u64 {
    u64::from(period) * 1_000_000 / u64::from(rate)
}

struct DummyBackend {
    wait_us: u64,
    sample_rate: u32,
    begin: Option<Instant>,
}

impl Backend for DummyBackend {
    fn name(&self) -> &str {
        "dummy"
    }

    fn read(&mut self, _ctx: &DriverContext) -> Result<(), DriverError> {
        self.begin = Some(Instant::now());
        Ok(())
    }

    fn write(&mut self, _ctx: &DriverContext) -> Result<(), DriverError> {
        // Sleep whatever the cycle left of the period.
        if let Some(begin) = self.begin {
            let elapsed = begin.elapsed();
            let wait = Duration::from_micros(self.wait_us);
            if elapsed < wait {
                std::thread::sleep(wait - elapsed);
            }
        }
        Ok(())
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<(), DriverError> {
        self.wait_us = wait_from(frames, self.sample_rate);
        Ok(())
    }
}
