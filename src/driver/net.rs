//! Network backend: the server side of a UDP audio link.
//!
//! The backend binds a UDP port and waits for a master to start sending
//! period packets. The first source heard becomes the master; its
//! packets carry float32 audio (big-endian) and opaque MIDI payloads,
//! one slice per channel, which the read path renders into the driver's
//! port buffers. The write path encodes the playback buffers the same
//! way and sends them back to the master's reply port, fragmented to
//! the MTU.
//!
//! A cycle with no usable packet by its deadline is a *null cycle*: the
//! capture buffers go silent and the miss is counted, but the engine
//! still runs so local clients keep their cadence.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use bytes::BufMut;

use super::wire::{send_fragmented, PacketCache, PacketHeader, HEADER_LEN};
use super::{
    Backend, ConfiguredDriver, DriverContext, DriverDescriptor, DriverParam, OpenParams,
    ParamValue,
};
use crate::error::DriverError;
use crate::graph::{LatencyRange, PortBuffer, PortDirection, PortFlags, PortType};

/// Link pacing presets, mapped onto the header's latency field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetMode {
    /// Three periods of slack.
    Slow,
    /// Two periods of slack.
    #[default]
    Normal,
    /// One period of slack.
    Fast,
}

impl NetMode {
    fn from_str(mode: &str) -> Self {
        match mode {
            "slow" => Self::Slow,
            "fast" => Self::Fast,
            _ => Self::Normal,
        }
    }

    fn latency(self) -> u32 {
        match self {
            Self::Slow => 3,
            Self::Normal => 2,
            Self::Fast => 1,
        }
    }
}

/// What the network backend advertises.
pub fn descriptor() -> DriverDescriptor {
    DriverDescriptor {
        name: "net".to_string(),
        description: "UDP network backend".to_string(),
        params: vec![
            DriverParam::new("port", 'p', ParamValue::UInt(19000), "UDP port to listen on"),
            DriverParam::new("mtu", 'M', ParamValue::UInt(1500), "Maximum transfer unit"),
            DriverParam::new(
                "audio-ins",
                'C',
                ParamValue::UInt(2),
                "Number of audio capture channels",
            ),
            DriverParam::new(
                "audio-outs",
                'P',
                ParamValue::UInt(2),
                "Number of audio playback channels",
            ),
            DriverParam::new(
                "midi-ins",
                'i',
                ParamValue::UInt(0),
                "Number of midi capture channels",
            ),
            DriverParam::new(
                "midi-outs",
                'o',
                ParamValue::UInt(0),
                "Number of midi playback channels",
            ),
            DriverParam::new(
                "rate",
                'r',
                ParamValue::UInt(48000),
                "Sample rate",
            ),
            DriverParam::new(
                "period",
                'n',
                ParamValue::UInt(1024),
                "Frames per period",
            ),
            DriverParam::new(
                "transport-sync",
                't',
                ParamValue::Bool(false),
                "Mirror transport state onto the link",
            ),
            DriverParam::new(
                "mode",
                'm',
                ParamValue::Str("normal".to_string()),
                "Link mode: slow, normal or fast",
            ),
        ],
    }
}

/// Resolves parameters into a ready-to-start network driver.
pub fn initialize(overrides: &[DriverParam]) -> Result<ConfiguredDriver, DriverError> {
    let desc = descriptor();
    let get = |c: char| desc.resolve(overrides, c);

    let udp_port = get('p').and_then(|v| v.as_u32()).unwrap_or(19000) as u16;
    let mtu = get('M').and_then(|v| v.as_u32()).unwrap_or(1500) as usize;
    let audio_ins = get('C').and_then(|v| v.as_u32()).unwrap_or(2) as usize;
    let audio_outs = get('P').and_then(|v| v.as_u32()).unwrap_or(2) as usize;
    let midi_ins = get('i').and_then(|v| v.as_u32()).unwrap_or(0) as usize;
    let midi_outs = get('o').and_then(|v| v.as_u32()).unwrap_or(0) as usize;
    let sample_rate = get('r').and_then(|v| v.as_u32()).unwrap_or(48000);
    let period_size = get('n').and_then(|v| v.as_u32()).unwrap_or(1024);
    let transport_sync = get('t').and_then(|v| v.as_bool()).unwrap_or(false);
    let mode = get('m')
        .as_ref()
        .and_then(ParamValue::as_str)
        .map(NetMode::from_str)
        .unwrap_or_default();

    if mtu <= HEADER_LEN {
        return Err(DriverError::backend("mtu too small for the packet header"));
    }

    let backend = NetBackend {
        udp_port,
        mtu,
        midi_ins,
        midi_outs,
        transport_sync,
        mode,
        period_size,
        sample_rate,
        socket: None,
        cache: None,
        midi_capture_buffers: Vec::new(),
        midi_playback_buffers: Vec::new(),
        expected_framecnt: 0,
        reply_to: None,
        null_cycles: 0,
        cycle_deadline: None,
    };
    Ok(ConfiguredDriver {
        backend: Box::new(backend),
        open: OpenParams {
            buffer_size: period_size,
            sample_rate,
            capturing: audio_ins > 0,
            playing: audio_outs > 0,
            in_channels: audio_ins,
            out_channels: audio_outs,
            monitor: false,
            capture_name: "net".to_string(),
            playback_name: "net".to_string(),
            capture_latency: mode.latency() * period_size,
            playback_latency: mode.latency() * period_size,
        },
    })
}

struct NetBackend {
    udp_port: u16,
    mtu: usize,
    midi_ins: usize,
    midi_outs: usize,
    transport_sync: bool,
    mode: NetMode,
    period_size: u32,
    sample_rate: u32,
    socket: Option<UdpSocket>,
    cache: Option<PacketCache>,
    midi_capture_buffers: Vec<PortBuffer>,
    midi_playback_buffers: Vec<PortBuffer>,
    /// Frame counter the next cycle hopes to retrieve.
    expected_framecnt: u32,
    reply_to: Option<SocketAddr>,
    null_cycles: u64,
    cycle_deadline: Option<Instant>,
}

impl NetBackend {
    /// Bytes of one direction's payload: float32 per audio frame plus
    /// one word per MIDI frame.
    fn payload_len(&self, audio_channels: usize, midi_channels: usize) -> usize {
        (audio_channels + midi_channels) * self.period_size as usize * 4
    }

    fn render_capture(&self, packet: &[u8], ctx: &DriverContext) {
        let mut offset = HEADER_LEN;
        let frame_bytes = self.period_size as usize * 4;
        for buffer in ctx
            .capture_buffers
            .iter()
            .chain(&self.midi_capture_buffers)
        {
            let slice = &packet[offset..offset + frame_bytes];
            buffer.with(|samples| {
                for (sample, raw) in samples.iter_mut().zip(slice.chunks_exact(4)) {
                    *sample = f32::from_bits(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
                }
            });
            offset += frame_bytes;
        }
    }

    fn encode_playback(&self, ctx: &DriverContext, out: &mut Vec<u8>) {
        for buffer in ctx
            .playback_buffers
            .iter()
            .chain(&self.midi_playback_buffers)
        {
            buffer.with(|samples| {
                for &sample in samples.iter() {
                    out.put_u32(sample.to_bits());
                }
            });
        }
    }

    fn null_cycle(&mut self, ctx: &DriverContext) {
        self.null_cycles += 1;
        if self.null_cycles % 100 == 1 {
            tracing::warn!(total = self.null_cycles, "no packet by deadline, null cycle");
        }
        for buffer in ctx
            .capture_buffers
            .iter()
            .chain(&self.midi_capture_buffers)
        {
            buffer.silence();
        }
        // A missed link deadline is an xrun seen from the driver.
        ctx.engine.notify_driver_xrun();
    }
}

impl Backend for NetBackend {
    fn name(&self) -> &str {
        "net"
    }

    fn attach(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        for channel in 1..=self.midi_ins {
            let id = ctx.engine.port_register(
                ctx.refnum,
                &format!("system:midi_capture_{channel}"),
                PortType::Midi,
                PortDirection::Output,
                PortFlags {
                    physical: true,
                    terminal: true,
                },
                LatencyRange::constant(self.mode.latency() * self.period_size),
            )?;
            self.midi_capture_buffers
                .extend(ctx.engine.graph().port_buffer(id));
        }
        for channel in 1..=self.midi_outs {
            let id = ctx.engine.port_register(
                ctx.refnum,
                &format!("system:midi_playback_{channel}"),
                PortType::Midi,
                PortDirection::Input,
                PortFlags {
                    physical: true,
                    terminal: true,
                },
                LatencyRange::constant(self.mode.latency() * self.period_size),
            )?;
            self.midi_playback_buffers
                .extend(ctx.engine.graph().port_buffer(id));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.udp_port))?;
        socket.set_nonblocking(true)?;
        tracing::info!(port = self.udp_port, mtu = self.mtu, mode = ?self.mode, "net driver listening");
        self.socket = Some(socket);
        self.cache = None;
        self.expected_framecnt = 0;
        self.reply_to = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.socket = None;
        self.cache = None;
        tracing::info!(null_cycles = self.null_cycles, "net driver stopped");
        Ok(())
    }

    fn read(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        let Some(socket) = self.socket.take() else {
            return Err(DriverError::backend("net driver not started"));
        };
        let period = Duration::from_micros(
            u64::from(self.period_size) * 1_000_000 / u64::from(self.sample_rate.max(1)),
        );
        let deadline = Instant::now() + period;
        self.cycle_deadline = Some(deadline);

        let recv_payload = self.payload_len(ctx.capture_buffers.len(), self.midi_ins);
        let mut cache = self
            .cache
            .take()
            .unwrap_or_else(|| PacketCache::new(HEADER_LEN + recv_payload, self.mtu));

        let result = loop {
            cache.drain_socket(&socket);
            if let Some(framecnt) = cache.next_available(self.expected_framecnt) {
                let Some(packet) = cache.retrieve(framecnt) else {
                    continue;
                };
                let header = match PacketHeader::decode(packet.as_slice()) {
                    Ok(header) => header,
                    Err(err) => break Err(err),
                };
                if header.reply_port != 0 {
                    if let Some(master) = cache.master() {
                        self.reply_to =
                            Some(SocketAddr::new(master.ip(), header.reply_port as u16));
                    }
                }
                if self.transport_sync && header.sync_state != 0 {
                    tracing::trace!(
                        frame = header.transport_frame,
                        state = header.transport_state,
                        "transport state from master"
                    );
                }
                self.render_capture(&packet, ctx);
                self.expected_framecnt = framecnt.wrapping_add(1);
                break Ok(());
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    expected = self.expected_framecnt,
                    fill = cache.fill_percent(self.expected_framecnt),
                    highest = ?cache.highest_available(),
                    "cache state at deadline"
                );
                self.null_cycle(ctx);
                break Ok(());
            }
            // Nothing usable yet; yield briefly instead of spinning.
            std::thread::sleep(Duration::from_micros(200));
        };

        self.socket = Some(socket);
        self.cache = Some(cache);
        result
    }

    fn write(&mut self, ctx: &DriverContext) -> Result<(), DriverError> {
        // Pace the cycle even when there is nobody to reply to.
        let Some(dest) = self.reply_to else {
            if let Some(deadline) = self.cycle_deadline.take() {
                let now = Instant::now();
                if now < deadline {
                    std::thread::sleep(deadline - now);
                }
            }
            return Ok(());
        };
        let Some(socket) = self.socket.as_ref() else {
            return Err(DriverError::backend("net driver not started"));
        };

        let mut packet =
            Vec::with_capacity(HEADER_LEN + self.payload_len(ctx.playback_buffers.len(), self.midi_outs));
        PacketHeader {
            capture_channels_audio: ctx.capture_buffers.len() as u32,
            capture_channels_midi: self.midi_ins as u32,
            playback_channels_audio: ctx.playback_buffers.len() as u32,
            playback_channels_midi: self.midi_outs as u32,
            period_size: self.period_size,
            sample_rate: self.sample_rate,
            sync_state: u32::from(self.transport_sync),
            transport_frame: 0,
            transport_state: 0,
            framecnt: self.expected_framecnt,
            latency: self.mode.latency(),
            reply_port: u32::from(self.udp_port),
            mtu: self.mtu as u32,
            fragment_nr: 0,
        }
        .encode(&mut packet);
        self.encode_playback(ctx, &mut packet);
        send_fragmented(socket, &packet, dest, self.mtu)?;
        Ok(())
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<(), DriverError> {
        self.period_size = frames;
        // The cache is keyed to the payload size; rebuild on next read.
        self.cache = None;
        Ok(())
    }
}
