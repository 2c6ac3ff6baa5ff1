//! Wire format of the network driver: the packet header, UDP
//! fragmentation, and the reassembly cache.
//!
//! Every packet starts with a fourteen-field header of 32-bit unsigned
//! integers in network byte order, followed by channel payloads. When a
//! payload does not fit the MTU it is sliced into fragments that share
//! a frame counter and carry ascending fragment numbers; the receiver
//! reassembles them in a small cache keyed by frame counter, latched to
//! the first sender it hears from.

use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use bytes::{Buf, BufMut};

use crate::error::DriverError;

/// Encoded header length in bytes: fourteen `u32` fields.
pub const HEADER_LEN: usize = 14 * 4;

/// In-flight frame counts the cache can hold.
pub const CACHE_PACKETS: usize = 8;

/// The packet header, in field order on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub capture_channels_audio: u32,
    pub capture_channels_midi: u32,
    pub playback_channels_audio: u32,
    pub playback_channels_midi: u32,
    pub period_size: u32,
    pub sample_rate: u32,
    pub sync_state: u32,
    pub transport_frame: u32,
    pub transport_state: u32,
    pub framecnt: u32,
    pub latency: u32,
    pub reply_port: u32,
    pub mtu: u32,
    pub fragment_nr: u32,
}

impl PacketHeader {
    /// Appends the big-endian encoding to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.capture_channels_audio);
        buf.put_u32(self.capture_channels_midi);
        buf.put_u32(self.playback_channels_audio);
        buf.put_u32(self.playback_channels_midi);
        buf.put_u32(self.period_size);
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.sync_state);
        buf.put_u32(self.transport_frame);
        buf.put_u32(self.transport_state);
        buf.put_u32(self.framecnt);
        buf.put_u32(self.latency);
        buf.put_u32(self.reply_port);
        buf.put_u32(self.mtu);
        buf.put_u32(self.fragment_nr);
    }

    /// Decodes a header off the front of `buf`.
    pub fn decode(mut buf: impl Buf) -> Result<Self, DriverError> {
        if buf.remaining() < HEADER_LEN {
            return Err(DriverError::BadPacket {
                reason: format!("short header: {} bytes", buf.remaining()),
            });
        }
        Ok(Self {
            capture_channels_audio: buf.get_u32(),
            capture_channels_midi: buf.get_u32(),
            playback_channels_audio: buf.get_u32(),
            playback_channels_midi: buf.get_u32(),
            period_size: buf.get_u32(),
            sample_rate: buf.get_u32(),
            sync_state: buf.get_u32(),
            transport_frame: buf.get_u32(),
            transport_state: buf.get_u32(),
            framecnt: buf.get_u32(),
            latency: buf.get_u32(),
            reply_port: buf.get_u32(),
            mtu: buf.get_u32(),
            fragment_nr: buf.get_u32(),
        })
    }
}

/// One reassembly slot.
struct CachePacket {
    valid: bool,
    framecnt: u32,
    buf: Vec<u8>,
    fragments: Vec<bool>,
    recv_at: Option<Instant>,
}

impl CachePacket {
    fn new(packet_len: usize, num_fragments: usize) -> Self {
        Self {
            valid: false,
            framecnt: 0,
            buf: vec![0; packet_len],
            fragments: vec![false; num_fragments],
            recv_at: None,
        }
    }

    fn reset(&mut self) {
        self.valid = false;
        self.framecnt = 0;
        self.fragments.fill(false);
        self.recv_at = None;
    }

    fn arm(&mut self, framecnt: u32) {
        self.valid = true;
        self.framecnt = framecnt;
        self.fragments.fill(false);
    }

    fn is_complete(&self) -> bool {
        self.valid && self.fragments.iter().all(|&f| f)
    }
}

/// Reassembles fragmented packets by frame counter.
///
/// The cache latches the first sender as master and ignores every other
/// source until [`reset_master`](Self::reset_master). Fragments whose
/// frame counter does not advance past the last retrieved one are
/// dropped on arrival; retrieval clears every older slot.
pub struct PacketCache {
    slots: Vec<CachePacket>,
    packet_len: usize,
    fragment_payload: usize,
    num_fragments: usize,
    mtu: usize,
    last_retrieved: Option<u32>,
    master: Option<SocketAddr>,
}

impl PacketCache {
    /// A cache for `packet_len`-byte packets (header included) carried
    /// over `mtu`-byte datagrams.
    pub fn new(packet_len: usize, mtu: usize) -> Self {
        let fragment_payload = mtu.saturating_sub(HEADER_LEN).max(1);
        let num_fragments = if packet_len <= mtu {
            1
        } else {
            (packet_len - HEADER_LEN).div_ceil(fragment_payload)
        };
        Self {
            slots: (0..CACHE_PACKETS)
                .map(|_| CachePacket::new(packet_len, num_fragments))
                .collect(),
            packet_len,
            fragment_payload,
            num_fragments,
            mtu,
            last_retrieved: None,
            master: None,
        }
    }

    /// The latched master, if any.
    pub fn master(&self) -> Option<SocketAddr> {
        self.master
    }

    /// Forgets the master and the retrieval watermark.
    pub fn reset_master(&mut self) {
        self.master = None;
        self.last_retrieved = None;
    }

    /// Share of cache slots holding complete packets at or past
    /// `expected`, in percent.
    pub fn fill_percent(&self, expected: u32) -> f32 {
        let ahead = self
            .slots
            .iter()
            .filter(|slot| slot.is_complete() && slot.framecnt >= expected)
            .count();
        100.0 * ahead as f32 / self.slots.len() as f32
    }

    fn slot_for(&mut self, framecnt: u32) -> &mut CachePacket {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.valid && slot.framecnt == framecnt)
        {
            return &mut self.slots[index];
        }
        if let Some(index) = self.slots.iter().position(|slot| !slot.valid) {
            let slot = &mut self.slots[index];
            slot.arm(framecnt);
            return slot;
        }
        // Cache full: evict the oldest frame counter.
        let index = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.framecnt)
            .map(|(index, _)| index)
            .unwrap_or(0);
        tracing::debug!(
            dropped = self.slots[index].framecnt,
            "packet cache full, dropping oldest"
        );
        let slot = &mut self.slots[index];
        slot.reset();
        slot.arm(framecnt);
        slot
    }

    /// Accepts one datagram from `sender`. Packets from non-master
    /// sources and stale frame counters are dropped silently.
    pub fn add_datagram(&mut self, datagram: &[u8], sender: SocketAddr) -> Result<(), DriverError> {
        match self.master {
            Some(master) if master != sender => return Ok(()),
            Some(_) => {}
            None => {
                tracing::info!(%sender, "latching packet source as master");
                self.master = Some(sender);
            }
        }

        let header = PacketHeader::decode(datagram)?;
        if let Some(last) = self.last_retrieved {
            if header.framecnt <= last {
                return Ok(());
            }
        }

        let fragment_payload = self.fragment_payload;
        let packet_len = self.packet_len;
        let num_fragments = self.num_fragments;
        let slot = self.slot_for(header.framecnt);

        let fragment = header.fragment_nr as usize;
        if fragment >= num_fragments {
            return Err(DriverError::BadPacket {
                reason: format!("fragment {fragment} of {num_fragments}"),
            });
        }
        let body = &datagram[HEADER_LEN..];
        let offset = HEADER_LEN + fragment * fragment_payload;
        if fragment == 0 {
            // Fragment zero carries the authoritative header too.
            let len = datagram.len().min(packet_len);
            slot.buf[..len].copy_from_slice(&datagram[..len]);
        } else {
            let len = body.len().min(packet_len - offset);
            slot.buf[offset..offset + len].copy_from_slice(&body[..len]);
        }
        slot.fragments[fragment] = true;
        slot.recv_at = Some(Instant::now());
        Ok(())
    }

    /// Drains every pending datagram on a nonblocking socket into the
    /// cache.
    pub fn drain_socket(&mut self, socket: &UdpSocket) {
        let mut datagram = vec![0u8; self.mtu];
        loop {
            match socket.recv_from(&mut datagram) {
                Ok((len, sender)) => {
                    if let Err(err) = self.add_datagram(&datagram[..len], sender) {
                        tracing::warn!(%err, "dropped datagram");
                    }
                }
                Err(_) => return,
            }
        }
    }

    /// The complete frame counter closest at or after `expected`, using
    /// wrapping distance.
    pub fn next_available(&self, expected: u32) -> Option<u32> {
        let mut best: Option<u32> = None;
        for slot in &self.slots {
            if !slot.is_complete() {
                continue;
            }
            let offset = slot.framecnt.wrapping_sub(expected);
            if offset > u32::MAX / 2 {
                // Behind the expected counter.
                continue;
            }
            if best.map_or(true, |b| offset < b.wrapping_sub(expected)) {
                best = Some(slot.framecnt);
                if offset == 0 {
                    break;
                }
            }
        }
        best
    }

    /// The highest complete frame counter in the cache.
    pub fn highest_available(&self) -> Option<u32> {
        self.slots
            .iter()
            .filter(|slot| slot.is_complete())
            .map(|slot| slot.framecnt)
            .max()
    }

    /// Takes a complete packet out of the cache, advancing the
    /// retrieval watermark and clearing every older slot.
    pub fn retrieve(&mut self, framecnt: u32) -> Option<Vec<u8>> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.is_complete() && slot.framecnt == framecnt)?;
        let packet = self.slots[index].buf.clone();
        self.last_retrieved = Some(framecnt);
        for slot in &mut self.slots {
            if slot.valid && slot.framecnt <= framecnt {
                slot.reset();
            }
        }
        Some(packet)
    }
}

/// Sends `packet` (header already encoded at the front), fragmenting it
/// when it exceeds `mtu`. Every fragment repeats the header with its
/// own ascending `fragment_nr`.
pub fn send_fragmented(
    socket: &UdpSocket,
    packet: &[u8],
    dest: SocketAddr,
    mtu: usize,
) -> Result<(), DriverError> {
    if packet.len() <= mtu {
        socket.send_to(packet, dest)?;
        return Ok(());
    }
    if mtu <= HEADER_LEN {
        return Err(DriverError::BadPacket {
            reason: format!("mtu {mtu} cannot carry a header"),
        });
    }

    let fragment_payload = mtu - HEADER_LEN;
    let mut datagram = Vec::with_capacity(mtu);
    let body = &packet[HEADER_LEN..];

    for (fragment_nr, chunk) in body.chunks(fragment_payload).enumerate() {
        datagram.clear();
        let mut header = PacketHeader::decode(&packet[..HEADER_LEN])?;
        header.fragment_nr = fragment_nr as u32;
        header.encode(&mut datagram);
        datagram.extend_from_slice(chunk);
        socket.send_to(&datagram, dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn header(framecnt: u32) -> PacketHeader {
        PacketHeader {
            capture_channels_audio: 2,
            playback_channels_audio: 2,
            period_size: 128,
            sample_rate: 48000,
            framecnt,
            latency: 2,
            mtu: 1500,
            ..PacketHeader::default()
        }
    }

    fn datagram(framecnt: u32, fragment_nr: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        PacketHeader {
            fragment_nr,
            ..header(framecnt)
        }
        .encode(&mut out);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_header_round_trip_is_identity() {
        let before = PacketHeader {
            capture_channels_audio: 1,
            capture_channels_midi: 2,
            playback_channels_audio: 3,
            playback_channels_midi: 4,
            period_size: 512,
            sample_rate: 44100,
            sync_state: 1,
            transport_frame: 123_456,
            transport_state: 2,
            framecnt: 789,
            latency: 3,
            reply_port: 19001,
            mtu: 1500,
            fragment_nr: 5,
        };
        let mut wire = Vec::new();
        before.encode(&mut wire);
        assert_eq!(wire.len(), HEADER_LEN);
        // Network byte order: first field's big-endian bytes lead.
        assert_eq!(&wire[..4], &[0, 0, 0, 1]);

        let after = PacketHeader::decode(wire.as_slice()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let err = PacketHeader::decode(&[0u8; 10][..]).unwrap_err();
        assert!(err.to_string().contains("short header"));
    }

    #[test]
    fn test_single_fragment_packet_is_retrievable() {
        let mut cache = PacketCache::new(HEADER_LEN + 64, 1500);
        let d = datagram(7, 0, &[42u8; 64]);
        cache.add_datagram(&d, addr(9000)).unwrap();

        assert_eq!(cache.next_available(7), Some(7));
        let packet = cache.retrieve(7).unwrap();
        assert_eq!(&packet[HEADER_LEN..], &[42u8; 64]);
    }

    #[test]
    fn test_reassembly_needs_every_fragment() {
        // Packet body of 3 fragments at this mtu.
        let mtu = HEADER_LEN + 32;
        let mut cache = PacketCache::new(HEADER_LEN + 96, mtu);

        cache
            .add_datagram(&datagram(5, 0, &[1u8; 32]), addr(9000))
            .unwrap();
        cache
            .add_datagram(&datagram(5, 2, &[3u8; 32]), addr(9000))
            .unwrap();
        // Still missing fragment 1.
        assert_eq!(cache.next_available(5), None);

        cache
            .add_datagram(&datagram(5, 1, &[2u8; 32]), addr(9000))
            .unwrap();
        let packet = cache.retrieve(5).unwrap();
        assert_eq!(&packet[HEADER_LEN..HEADER_LEN + 32], &[1u8; 32]);
        assert_eq!(&packet[HEADER_LEN + 32..HEADER_LEN + 64], &[2u8; 32]);
        assert_eq!(&packet[HEADER_LEN + 64..], &[3u8; 32]);
    }

    #[test]
    fn test_non_master_sources_are_ignored() {
        let mut cache = PacketCache::new(HEADER_LEN + 16, 1500);
        cache
            .add_datagram(&datagram(1, 0, &[1u8; 16]), addr(9000))
            .unwrap();
        assert_eq!(cache.master(), Some(addr(9000)));

        // A different source cannot inject packets.
        cache
            .add_datagram(&datagram(2, 0, &[2u8; 16]), addr(9001))
            .unwrap();
        assert_eq!(cache.next_available(2), None);

        cache.reset_master();
        assert_eq!(cache.master(), None);
    }

    #[test]
    fn test_stale_framecnt_is_dropped() {
        let mut cache = PacketCache::new(HEADER_LEN + 16, 1500);
        cache
            .add_datagram(&datagram(10, 0, &[1u8; 16]), addr(9000))
            .unwrap();
        cache.retrieve(10).unwrap();

        // At or below the watermark: ignored.
        cache
            .add_datagram(&datagram(10, 0, &[1u8; 16]), addr(9000))
            .unwrap();
        cache
            .add_datagram(&datagram(9, 0, &[1u8; 16]), addr(9000))
            .unwrap();
        assert_eq!(cache.highest_available(), None);

        cache
            .add_datagram(&datagram(11, 0, &[1u8; 16]), addr(9000))
            .unwrap();
        assert_eq!(cache.highest_available(), Some(11));
    }

    #[test]
    fn test_retrieve_clears_older_slots() {
        let mut cache = PacketCache::new(HEADER_LEN + 16, 1500);
        for framecnt in [3, 4, 5] {
            cache
                .add_datagram(&datagram(framecnt, 0, &[0u8; 16]), addr(9000))
                .unwrap();
        }
        cache.retrieve(4).unwrap();
        // 3 and 4 are gone, 5 survives.
        assert_eq!(cache.next_available(0), Some(5));
        assert_eq!(cache.fill_percent(0), 100.0 / CACHE_PACKETS as f32);
    }

    #[test]
    fn test_next_available_picks_smallest_forward_offset() {
        let mut cache = PacketCache::new(HEADER_LEN + 16, 1500);
        for framecnt in [20, 23, 21] {
            cache
                .add_datagram(&datagram(framecnt, 0, &[0u8; 16]), addr(9000))
                .unwrap();
        }
        assert_eq!(cache.next_available(21), Some(21));
        assert_eq!(cache.next_available(22), Some(23));
        // Everything is behind: nothing forward of 30.
        assert_eq!(cache.next_available(30), None);
    }

    #[test]
    fn test_cache_evicts_oldest_when_full() {
        let mut cache = PacketCache::new(HEADER_LEN + 16, 1500);
        for framecnt in 0..(CACHE_PACKETS as u32 + 2) {
            cache
                .add_datagram(&datagram(framecnt + 1, 0, &[0u8; 16]), addr(9000))
                .unwrap();
        }
        // The two oldest were evicted to make room.
        assert_eq!(cache.next_available(0), Some(3));
        assert_eq!(
            cache.highest_available(),
            Some(CACHE_PACKETS as u32 + 2)
        );
    }

    #[test]
    fn test_fragmented_send_reassembles() {
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_nonblocking(true).unwrap();
        let dest = rx.local_addr().unwrap();

        let mtu = HEADER_LEN + 40;
        let body: Vec<u8> = (0..100).collect();
        let mut packet = Vec::new();
        header(77).encode(&mut packet);
        packet.extend_from_slice(&body);

        send_fragmented(&tx, &packet, dest, mtu).unwrap();
        // Give the loopback a moment.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut cache = PacketCache::new(packet.len(), mtu);
        cache.drain_socket(&rx);
        let got = cache.retrieve(77).expect("all fragments arrived");
        assert_eq!(&got[HEADER_LEN..], &body[..]);
    }
}
