//! Published graph snapshots and per-client cycle timing.
//!
//! The request thread edits a master topology under the engine mutex
//! and distills it into an immutable [`GraphOrder`] snapshot; the
//! realtime thread adopts the latest snapshot at a cycle boundary and
//! walks it without ever looking at the mutable tables. Timing records
//! sit outside the snapshots so both threads can touch them lock-free.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::port::PortBuffer;
use crate::engine::client::CLIENT_MAX;

/// Where a client is in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientStatus {
    /// Not part of this cycle (or never triggered yet).
    NotTriggered = 0,
    /// Buffers delivered, wake signalled.
    Triggered = 1,
    /// The client acknowledged the wake and is processing.
    Running = 2,
    /// The client finished its slot.
    Finished = 3,
    /// The engine gave up waiting for this client.
    Timeout = 4,
}

impl ClientStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Triggered,
            2 => Self::Running,
            3 => Self::Finished,
            4 => Self::Timeout,
            _ => Self::NotTriggered,
        }
    }
}

/// Per-client, per-cycle timing record. The source of truth for whether
/// a client completed its slot.
#[derive(Debug, Default)]
pub struct ClientTiming {
    status: AtomicU8,
    awake_at: AtomicU64,
    finished_at: AtomicU64,
}

impl ClientTiming {
    /// Where the client is in its cycle.
    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Overrides the status, as the engine does on a missed deadline.
    pub fn set_status(&self, status: ClientStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// When the client was last woken, in engine microseconds.
    pub fn awake_at(&self) -> u64 {
        self.awake_at.load(Ordering::Acquire)
    }

    /// When the client last finished, in engine microseconds.
    pub fn finished_at(&self) -> u64 {
        self.finished_at.load(Ordering::Acquire)
    }

    /// Stamps the wake time and moves to `Triggered`.
    pub fn mark_awake(&self, at_us: u64) {
        self.awake_at.store(at_us, Ordering::Release);
        self.set_status(ClientStatus::Triggered);
    }

    /// Moves to `Running`; called from the client's process path.
    pub fn mark_running(&self) {
        self.set_status(ClientStatus::Running);
    }

    /// Stamps the finish time and moves to `Finished`.
    pub fn mark_finished(&self, at_us: u64) {
        self.finished_at.store(at_us, Ordering::Release);
        self.set_status(ClientStatus::Finished);
    }

    /// Back to `NotTriggered` with cleared stamps.
    pub fn reset(&self) {
        self.status
            .store(ClientStatus::NotTriggered as u8, Ordering::Release);
        self.awake_at.store(0, Ordering::Release);
        self.finished_at.store(0, Ordering::Release);
    }
}

/// One input port's feed: the destination buffer and every connected
/// source buffer, resolved to plain handles so the realtime walk never
/// consults the port table.
#[derive(Clone)]
pub(crate) struct InputFeed {
    pub dst: PortBuffer,
    pub sources: Vec<PortBuffer>,
}

/// One client's slot in the evaluation order.
#[derive(Clone)]
pub(crate) struct ScheduledClient {
    pub refnum: usize,
    pub inputs: Vec<InputFeed>,
}

/// An immutable, fully-resolved evaluation order. What the realtime
/// thread holds on to between cycle boundaries.
pub(crate) struct GraphOrder {
    pub clients: Vec<ScheduledClient>,
    pub version: u64,
}

impl GraphOrder {
    pub fn empty() -> Self {
        Self {
            clients: Vec::new(),
            version: 0,
        }
    }
}

/// Topological order of active clients from the connection list, edges
/// pointing source owner -> destination owner.
///
/// Kahn's algorithm over a min-heap keeps the order deterministic: among
/// ready clients the lowest refnum goes first, which places drivers
/// (lowest refnums) ahead of everything they feed. Feedback loops fall
/// back to refnum order for the strongly-connected remainder.
pub(crate) fn sort_clients(active: &[bool; CLIENT_MAX], edges: &[(usize, usize)]) -> Vec<usize> {
    let mut in_degree: HashMap<usize, usize> = active
        .iter()
        .enumerate()
        .filter(|(_, &a)| a)
        .map(|(refnum, _)| (refnum, 0))
        .collect();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();

    for &(src, dst) in edges {
        if src == dst || !active[src] || !active[dst] {
            continue;
        }
        *in_degree.entry(dst).or_insert(0) += 1;
        adjacency.entry(src).or_default().push(dst);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&refnum, _)| Reverse(refnum))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(refnum)) = ready.pop() {
        order.push(refnum);
        if let Some(next) = adjacency.get(&refnum) {
            for &dst in next {
                if let Some(degree) = in_degree.get_mut(&dst) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(dst));
                    }
                }
            }
        }
    }

    if order.len() < in_degree.len() {
        let mut remainder: Vec<usize> = in_degree
            .keys()
            .filter(|refnum| !order.contains(refnum))
            .copied()
            .collect();
        remainder.sort_unstable();
        tracing::warn!(?remainder, "connection graph has a feedback loop");
        order.extend(remainder);
    }
    order
}
