//! Lock-free SPSC byte pipe with explicit pointer placement.
//!
//! This is the transport under every clock-domain adapter: one producer
//! thread, one consumer thread, no locks, no allocation after creation.
//! Unlike a general-purpose ring buffer, the pipe exposes *pointer
//! placement* (`set_read_space` / `set_write_space`) so the adapter can
//! re-center the fill level after a clock jump, and an xrun latch that
//! records whether an exact-size transfer ever ran dry.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Size in bytes of one float sample moved through a pipe.
pub const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// A lock-free single-producer / single-consumer byte pipe.
///
/// The backing storage is allocated once at creation and never grows;
/// [`reset_size`](RingPipe::reset_size) only narrows the *logical* size.
/// One slot is always kept free so that a full pipe is distinguishable
/// from an empty one: `read_space() + write_space() == size - 1`.
///
/// # Thread safety
///
/// Exactly one thread may write and exactly one thread may read. The
/// producer publishes `write_ptr` with release ordering and the consumer
/// publishes `read_ptr` with release ordering; each side loads the
/// other's pointer with acquire ordering. The payload region needs no
/// further fences under that discipline.
pub struct RingPipe {
    buf: Box<[UnsafeCell<u8>]>,
    /// Logical size in bytes, a power of two, at most `buf.len()`.
    size: AtomicUsize,
    write_ptr: AtomicUsize,
    read_ptr: AtomicUsize,
    xrun: AtomicBool,
}

// One producer and one consumer share the pipe; pointer ownership is
// disjoint and payload access is bounded by the published pointers.
unsafe impl Sync for RingPipe {}
unsafe impl Send for RingPipe {}

impl RingPipe {
    /// Creates a pipe with `size` bytes of capacity, rounded up to the
    /// next power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(2).next_power_of_two();
        let buf = (0..size).map(|_| UnsafeCell::new(0)).collect();
        Self {
            buf,
            size: AtomicUsize::new(size),
            write_ptr: AtomicUsize::new(0),
            read_ptr: AtomicUsize::new(0),
            xrun: AtomicBool::new(false),
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.size.load(Ordering::Relaxed) - 1
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Zeroes both pointers and the xrun latch, making an empty pipe.
    ///
    /// Not safe to call concurrently with I/O on either side.
    pub fn reset(&self) {
        self.read_ptr.store(0, Ordering::Relaxed);
        self.write_ptr.store(0, Ordering::Relaxed);
        self.xrun.store(false, Ordering::Relaxed);
    }

    /// Narrows the logical size to `new_size` bytes (rounded up to a
    /// power of two, clamped to the allocated capacity) and resets.
    ///
    /// Not safe to call concurrently with I/O on either side.
    pub fn reset_size(&self, new_size: usize) {
        let new_size = new_size.max(2).next_power_of_two().min(self.buf.len());
        self.size.store(new_size, Ordering::Relaxed);
        self.reset();
    }

    /// Bytes available for reading.
    pub fn read_space(&self) -> usize {
        let w = self.write_ptr.load(Ordering::Acquire);
        let r = self.read_ptr.load(Ordering::Acquire);
        w.wrapping_sub(r) & self.mask()
    }

    /// Bytes available for writing. Always `size() - 1 - read_space()`.
    pub fn write_space(&self) -> usize {
        self.size() - 1 - self.read_space()
    }

    /// True if an exact-size transfer has run dry since the last reset
    /// or pointer placement.
    pub fn xrun(&self) -> bool {
        self.xrun.load(Ordering::Relaxed)
    }

    /// Moves the read pointer so that exactly `space` bytes are
    /// readable, and clears the xrun latch.
    ///
    /// Called by the consumer to re-center after a jump; the write
    /// pointer is left untouched.
    pub fn set_read_space(&self, space: usize) {
        let space = space.min(self.size() - 1);
        let w = self.write_ptr.load(Ordering::Acquire);
        self.read_ptr
            .store(w.wrapping_sub(space) & self.mask(), Ordering::Release);
        self.xrun.store(false, Ordering::Relaxed);
    }

    /// Moves the write pointer so that exactly `space` bytes are free,
    /// and clears the xrun latch.
    ///
    /// Called by the producer to re-center after a jump; the read
    /// pointer is left untouched.
    pub fn set_write_space(&self, space: usize) {
        let space = space.min(self.size() - 1);
        let r = self.read_ptr.load(Ordering::Acquire);
        let readable = self.size() - 1 - space;
        self.write_ptr
            .store(r.wrapping_add(readable) & self.mask(), Ordering::Release);
        self.xrun.store(false, Ordering::Relaxed);
    }

    /// Copies out of the buffer starting at masked position `start`,
    /// wrapping at the logical size.
    ///
    /// Safety: the caller is the single consumer and `dst.len()` is at
    /// most the logical size.
    unsafe fn copy_out(&self, start: usize, dst: &mut [u8]) {
        let size = self.size();
        let base = self.buf.as_ptr() as *const u8;
        let first = dst.len().min(size - start);
        std::ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
        if first < dst.len() {
            std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    /// Copies into the buffer starting at masked position `start`,
    /// wrapping at the logical size.
    ///
    /// Safety: the caller is the single producer and `src.len()` is at
    /// most the logical size.
    unsafe fn copy_in(&self, start: usize, src: &[u8]) {
        let size = self.size();
        let base = self.buf.as_ptr() as *mut u8;
        let first = src.len().min(size - start);
        std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
        if first < src.len() {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    /// Reads up to `dst.len()` bytes, returning the count actually moved.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.read_space());
        let r = self.read_ptr.load(Ordering::Relaxed);
        // The producer only appends past `write_ptr`, so the readable
        // region is stable while we copy.
        unsafe { self.copy_out(r, &mut dst[..n]) };
        self.read_ptr
            .store(r.wrapping_add(n) & self.mask(), Ordering::Release);
        n
    }

    /// Writes up to `src.len()` bytes, returning the count actually moved.
    pub fn write(&self, src: &[u8]) -> usize {
        let n = src.len().min(self.write_space());
        let w = self.write_ptr.load(Ordering::Relaxed);
        unsafe { self.copy_in(w, &src[..n]) };
        self.write_ptr
            .store(w.wrapping_add(n) & self.mask(), Ordering::Release);
        n
    }

    /// Reads exactly `dst.len()` bytes, wrapping over stale data and
    /// latching the xrun flag if the pipe held fewer readable bytes.
    ///
    /// The caller guarantees recovery (typically by re-centering).
    pub fn read_exact(&self, dst: &mut [u8]) {
        if self.read_space() < dst.len() {
            self.xrun.store(true, Ordering::Relaxed);
        }
        let r = self.read_ptr.load(Ordering::Relaxed);
        unsafe { self.copy_out(r, dst) };
        self.read_ptr
            .store(r.wrapping_add(dst.len()) & self.mask(), Ordering::Release);
    }

    /// Writes exactly `src.len()` bytes, overwriting unread data and
    /// latching the xrun flag if the pipe had fewer free bytes.
    ///
    /// The caller guarantees recovery (typically by re-centering).
    pub fn write_exact(&self, src: &[u8]) {
        if self.write_space() < src.len() {
            self.xrun.store(true, Ordering::Relaxed);
        }
        let w = self.write_ptr.load(Ordering::Relaxed);
        unsafe { self.copy_in(w, src) };
        self.write_ptr
            .store(w.wrapping_add(src.len()) & self.mask(), Ordering::Release);
    }

    // Float views. Samples move through the pipe as native-endian bytes;
    // these avoid a bounce buffer on the realtime paths.

    /// Readable float samples.
    pub fn read_space_samples(&self) -> usize {
        self.read_space() / SAMPLE_BYTES
    }

    /// Writable float samples.
    pub fn write_space_samples(&self) -> usize {
        self.write_space() / SAMPLE_BYTES
    }

    /// [`read`](RingPipe::read) over float samples.
    pub fn read_samples(&self, dst: &mut [f32]) -> usize {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(dst.as_mut_ptr() as *mut u8, dst.len() * SAMPLE_BYTES)
        };
        // Read whole samples only so a partial read never tears one.
        let want = bytes.len().min(self.read_space() / SAMPLE_BYTES * SAMPLE_BYTES);
        self.read(&mut bytes[..want]) / SAMPLE_BYTES
    }

    /// [`write`](RingPipe::write) over float samples.
    pub fn write_samples(&self, src: &[f32]) -> usize {
        let bytes = unsafe {
            std::slice::from_raw_parts(src.as_ptr() as *const u8, src.len() * SAMPLE_BYTES)
        };
        let want = bytes.len().min(self.write_space() / SAMPLE_BYTES * SAMPLE_BYTES);
        self.write(&bytes[..want]) / SAMPLE_BYTES
    }

    /// [`read_exact`](RingPipe::read_exact) over float samples.
    pub fn read_exact_samples(&self, dst: &mut [f32]) {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(dst.as_mut_ptr() as *mut u8, dst.len() * SAMPLE_BYTES)
        };
        self.read_exact(bytes);
    }

    /// [`write_exact`](RingPipe::write_exact) over float samples.
    pub fn write_exact_samples(&self, src: &[f32]) {
        let bytes = unsafe {
            std::slice::from_raw_parts(src.as_ptr() as *const u8, src.len() * SAMPLE_BYTES)
        };
        self.write_exact(bytes);
    }
}

impl std::fmt::Debug for RingPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPipe")
            .field("size", &self.size())
            .field("read_space", &self.read_space())
            .field("write_space", &self.write_space())
            .field("xrun", &self.xrun())
            .finish()
    }
}
