//! Bounded ring buffer of fixed-size frame blocks.
//!
//! The buffer holds a contiguous arena of `capacity × block_size` bytes,
//! allocated once at construction and zero-initialized. A producer fills the
//! slot returned by [`RingBuffer::write_ptr`] and publishes it with
//! [`RingBuffer::write_advance`]; a consumer drains in FIFO order via
//! [`RingBuffer::read_ptr`]. When the buffer is full the next advance
//! overwrites the oldest block, so positional access through
//! [`RingBuffer::get_ptr`] always covers the most recent `capacity` blocks.
//!
//! # Algorithm
//!
//! Two monotonically increasing counters, `write_index` and `read_index`.
//! The physical slot of an index is `index % capacity`. The buffer is full
//! once `write_index - read_index == capacity`; a further advance bumps the
//! read cursor implicitly so the retention window stays at `capacity`
//! blocks.
//!
//! # Thread Safety
//!
//! One producer and one consumer may run concurrently; the counters are
//! atomics with Acquire/Release ordering. Positional access (`get_ptr`,
//! `peek_ptr`) and `reset` are only defined while the producer is quiesced.
//! That discipline is enforced by the acquisition driver, not the buffer.
//! A slot reference must be dropped before the next call that can touch the
//! same slot (the producer advancing a full lap).

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CamResult, CameraError};

/// Bounded FIFO of fixed-size byte blocks with overwrite-on-full.
pub struct RingBuffer {
    /// Backing arena of `capacity * block_size` bytes.
    arena: UnsafeCell<Box<[u8]>>,

    /// Bytes per block.
    block_size: usize,

    /// Number of blocks in the arena.
    capacity: u64,

    /// Total blocks ever published (monotonically increasing).
    write_index: AtomicU64,

    /// Oldest retained block (monotonically increasing).
    read_index: AtomicU64,
}

// SAFETY: the arena is only accessed through raw pointers derived per call;
// counters use atomic Acquire/Release ordering. The single-producer /
// single-consumer discipline documented above keeps slot accesses disjoint.
unsafe impl Send for RingBuffer {}

// SAFETY: see above; concurrent producer and consumer never address the
// same slot while both counters respect the capacity bound, and all other
// access patterns require a quiesced producer by contract.
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("write_index", &self.write_index.load(Ordering::Acquire))
            .field("read_index", &self.read_index.load(Ordering::Acquire))
            .finish()
    }
}

impl RingBuffer {
    /// Allocate a buffer of `capacity` blocks of `block_size` bytes each.
    ///
    /// The arena is zero-initialized and never reallocated; resizing means
    /// dropping the buffer and creating a new one.
    ///
    /// # Errors
    ///
    /// Rejects `block_size == 0` and `capacity == 0`.
    pub fn new(block_size: usize, capacity: u64) -> CamResult<Self> {
        if block_size == 0 {
            return Err(CameraError::OutOfRange {
                name: "block_size".into(),
                message: "must be nonzero".into(),
            });
        }
        if capacity == 0 {
            return Err(CameraError::OutOfRange {
                name: "capacity".into(),
                message: "must be nonzero".into(),
            });
        }

        let arena = vec![0u8; block_size * capacity as usize].into_boxed_slice();

        Ok(Self {
            arena: UnsafeCell::new(arena),
            block_size,
            capacity,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
        })
    }

    /// Bytes per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks in the arena.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Restore the empty state without reallocating.
    ///
    /// Legal whenever the caller guarantees no concurrent access.
    pub fn reset(&self) {
        self.read_index.store(0, Ordering::Release);
        self.write_index.store(0, Ordering::Release);
    }

    /// Currently retained block count, clamped to the capacity.
    pub fn num_blocks(&self) -> u64 {
        let w = self.write_index.load(Ordering::Acquire);
        let r = self.read_index.load(Ordering::Acquire);
        w - r
    }

    /// True iff at least one unread block exists.
    pub fn available(&self) -> bool {
        self.num_blocks() > 0
    }

    fn slot(&self, index: u64) -> *mut u8 {
        let offset = (index % self.capacity) as usize * self.block_size;
        // SAFETY: offset < capacity * block_size by the modulo above, and
        // the arena is exactly that many bytes.
        unsafe { (*self.arena.get()).as_mut_ptr().add(offset) }
    }

    /// Writable reference to the producer's next slot.
    ///
    /// The caller fills the block and publishes it with
    /// [`write_advance`](Self::write_advance). Repeated calls without an
    /// advance return the same slot.
    #[allow(clippy::mut_from_ref)]
    pub fn write_ptr(&self) -> &mut [u8] {
        let w = self.write_index.load(Ordering::Acquire);
        // SAFETY: the producer slot `w % capacity` is outside the retained
        // window [read_index, write_index) addressed by the consumer, and
        // there is exactly one producer by contract.
        unsafe { std::slice::from_raw_parts_mut(self.slot(w), self.block_size) }
    }

    /// Publish the block filled via [`write_ptr`](Self::write_ptr).
    ///
    /// When the buffer is full this overwrites the oldest block: the read
    /// cursor advances implicitly so positional access keeps referring to
    /// the most recent `capacity` blocks.
    pub fn write_advance(&self) {
        let w = self.write_index.load(Ordering::Acquire) + 1;
        self.write_index.store(w, Ordering::Release);

        let r = self.read_index.load(Ordering::Acquire);
        if w - r > self.capacity {
            self.read_index.store(w - self.capacity, Ordering::Release);
        }
    }

    /// Oldest unread block, advancing the read cursor; `None` when empty.
    pub fn read_ptr(&self) -> Option<&[u8]> {
        let r = self.read_index.load(Ordering::Acquire);
        let w = self.write_index.load(Ordering::Acquire);
        if r >= w {
            return None;
        }
        // SAFETY: r < w <= r + capacity, so the slot is inside the retained
        // window and the producer is not writing it.
        let block = unsafe { std::slice::from_raw_parts(self.slot(r), self.block_size) };
        self.read_index.store(r + 1, Ordering::Release);
        Some(block)
    }

    /// Reference to the producer's current slot, without side effect.
    ///
    /// Shows the most recently filled (but not yet advanced) block, which
    /// is how a preview displays the "latest" frame.
    pub fn peek_ptr(&self) -> &[u8] {
        let w = self.write_index.load(Ordering::Acquire);
        // SAFETY: same slot as write_ptr; the producer must be quiesced.
        unsafe { std::slice::from_raw_parts(self.slot(w), self.block_size) }
    }

    /// Reference to the `i`-th oldest retained block.
    ///
    /// `i` is taken modulo the capacity relative to the retention window.
    /// Only defined while the producer is quiesced.
    pub fn get_ptr(&self, i: u64) -> &[u8] {
        let r = self.read_index.load(Ordering::Acquire);
        // SAFETY: (r + i) % capacity addresses a slot of the arena; the
        // quiesced-producer contract rules out concurrent writes.
        unsafe { std::slice::from_raw_parts(self.slot(r + i), self.block_size) }
    }
}
