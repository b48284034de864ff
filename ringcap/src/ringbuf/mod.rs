//! Bounded byte ring buffer with BPF ringbuf semantics.
//!
//! Layout: a header of two cursors (`consumer_pos`, `producer_pos`) followed
//! by a power-of-two data region. Every record is prefixed by an 8 byte
//! header:
//!
//! ```text
//! 0      4                   8
//! +------+-------------------+----------------------------+
//! | len  | offset in region  | record bytes (len), padded |
//! +------+-------------------+----------------------------+
//! ```
//!
//! Bit 31 of `len` is `BUSY` (reserved, not committed yet) and bit 30 is
//! `DISCARD`. Records start on 8 byte boundaries.
//!
//! ### Concurrency
//! - **Producers** claim space by compare-and-swap on a reservation cursor,
//!   write the header with `BUSY` set, then advance `producer_pos` in
//!   reservation order. They never wait on the consumer: a full ring is an
//!   immediate `None`.
//! - **Consumers** walk from `consumer_pos` towards `producer_pos`, stop at
//!   the first `BUSY` header and only advance `consumer_pos` once a record has
//!   been fully processed. Consumer handles serialize their drains.

mod consumer;
mod mapping;
mod producer;

pub use consumer::{Consumer, Drain, RingBufItem};
pub use mapping::page_size;
pub use producer::{Producer, Slot};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use mapping::MirroredRegion;

/// Size of the per-record header.
pub const RECORD_HEADER_LEN: usize = 8;
/// Records are aligned to this many bytes.
pub const RECORD_ALIGN: usize = 8;

pub(crate) const BUSY_BIT: u32 = 1 << 31;
pub(crate) const DISCARD_BIT: u32 = 1 << 30;
pub(crate) const LEN_MASK: u32 = DISCARD_BIT - 1;

/// Largest record the header's length field can describe.
pub const MAX_RECORD_LEN: usize = LEN_MASK as usize;
/// Largest supported data region.
pub const MAX_CAPACITY: u64 = 1 << 32;

/// Bytes a record of `len` bytes occupies in the ring, header included.
pub const fn footprint(len: usize) -> usize {
    (len + RECORD_HEADER_LEN + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

#[derive(Debug, thiserror::Error)]
pub enum RingBufError {
    #[error("ring capacity {0} is not a power of two")]
    NotPowerOfTwo(usize),
    #[error("ring capacity {capacity} is not a multiple of the page size ({page_size})")]
    NotPageAligned { capacity: usize, page_size: usize },
    #[error("ring capacity {0} exceeds the 4 GiB limit")]
    TooLarge(usize),
    #[error("failed to map ring buffer memory")]
    Map(#[source] std::io::Error),
}

/// Cursor block placed in front of the data region.
#[repr(C)]
#[derive(Default)]
pub(crate) struct RingHeader {
    /// Advanced only by consumers, after a record is released.
    pub(crate) consumer_pos: CachePadded<AtomicU64>,
    /// Everything below this position has a valid header.
    pub(crate) producer_pos: CachePadded<AtomicU64>,
    /// Claimed by producers; may run ahead of `producer_pos` briefly.
    pub(crate) reserve_pos: CachePadded<AtomicU64>,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) reserved: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) consumed: AtomicU64,
    pub(crate) wakeups: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    /// Successful reservations.
    pub reserved: u64,
    /// Records published to consumers.
    pub committed: u64,
    /// Reservations released without a record.
    pub discarded: u64,
    /// Reservations refused for lack of space.
    pub dropped: u64,
    /// Records handed to and released by consumers.
    pub consumed: u64,
    /// Consumer notifications sent by producers.
    pub wakeups: u64,
}

impl RingStats {
    /// Fraction of reservation attempts refused for lack of space.
    pub fn drop_rate(&self) -> f64 {
        let attempts = self.reserved + self.dropped;
        if attempts == 0 {
            0.0
        } else {
            self.dropped as f64 / attempts as f64
        }
    }
}

pub(crate) struct Shared {
    pub(crate) header: RingHeader,
    region: MirroredRegion,
    pub(crate) capacity: u64,
    mask: u64,
    pub(crate) counters: Counters,
    /// Serializes consumer drains.
    pub(crate) drain_lock: Mutex<()>,
    /// Wake-up epoch, bumped by every notification.
    pub(crate) wake_epoch: Mutex<u64>,
    pub(crate) wake_cv: Condvar,
}

impl Shared {
    /// Length word of the header at absolute position `pos`.
    #[inline]
    pub(crate) fn len_word(&self, pos: u64) -> &AtomicU32 {
        // Headers sit on 8 byte boundaries and never straddle the end of the
        // region, which is a multiple of 8.
        unsafe { &*(self.region.as_ptr().add((pos & self.mask) as usize) as *const AtomicU32) }
    }

    #[inline]
    pub(crate) fn offset_word(&self, pos: u64) -> &AtomicU32 {
        unsafe {
            &*(self.region.as_ptr().add((pos & self.mask) as usize + 4) as *const AtomicU32)
        }
    }

    /// Pointer to the record bytes following the header at `pos`. Valid for
    /// up to `capacity - 8` bytes thanks to the mirrored mapping.
    #[inline]
    pub(crate) fn record_ptr(&self, pos: u64) -> *mut u8 {
        unsafe {
            self.region
                .as_ptr()
                .add((pos & self.mask) as usize + RECORD_HEADER_LEN)
        }
    }

    #[inline]
    pub(crate) fn data_offset(&self, pos: u64) -> u32 {
        (pos & self.mask) as u32
    }

    pub(crate) fn notify(&self) {
        let mut epoch = self.wake_epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.counters.wakeups.fetch_add(1, Ordering::Relaxed);
        self.wake_cv.notify_all();
    }

    /// True if the record at `consumer_pos` is committed or discarded.
    pub(crate) fn has_ready_record(&self) -> bool {
        let cons = self.header.consumer_pos.load(Ordering::Acquire);
        let prod = self.header.producer_pos.load(Ordering::Acquire);
        cons < prod && self.len_word(cons).load(Ordering::Acquire) & BUSY_BIT == 0
    }

    pub(crate) fn stats(&self) -> RingStats {
        let c = &self.counters;
        RingStats {
            reserved: c.reserved.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::Relaxed),
            wakeups: c.wakeups.load(Ordering::Relaxed),
        }
    }
}

/// Owner of a ring buffer; hands out producer and consumer handles.
#[derive(Clone)]
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Creates a ring with a `capacity` byte data region.
    ///
    /// `capacity` must be a power of two, a multiple of the page size and at
    /// most 4 GiB.
    pub fn new(capacity: usize) -> Result<Self, RingBufError> {
        if !capacity.is_power_of_two() {
            return Err(RingBufError::NotPowerOfTwo(capacity));
        }
        let page_size = page_size();
        if capacity % page_size != 0 {
            return Err(RingBufError::NotPageAligned {
                capacity,
                page_size,
            });
        }
        if capacity as u64 > MAX_CAPACITY {
            return Err(RingBufError::TooLarge(capacity));
        }

        let region = MirroredRegion::new(capacity).map_err(RingBufError::Map)?;
        tracing::debug!(capacity, "ring buffer mapped");

        Ok(Self {
            shared: Arc::new(Shared {
                header: RingHeader::default(),
                region,
                capacity: capacity as u64,
                mask: capacity as u64 - 1,
                counters: Counters::default(),
                drain_lock: Mutex::new(()),
                wake_epoch: Mutex::new(0),
                wake_cv: Condvar::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.shared.clone())
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.shared.clone())
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    /// Current `(consumer_pos, producer_pos)`.
    pub fn positions(&self) -> (u64, u64) {
        let header = &self.shared.header;
        (
            header.consumer_pos.load(Ordering::Acquire),
            header.producer_pos.load(Ordering::Acquire),
        )
    }
}
