//! The per-packet capture transaction.
//!
//! [`CaptureHook::run`] is generic over where packets come from and where
//! records go, so the kernel classifier and the userspace simulation share a
//! single implementation of the encoding.

use crate::record::write_fields;
use crate::{put_u64, ContextHandle, Encoding, SkbFields, Wakeup, PAYLOAD_OFFSET};

/// A packet load could not be satisfied (out of bounds, helper failure).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadError;

/// Read access to the packet currently being processed.
pub trait PacketContext {
    /// Correlation token for this invocation.
    fn handle(&self) -> ContextHandle;

    /// Packet length in bytes.
    fn len(&self) -> u32;

    /// Copies `dst.len()` packet bytes starting at `offset`.
    fn load_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), LoadError>;

    /// skb metadata of the packet.
    fn metadata(&self) -> SkbFields;
}

/// A reserved, writable region of the ring buffer.
pub trait Reservation {
    /// The reserved bytes, exactly as long as requested.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Publishes the record to consumers.
    fn commit(self, wakeup: Wakeup);

    /// Releases the region without publishing a record.
    fn discard(self, wakeup: Wakeup);
}

/// Something records can be reserved in.
pub trait RecordSink {
    type Slot<'a>: Reservation
    where
        Self: 'a;

    /// Reserves `size` bytes. `None` means there is no room; callers drop the
    /// observation.
    fn reserve(&self, size: usize) -> Option<Self::Slot<'_>>;
}

/// Result of one hook invocation. The packet itself is never affected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// One record was committed.
    Emitted,
    /// The sink was full; nothing was written.
    Dropped,
}

/// Stateless capture logic bound to one encoding for its whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureHook {
    encoding: Encoding,
}

impl CaptureHook {
    pub const fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Bytes reserved per record.
    pub const fn record_len(&self) -> usize {
        self.encoding.record_len()
    }

    /// Emits at most one record describing `ctx` into `sink`.
    ///
    /// Bounded work, no allocation, never panics on short packets: payload
    /// bytes past the end of the packet are zero filled, and a failed packet
    /// load zero fills the whole payload.
    #[inline(always)]
    pub fn run<C, S>(&self, ctx: &C, sink: &S) -> Outcome
    where
        C: PacketContext,
        S: RecordSink,
    {
        let Some(mut slot) = sink.reserve(self.record_len()) else {
            return Outcome::Dropped;
        };

        let buf = slot.bytes_mut();
        put_u64(buf, 0, ctx.handle().as_raw());
        match self.encoding {
            Encoding::Raw | Encoding::Parameterized { .. } => {
                let payload_end = PAYLOAD_OFFSET + self.encoding.payload_len();
                if let Some(payload) = buf.get_mut(PAYLOAD_OFFSET..payload_end) {
                    copy_payload(ctx, payload);
                }
            }
            Encoding::Structured => write_fields(buf, &ctx.metadata()),
        }

        slot.commit(Wakeup::Suppress);
        Outcome::Emitted
    }
}

#[inline(always)]
fn copy_payload<C: PacketContext>(ctx: &C, payload: &mut [u8]) {
    let available = (ctx.len() as usize).min(payload.len());
    let (head, tail) = payload.split_at_mut(available);
    if !head.is_empty() && ctx.load_bytes(0, head).is_err() {
        zero_fill(head);
    }
    zero_fill(tail);
}

/// Upper bound on the payload of any encoding.
const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Zeroes `buf` byte by byte. The stores are volatile and the trip count has
/// a constant cap, so the classifier build never lowers this to a `memset`
/// call, which classifier sections cannot link.
#[inline(always)]
fn zero_fill(buf: &mut [u8]) {
    let len = buf.len().min(MAX_PAYLOAD_LEN);
    let ptr = buf.as_mut_ptr();
    for i in 0..MAX_PAYLOAD_LEN {
        if i >= len {
            break;
        }
        unsafe { core::ptr::write_volatile(ptr.add(i), 0) };
    }
}
