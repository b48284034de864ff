#![cfg_attr(not(test), no_std)]

//! Types shared between the `ringcap` TC classifiers and userspace.
//!
//! Everything here is allocation free so the same encoding code runs inside
//! the kernel program and inside the userspace ring buffer simulation.

pub mod hook;
pub mod record;

pub use hook::{CaptureHook, LoadError, Outcome, PacketContext, RecordSink, Reservation};
pub use record::{ParameterizedCapture, RawCapture, SkbFields, StructuredMeta};

/// Size of the context handle that leads every record.
pub const HANDLE_LEN: usize = 8;
/// Offset of the variant specific part of a record.
pub const PAYLOAD_OFFSET: usize = HANDLE_LEN;
/// Bytes copied from the packet by the raw variant.
pub const RAW_PAYLOAD_LEN: usize = 1024;
/// Total length of a raw capture record.
pub const RAW_RECORD_LEN: usize = HANDLE_LEN + RAW_PAYLOAD_LEN;
/// Number of generic `cb` annotation slots carried by structured records.
pub const CB_SLOTS: usize = 5;
/// Number of scalar skb fields carried by structured records.
pub const META_FIELDS: usize = 12;
/// Total length of a structured metadata record.
pub const META_RECORD_LEN: usize = HANDLE_LEN + 4 * (META_FIELDS + CB_SLOTS);

/// `bpf_ringbuf_submit` flag: do not notify the consumer.
pub const BPF_RB_NO_WAKEUP: u64 = 1;
/// `bpf_ringbuf_submit` flag: always notify the consumer.
pub const BPF_RB_FORCE_WAKEUP: u64 = 2;

/// Correlates a record with the processing context that produced it.
///
/// The top 16 bits carry the CPU (processing context) id, the low 48 bits a
/// sequence number local to that context. It is never an address.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextHandle(u64);

impl ContextHandle {
    const SEQ_BITS: u32 = 48;
    const SEQ_MASK: u64 = (1 << Self::SEQ_BITS) - 1;

    pub const fn new(cpu: u16, sequence: u64) -> Self {
        Self(((cpu as u64) << Self::SEQ_BITS) | (sequence & Self::SEQ_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn cpu(self) -> u16 {
        (self.0 >> Self::SEQ_BITS) as u16
    }

    pub const fn sequence(self) -> u64 {
        self.0 & Self::SEQ_MASK
    }
}

/// Consumer notification policy applied when a record is committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// Notify only if the consumer has already caught up to this record.
    Adaptive,
    /// Never notify; the consumer polls.
    Suppress,
    /// Always notify.
    Force,
}

impl Wakeup {
    /// Raw `bpf_ringbuf_submit` / `bpf_ringbuf_discard` flags.
    pub const fn flags(self) -> u64 {
        match self {
            Wakeup::Adaptive => 0,
            Wakeup::Suppress => BPF_RB_NO_WAKEUP,
            Wakeup::Force => BPF_RB_FORCE_WAKEUP,
        }
    }
}

/// Record shape produced by the capture hook.
///
/// Selection is out of band: producer and consumer must agree on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize),
    serde(rename_all = "snake_case")
)]
pub enum Encoding {
    /// Handle plus the first 1024 packet bytes.
    Raw,
    /// Handle plus the first `capture_size` packet bytes.
    Parameterized { capture_size: u16 },
    /// Handle plus skb metadata, no packet bytes.
    Structured,
}

impl Encoding {
    /// Total record length reserved in the ring buffer.
    pub const fn record_len(self) -> usize {
        match self {
            Encoding::Raw => RAW_RECORD_LEN,
            Encoding::Parameterized { capture_size } => HANDLE_LEN + capture_size as usize,
            Encoding::Structured => META_RECORD_LEN,
        }
    }

    /// Number of packet bytes copied into each record.
    pub const fn payload_len(self) -> usize {
        match self {
            Encoding::Raw => RAW_PAYLOAD_LEN,
            Encoding::Parameterized { capture_size } => capture_size as usize,
            Encoding::Structured => 0,
        }
    }
}

#[inline(always)]
pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    if let Some(dst) = buf.get_mut(offset..offset + 4) {
        dst.copy_from_slice(&value.to_ne_bytes());
    }
}

#[inline(always)]
pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    if let Some(dst) = buf.get_mut(offset..offset + 8) {
        dst.copy_from_slice(&value.to_ne_bytes());
    }
}

#[inline(always)]
pub(crate) fn get_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
pub(crate) fn get_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let b = buf.get(offset..offset + 8)?;
    Some(u64::from_ne_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}
