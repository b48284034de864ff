//! Record wire format.
//!
//! All integers are in the producing host's native byte order. Records carry
//! no version field; the active [`Encoding`](crate::Encoding) is agreed out of
//! band.

use crate::{
    get_u32, get_u64, put_u32, put_u64, ContextHandle, CB_SLOTS, HANDLE_LEN, META_RECORD_LEN,
    PAYLOAD_OFFSET, RAW_PAYLOAD_LEN, RAW_RECORD_LEN,
};

const OFF_LEN: usize = 8;
const OFF_PKT_TYPE: usize = 12;
const OFF_MARK: usize = 16;
const OFF_QUEUE_MAPPING: usize = 20;
const OFF_PROTOCOL: usize = 24;
const OFF_VLAN_PRESENT: usize = 28;
const OFF_VLAN_TCI: usize = 32;
const OFF_VLAN_PROTO: usize = 36;
const OFF_PRIORITY: usize = 40;
const OFF_INGRESS_IFINDEX: usize = 44;
const OFF_IFINDEX: usize = 48;
const OFF_TC_INDEX: usize = 52;
const OFF_CB: usize = 56;

/// Packet metadata as exposed by `struct __sk_buff`.
///
/// `protocol` and `vlan_proto` are in network byte order, exactly as the
/// kernel reports them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SkbFields {
    pub len: u32,
    pub pkt_type: u32,
    pub mark: u32,
    pub queue_mapping: u32,
    pub protocol: u32,
    pub vlan_present: u32,
    pub vlan_tci: u32,
    pub vlan_proto: u32,
    pub priority: u32,
    pub ingress_ifindex: u32,
    pub ifindex: u32,
    pub tc_index: u32,
    pub cb: [u32; CB_SLOTS],
}

impl SkbFields {
    /// The twelve scalar fields in wire order.
    pub const fn scalars(&self) -> [u32; 12] {
        [
            self.len,
            self.pkt_type,
            self.mark,
            self.queue_mapping,
            self.protocol,
            self.vlan_present,
            self.vlan_tci,
            self.vlan_proto,
            self.priority,
            self.ingress_ifindex,
            self.ifindex,
            self.tc_index,
        ]
    }
}

/// Raw capture: handle plus a zero padded 1024 byte packet prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawCapture<'a> {
    pub handle: ContextHandle,
    pub payload: &'a [u8; RAW_PAYLOAD_LEN],
}

impl<'a> RawCapture<'a> {
    pub fn decode(record: &'a [u8]) -> Option<Self> {
        let handle = ContextHandle::from_raw(get_u64(record, 0)?);
        let payload = record.get(PAYLOAD_OFFSET..RAW_RECORD_LEN)?.try_into().ok()?;
        Some(Self { handle, payload })
    }
}

/// Parameterized capture: handle plus `capture_size` packet bytes.
///
/// The length is not stored in the record; the consumer must know the
/// `capture_size` the hook was attached with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterizedCapture<'a> {
    pub handle: ContextHandle,
    pub payload: &'a [u8],
}

impl<'a> ParameterizedCapture<'a> {
    pub fn decode(record: &'a [u8], capture_size: u16) -> Option<Self> {
        let handle = ContextHandle::from_raw(get_u64(record, 0)?);
        let payload = record.get(PAYLOAD_OFFSET..HANDLE_LEN + capture_size as usize)?;
        Some(Self { handle, payload })
    }
}

/// Structured metadata record, 76 bytes on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct StructuredMeta {
    pub handle: ContextHandle,
    pub fields: SkbFields,
}

impl StructuredMeta {
    pub const WIRE_LEN: usize = META_RECORD_LEN;

    /// Writes the record into `out`. Returns `false` (writing nothing) if
    /// `out` is shorter than [`Self::WIRE_LEN`].
    #[inline(always)]
    pub fn encode(&self, out: &mut [u8]) -> bool {
        if out.len() < Self::WIRE_LEN {
            return false;
        }
        put_u64(out, 0, self.handle.as_raw());
        write_fields(out, &self.fields);
        true
    }

    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() < Self::WIRE_LEN {
            return None;
        }
        let mut cb = [0u32; CB_SLOTS];
        for (i, slot) in cb.iter_mut().enumerate() {
            *slot = get_u32(record, OFF_CB + 4 * i)?;
        }
        Some(Self {
            handle: ContextHandle::from_raw(get_u64(record, 0)?),
            fields: SkbFields {
                len: get_u32(record, OFF_LEN)?,
                pkt_type: get_u32(record, OFF_PKT_TYPE)?,
                mark: get_u32(record, OFF_MARK)?,
                queue_mapping: get_u32(record, OFF_QUEUE_MAPPING)?,
                protocol: get_u32(record, OFF_PROTOCOL)?,
                vlan_present: get_u32(record, OFF_VLAN_PRESENT)?,
                vlan_tci: get_u32(record, OFF_VLAN_TCI)?,
                vlan_proto: get_u32(record, OFF_VLAN_PROTO)?,
                priority: get_u32(record, OFF_PRIORITY)?,
                ingress_ifindex: get_u32(record, OFF_INGRESS_IFINDEX)?,
                ifindex: get_u32(record, OFF_IFINDEX)?,
                tc_index: get_u32(record, OFF_TC_INDEX)?,
                cb,
            },
        })
    }
}

/// Writes the skb fields at their wire offsets, leaving the handle alone.
#[inline(always)]
pub(crate) fn write_fields(out: &mut [u8], f: &SkbFields) {
    put_u32(out, OFF_LEN, f.len);
    put_u32(out, OFF_PKT_TYPE, f.pkt_type);
    put_u32(out, OFF_MARK, f.mark);
    put_u32(out, OFF_QUEUE_MAPPING, f.queue_mapping);
    put_u32(out, OFF_PROTOCOL, f.protocol);
    put_u32(out, OFF_VLAN_PRESENT, f.vlan_present);
    put_u32(out, OFF_VLAN_TCI, f.vlan_tci);
    put_u32(out, OFF_VLAN_PROTO, f.vlan_proto);
    put_u32(out, OFF_PRIORITY, f.priority);
    put_u32(out, OFF_INGRESS_IFINDEX, f.ingress_ifindex);
    put_u32(out, OFF_IFINDEX, f.ifindex);
    put_u32(out, OFF_TC_INDEX, f.tc_index);
    put_u32(out, OFF_CB, f.cb[0]);
    put_u32(out, OFF_CB + 4, f.cb[1]);
    put_u32(out, OFF_CB + 8, f.cb[2]);
    put_u32(out, OFF_CB + 12, f.cb[3]);
    put_u32(out, OFF_CB + 16, f.cb[4]);
}
