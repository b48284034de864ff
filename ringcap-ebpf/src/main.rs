#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    cty::c_void,
    helpers::{bpf_get_smp_processor_id, bpf_ringbuf_discard, bpf_ringbuf_reserve, bpf_ringbuf_submit},
    macros::{classifier, map},
    maps::{PerCpuArray, RingBuf},
    programs::TcContext,
};
use core::slice;
use ringcap_common::{
    CaptureHook, ContextHandle, Encoding, LoadError, PacketContext, RecordSink, Reservation,
    SkbFields, Wakeup,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 13] = *b"Dual MIT/GPL\0";

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1 << 30, 0);

/// Next sequence number of each CPU, folded into the context handle.
#[map]
static HANDLE_SEQ: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Records that did not fit into `EVENTS`.
#[map]
static DROPS: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Payload bytes per record for `ringcap_param`. Set by the loader before the
/// object is loaded; the verifier sees it as a constant.
#[no_mangle]
static CAPTURE_SIZE: u16 = 128;

#[classifier]
pub fn ringcap_raw(ctx: TcContext) -> i32 {
    capture(&ctx, Encoding::Raw)
}

#[classifier]
pub fn ringcap_param(ctx: TcContext) -> i32 {
    let capture_size = unsafe { core::ptr::read_volatile(&CAPTURE_SIZE) };
    capture(&ctx, Encoding::Parameterized { capture_size })
}

#[classifier]
pub fn ringcap_meta(ctx: TcContext) -> i32 {
    capture(&ctx, Encoding::Structured)
}

/// The packet always continues through the stack, whether or not a record
/// was emitted.
#[inline(always)]
fn capture(ctx: &TcContext, encoding: Encoding) -> i32 {
    let packet = TcPacket {
        ctx,
        handle: next_handle(),
    };
    CaptureHook::new(encoding).run(&packet, &KernelRing);
    TC_ACT_OK
}

#[inline(always)]
fn next_handle() -> ContextHandle {
    let cpu = unsafe { bpf_get_smp_processor_id() } as u16;
    let seq = match HANDLE_SEQ.get_ptr_mut(0) {
        Some(p) => unsafe {
            let seq = *p;
            *p = seq.wrapping_add(1);
            seq
        },
        None => 0,
    };
    ContextHandle::new(cpu, seq)
}

struct TcPacket<'a> {
    ctx: &'a TcContext,
    handle: ContextHandle,
}

impl PacketContext for TcPacket<'_> {
    fn handle(&self) -> ContextHandle {
        self.handle
    }

    fn len(&self) -> u32 {
        self.ctx.len()
    }

    fn load_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), LoadError> {
        self.ctx
            .load_bytes(offset, dst)
            .map(|_| ())
            .map_err(|_| LoadError)
    }

    // Field by field: a whole-struct copy would pull in `memcpy`.
    fn metadata(&self) -> SkbFields {
        let skb = self.ctx.skb.skb;
        unsafe {
            SkbFields {
                len: (*skb).len,
                pkt_type: (*skb).pkt_type,
                mark: (*skb).mark,
                queue_mapping: (*skb).queue_mapping,
                protocol: (*skb).protocol,
                vlan_present: (*skb).vlan_present,
                vlan_tci: (*skb).vlan_tci,
                vlan_proto: (*skb).vlan_proto,
                priority: (*skb).priority,
                ingress_ifindex: (*skb).ingress_ifindex,
                ifindex: (*skb).ifindex,
                tc_index: (*skb).tc_index,
                cb: [
                    (*skb).cb[0],
                    (*skb).cb[1],
                    (*skb).cb[2],
                    (*skb).cb[3],
                    (*skb).cb[4],
                ],
            }
        }
    }
}

/// `EVENTS` seen through the hook's sink interface.
struct KernelRing;

struct KernelSlot {
    data: *mut u8,
    len: usize,
}

impl RecordSink for KernelRing {
    type Slot<'a> = KernelSlot;

    #[inline(always)]
    fn reserve(&self, size: usize) -> Option<KernelSlot> {
        let map = &EVENTS as *const RingBuf as *mut c_void;
        let data = unsafe { bpf_ringbuf_reserve(map, size as u64, 0) } as *mut u8;
        if data.is_null() {
            if let Some(p) = DROPS.get_ptr_mut(0) {
                unsafe { *p += 1 };
            }
            return None;
        }
        Some(KernelSlot { data, len: size })
    }
}

impl Reservation for KernelSlot {
    #[inline(always)]
    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }

    #[inline(always)]
    fn commit(self, wakeup: Wakeup) {
        unsafe { bpf_ringbuf_submit(self.data as *mut c_void, wakeup.flags()) };
    }

    #[inline(always)]
    fn discard(self, wakeup: Wakeup) {
        unsafe { bpf_ringbuf_discard(self.data as *mut c_void, wakeup.flags()) };
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
