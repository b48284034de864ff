//! Userspace stand-ins for the kernel's packet context.
//!
//! A [`ProcessingContext`] plays the role of one CPU running the classifier:
//! it hands out [`SimPacket`]s whose context handles carry its id and a
//! private sequence number, exactly like the kernel program builds them from
//! the CPU id and a per-CPU counter.

use ringcap_common::{ContextHandle, LoadError, PacketContext, SkbFields};

/// `ETH_P_IP`.
pub const ETH_P_IP: u16 = 0x0800;

/// One packet as seen by the capture hook.
#[derive(Debug, Clone, Copy)]
pub struct SimPacket<'a> {
    handle: ContextHandle,
    data: &'a [u8],
    fields: SkbFields,
}

impl<'a> SimPacket<'a> {
    pub fn new(handle: ContextHandle, data: &'a [u8], fields: SkbFields) -> Self {
        Self {
            handle,
            data,
            fields,
        }
    }
}

impl PacketContext for SimPacket<'_> {
    fn handle(&self) -> ContextHandle {
        self.handle
    }

    fn len(&self) -> u32 {
        self.data.len() as u32
    }

    fn load_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), LoadError> {
        let end = offset.checked_add(dst.len()).ok_or(LoadError)?;
        let src = self.data.get(offset..end).ok_or(LoadError)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn metadata(&self) -> SkbFields {
        self.fields
    }
}

/// A simulated CPU running the hook.
#[derive(Debug)]
pub struct ProcessingContext {
    cpu: u16,
    next_sequence: u64,
}

impl ProcessingContext {
    pub fn new(cpu: u16) -> Self {
        Self {
            cpu,
            next_sequence: 0,
        }
    }

    /// Wraps `data` for one hook invocation, assigning the next handle.
    pub fn packet<'a>(&mut self, data: &'a [u8], fields: SkbFields) -> SimPacket<'a> {
        let handle = ContextHandle::new(self.cpu, self.next_sequence);
        self.next_sequence += 1;
        SimPacket::new(handle, data, fields)
    }
}

/// skb metadata for an untagged IPv4 frame of `len` bytes received on
/// `ifindex`. `protocol` is big endian, as the kernel stores it.
pub fn ipv4_fields(len: u32, ifindex: u32) -> SkbFields {
    SkbFields {
        len,
        protocol: u32::from(ETH_P_IP.to_be()),
        ingress_ifindex: ifindex,
        ifindex,
        ..Default::default()
    }
}

/// A deterministic Ethernet + IPv4 frame of `len` bytes.
///
/// Frames shorter than the two headers are just truncated.
pub fn sample_frame(len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    let mut header = [0u8; 34];
    header[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    header[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    header[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
    header[14] = 0x45;
    let ip_len = len.saturating_sub(14).min(u16::MAX as usize) as u16;
    header[16..18].copy_from_slice(&ip_len.to_be_bytes());
    header[22] = 64;
    header[23] = 17;
    header[26..30].copy_from_slice(&[10, 0, 0, 1]);
    header[30..34].copy_from_slice(&[10, 0, 0, 2]);

    let n = header.len().min(len);
    frame[..n].copy_from_slice(&header[..n]);
    for (i, byte) in frame.iter_mut().enumerate().skip(header.len()) {
        *byte = i as u8;
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_sequential_per_context() {
        let data = [0u8; 4];
        let mut cpu0 = ProcessingContext::new(0);
        let mut cpu1 = ProcessingContext::new(1);

        let a = cpu0.packet(&data, SkbFields::default()).handle();
        let b = cpu0.packet(&data, SkbFields::default()).handle();
        let c = cpu1.packet(&data, SkbFields::default()).handle();

        assert_eq!((a.cpu(), a.sequence()), (0, 0));
        assert_eq!((b.cpu(), b.sequence()), (0, 1));
        assert_eq!((c.cpu(), c.sequence()), (1, 0));
        assert_ne!(a, c);
    }

    #[test]
    fn test_load_bytes_bounds() {
        let data = [1u8, 2, 3, 4];
        let packet = SimPacket::new(ContextHandle::default(), &data, SkbFields::default());
        let mut dst = [0u8; 2];
        assert!(packet.load_bytes(2, &mut dst).is_ok());
        assert_eq!(dst, [3, 4]);
        assert_eq!(packet.load_bytes(3, &mut dst), Err(LoadError));
        assert_eq!(packet.load_bytes(usize::MAX, &mut dst), Err(LoadError));
    }

    #[test]
    fn test_sample_frame() {
        let frame = sample_frame(128);
        assert_eq!(frame.len(), 128);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(frame[14], 0x45);
        assert_eq!(u16::from_be_bytes([frame[16], frame[17]]), 114);
        assert_eq!(sample_frame(10).len(), 10);
    }

    #[test]
    fn test_ipv4_fields_protocol_is_network_order() {
        let fields = ipv4_fields(1500, 2);
        assert_eq!(fields.protocol as u16, ETH_P_IP.to_be());
        assert_eq!(fields.len, 1500);
        assert_eq!(fields.ifindex, 2);
    }
}
