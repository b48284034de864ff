//! Packet capture hook and BPF-style ring buffer, with the userspace tooling
//! to benchmark it in process or drive the kernel classifier.

pub mod attach;
pub mod bench;
pub mod config;
pub mod decode;
pub mod packet;
pub mod ringbuf;
pub mod stats;
