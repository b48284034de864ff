// Mirrored memory mapping backing the ring buffer data region.
//
// The same memfd pages are mapped twice, back to back, so a record that
// starts near the end of the region can be read and written as one
// contiguous slice that runs into the second copy.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

/// Returns the system page size.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[derive(Debug)]
pub(crate) struct MirroredRegion {
    base: NonNull<u8>,
    len: usize,
}

// The region is plain shared memory; synchronization is the ring's job.
unsafe impl Send for MirroredRegion {}
unsafe impl Sync for MirroredRegion {}

impl MirroredRegion {
    /// Maps `len` bytes twice. `len` must be a multiple of the page size.
    pub(crate) fn new(len: usize) -> io::Result<Self> {
        let fd = unsafe { libc::memfd_create(b"ringcap\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Closed on every return path; the mappings keep the pages alive.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let total = len * 2;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        for half in 0..2 {
            let addr = unsafe { base.cast::<u8>().add(half * len) };
            let mapped = unsafe {
                libc::mmap(
                    addr.cast(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(base, total) };
                return Err(err);
            }
        }

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { base, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MirroredRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.as_ptr().cast(), self.len() * 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_copy_aliases_first() {
        let len = page_size();
        let region = MirroredRegion::new(len).unwrap();
        assert_eq!(region.len(), len);
        unsafe {
            *region.as_ptr() = 0x5A;
            *region.as_ptr().add(len - 1) = 0xA5;
            assert_eq!(*region.as_ptr().add(len), 0x5A);
            assert_eq!(*region.as_ptr().add(2 * len - 1), 0xA5);
        }
    }
}
