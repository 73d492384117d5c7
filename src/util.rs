//! Small shared helpers: a mapped-memory guard and a raw, non-atomic load
//! used by [`crate::mailbox`] for the fields of the ring that are only ever
//! written once, at mapping time.

use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::{io, ptr};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

/// A region of memory mapped with `mmap(2)` over a device file descriptor.
///
/// Mirrors the teacher crate's own `util::Mmap`: a `NonNull` pointer plus a
/// length, unmapped on `Drop`. The mapping is always `PROT_READ|PROT_WRITE`,
/// `MAP_SHARED` — the ring is written by both the kernel and us.
pub struct Mmap {
    addr: NonNull<libc::c_void>,
    len: usize,
}

impl Mmap {
    /// Map `len` bytes of `fd` starting at file offset 0.
    pub fn new(fd: RawFd, len: usize) -> io::Result<Mmap> {
        let len = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"))?;

        unsafe {
            let fd = BorrowedFd::borrow_raw(fd);
            let addr = mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

            Ok(Mmap {
                addr: NonNull::new_unchecked(addr.as_ptr()),
                len: len.get(),
            })
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut libc::c_void {
        self.addr.as_ptr()
    }

    /// Get a pointer to the data at the given byte offset.
    ///
    /// # Safety
    /// `offset` must be within `[0, self.len())` for the returned pointer to
    /// be dereferenced; this function itself only performs pointer arithmetic.
    #[inline]
    pub unsafe fn offset(&self, offset: usize) -> *mut libc::c_void {
        self.as_mut_ptr().add(offset)
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr, self.len);
        }
    }
}

// Points at kernel-shared memory; the worker thread that owns the `Device`
// moves it across the spawn boundary. The mailbox's explicit acquire/release
// accesses are what make the actual cross-thread/cross-domain traffic sound.
unsafe impl Send for Mmap {}

/// Load a `u32` without an atomic instruction.
///
/// Used for the mailbox fields that are written once at mapping time and
/// never again (`cmdr_off`, `cmdr_size`), exactly like the teacher crate's
/// `unsync_load` for its ring masks.
#[inline(always)]
pub unsafe fn unsync_load_u32(p: *const u32) -> u32 {
    ptr::read(p)
}
