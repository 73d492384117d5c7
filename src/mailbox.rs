//! The command ring's wire layout and the raw, pointer-based accessors used
//! to read and write it in place.
//!
//! This is bit-exact with the kernel mailbox/entry layout described in §3 and
//! §6 of the spec: a fixed mailbox header followed by a wraparound byte
//! buffer of variable-length entries. The accessor style — raw pointers into
//! a single `mmap`, explicit `core::sync::atomic` loads/stores at the two
//! indices the kernel and the user hand back and forth — mirrors the teacher
//! crate's `squeue::Inner`/`cqueue::CompletionQueue`, which do the same thing
//! for an `io_uring` submission/completion ring.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::util::{unsync_load_u32, Mmap};

/// Fixed-format sense buffer length TCMU devices use (`SENSE_BUFFERSIZE` in
/// the kernel header; also what `vhost-user-scsi`-style userspace targets in
/// the wild use for their overlaid response area).
pub const SENSE_BUFFER_SIZE: usize = 96;

/// Entries are laid out on an 8-byte alignment; `len_op` packs the opcode
/// into the low 3 bits and the (always-aligned) entry length into the rest,
/// matching the kernel's `tcmu_hdr_get_op`/`tcmu_hdr_get_len` macros.
const OP_ALIGN_MASK: u32 = 0x7;

/// A ring entry's opcode, packed into the low bits of `len_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// A command to service.
    Cmd,
    /// Padding to the end of the ring; skip without invoking a handler.
    Pad,
    /// Anything else is treated exactly like `Pad` (§4.C: "unknown opcodes
    /// are ignored as PAD").
    Unknown(u8),
}

impl Opcode {
    const CMD: u8 = 1;
    const PAD: u8 = 2;

    fn from_raw(raw: u8) -> Opcode {
        match raw {
            Self::CMD => Opcode::Cmd,
            Self::PAD => Opcode::Pad,
            other => Opcode::Unknown(other),
        }
    }
}

/// SCSI status values this daemon ever writes back.
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// A view over the mailbox header at offset 0 of the mapping.
///
/// `cmdr_off`/`cmdr_size` are read once at construction (they never change
/// after the kernel maps the device); `cmd_head`/`cmd_tail` are read through
/// explicit atomics on every access, because they are the one part of this
/// struct that is genuinely raced with the kernel.
pub struct Mailbox<'a> {
    map: &'a Mmap,
    cmdr_off: u32,
    cmdr_size: u32,
    cmd_head: *const AtomicU32,
    cmd_tail: *const AtomicU32,
}

// Offsets within the mailbox header, in the order described by §6: cmdr_off,
// cmdr_size, cmd_head, cmd_tail, all native-endian u32.
const OFF_CMDR_OFF: usize = 0;
const OFF_CMDR_SIZE: usize = 4;
const OFF_CMD_HEAD: usize = 8;
const OFF_CMD_TAIL: usize = 12;

impl<'a> Mailbox<'a> {
    /// # Safety
    /// `map` must point at a mapping whose first bytes are a valid mailbox
    /// header, and must outlive the returned `Mailbox`.
    pub unsafe fn new(map: &'a Mmap) -> Mailbox<'a> {
        let cmdr_off = unsync_load_u32(map.offset(OFF_CMDR_OFF).cast());
        let cmdr_size = unsync_load_u32(map.offset(OFF_CMDR_SIZE).cast());
        let cmd_head = map.offset(OFF_CMD_HEAD) as *const AtomicU32;
        let cmd_tail = map.offset(OFF_CMD_TAIL) as *const AtomicU32;

        Mailbox {
            map,
            cmdr_off,
            cmdr_size,
            cmd_head,
            cmd_tail,
        }
    }

    /// The producer index, as last written by the kernel. Acquire ordering:
    /// anything the kernel wrote into the entry at that offset before
    /// bumping `cmd_head` must be visible to us after this load.
    #[inline]
    pub fn load_head(&self) -> u32 {
        unsafe { (*self.cmd_head).load(Ordering::Acquire) }
    }

    /// The consumer index as last written (by us, on a previous drain).
    /// Acquire ordering for symmetry with `load_head`, even though only this
    /// process ever writes it.
    #[inline]
    pub fn load_tail(&self) -> u32 {
        unsafe { (*self.cmd_tail).load(Ordering::Acquire) }
    }

    /// The consumer index we last wrote. Release ordering: every write we
    /// made into the entries up to `tail` must be visible to the kernel
    /// before it observes this store (and before the notify-fd poke that
    /// follows it).
    #[inline]
    pub fn store_tail(&self, tail: u32) {
        unsafe { (*self.cmd_tail).store(tail, Ordering::Release) }
    }

    #[inline]
    pub fn cmdr_size(&self) -> u32 {
        self.cmdr_size
    }

    /// A view over the entry currently at ring offset `tail`.
    ///
    /// # Safety
    /// `tail` must be `< cmdr_size`.
    pub unsafe fn entry_at(&self, tail: u32) -> EntryView<'a> {
        let base = self
            .map
            .offset(self.cmdr_off as usize + tail as usize)
            .cast::<u8>();
        EntryView::new(base, self.map.as_mut_ptr().cast::<u8>())
    }
}

/// Offsets within a single ring entry: an 8-byte header, then either a CMD
/// request body or (ignored) PAD filler.
mod entry_offsets {
    pub const LEN_OP: usize = 0;
    // CMD request body, immediately after the header.
    pub const CDB_OFF: usize = 8;
    pub const IOV_CNT: usize = 12;
    pub const IOV: usize = 16;
    // response overlay shares storage with the request body per §3.
    pub const SCSI_STATUS: usize = 8;
    pub const SENSE_BUFFER: usize = 9;
}

/// One `{iov_base, iov_len}` pair in a CMD entry's iovec array.
const IOV_ENTRY_SIZE: usize = 16;

/// A raw, pointer-based view over one ring entry.
///
/// All accessors are `unsafe` because they trust the entry header's
/// self-reported `len`/`iov_cnt` to stay within the mapping — exactly the
/// trust relationship the kernel's ring protocol already requires of any
/// consumer (this is not a safety boundary we can add back after the fact
/// without changing the wire format).
pub struct EntryView<'a> {
    base: *mut u8,
    mailbox_base: *mut u8,
    #[allow(dead_code)]
    marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> EntryView<'a> {
    fn new(base: *mut u8, mailbox_base: *mut u8) -> EntryView<'a> {
        EntryView {
            base,
            mailbox_base,
            marker: std::marker::PhantomData,
        }
    }

    unsafe fn read_u32(&self, off: usize) -> u32 {
        self.base.add(off).cast::<u32>().read_unaligned()
    }

    unsafe fn write_u8(&self, off: usize, v: u8) {
        self.base.add(off).write(v);
    }

    /// The packed `(opcode, length)` header word.
    pub unsafe fn opcode_and_len(&self) -> (Opcode, u32) {
        let len_op = self.read_u32(entry_offsets::LEN_OP);
        (
            Opcode::from_raw((len_op & OP_ALIGN_MASK) as u8),
            len_op & !OP_ALIGN_MASK,
        )
    }

    /// Absolute address of this entry's CDB, computed from the mailbox base
    /// and the entry's self-reported `cdb_off` (itself relative to the
    /// mailbox base, per §3).
    pub unsafe fn cdb_ptr(&self) -> *const u8 {
        let cdb_off = self.read_u32(entry_offsets::CDB_OFF);
        self.mailbox_base.add(cdb_off as usize)
    }

    pub unsafe fn iov_cnt(&self) -> u32 {
        self.read_u32(entry_offsets::IOV_CNT)
    }

    /// Rewrite `iov[i].iov_base` in place from a mailbox-relative offset to
    /// an absolute address, and return the (now absolute) `{ptr, len}` pair.
    ///
    /// Per §4.C this must happen exactly once per entry per drain; callers
    /// are responsible for not calling it twice on the same index.
    pub unsafe fn rewrite_iov(&self, index: u32) -> (*mut u8, usize) {
        let slot = self
            .base
            .add(entry_offsets::IOV + index as usize * IOV_ENTRY_SIZE);
        let iov_base_off = slot.cast::<u64>().read_unaligned();
        let iov_len = slot.add(8).cast::<u64>().read_unaligned();

        let abs = self.mailbox_base.add(iov_base_off as usize);
        slot.cast::<u64>().write_unaligned(abs as u64);

        (abs, iov_len as usize)
    }

    pub unsafe fn set_scsi_status(&self, status: u8) {
        self.write_u8(entry_offsets::SCSI_STATUS, status);
    }

    /// Fixed-format sense data for a handler-reported failure, per §4.C:
    /// response code 0x70 (fixed, current), sense key ILLEGAL REQUEST,
    /// additional sense length 0x0a, ASC/ASCQ INVALID COMMAND OPERATION
    /// CODE/0x00. Everything else in the buffer is left zeroed.
    pub unsafe fn write_illegal_request_sense(&self) {
        let sense = self.base.add(entry_offsets::SENSE_BUFFER);
        std::ptr::write_bytes(sense, 0, SENSE_BUFFER_SIZE);
        sense.add(0).write(0x70);
        sense.add(2).write(0x05);
        sense.add(7).write(0x0a);
        sense.add(12).write(0x20);
        sense.add(13).write(0x00);
    }
}

impl<'a> Clone for EntryView<'a> {
    fn clone(&self) -> Self {
        EntryView::new(self.base, self.mailbox_base)
    }
}
