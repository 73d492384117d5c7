//! Component C: the ring dispatcher.
//!
//! `drain` walks every entry between the ring's consumer and producer
//! indices exactly once, in producer order, dispatches each CMD entry to
//! its device's handler, and pokes the kernel's notify-fd iff it consumed
//! at least one entry — §4.C, verbatim.

use std::os::fd::AsFd;

use log::{debug, trace};
use nix::unistd::write;

use crate::device::Device;
use crate::handler::IoVec;
use crate::mailbox::{scsi_status, Mailbox, Opcode};

/// The 4-byte token written to the notify-fd to signal the kernel. Per §4.C
/// and §6 its value is not interpreted by the kernel — only the write
/// itself (the edge) matters — so any fixed pattern works; this one matches
/// the original daemon's `poke_kernel`.
const POKE_TOKEN: [u8; 4] = 0xabcdef12u32.to_ne_bytes();

/// Drain every ring entry currently available, dispatching CMD entries to
/// `device.handler` and skipping PAD (and unknown) entries. Never returns
/// partial progress: on return, `tail == head` as observed at entry to this
/// call (a concurrent kernel write past `head` is picked up on the next
/// call, driven by the next notify-fd wakeup).
pub fn drain(device: &mut Device) -> std::io::Result<()> {
    let mailbox = unsafe { Mailbox::new(&device.ring_map) };

    let head = mailbox.load_head();
    let mut tail = mailbox.load_tail();
    let mut consumed = false;

    while tail != head {
        let entry = unsafe { mailbox.entry_at(tail) };
        let (opcode, len) = unsafe { entry.opcode_and_len() };

        match opcode {
            Opcode::Cmd => {
                trace!("dispatching CMD entry at tail {tail} (len {len})");
                dispatch_cmd(device, &entry);
            }
            Opcode::Pad | Opcode::Unknown(_) => {
                trace!("skipping {opcode:?} entry at tail {tail} (len {len})");
            }
        }

        tail = (tail + len) % mailbox.cmdr_size();
        mailbox.store_tail(tail);
        consumed = true;
    }

    if consumed {
        poke_kernel(device)?;
    }

    Ok(())
}

fn dispatch_cmd(device: &Device, entry: &crate::mailbox::EntryView<'_>) {
    let cdb_ptr = unsafe { entry.cdb_ptr() };
    // SAFETY: the CDB's length is not carried in the ring header; SCSI CDBs
    // are self-describing from their opcode byte, but without decoding it
    // here we read a fixed, generously-sized window — handlers that need
    // more structure decode the opcode themselves, exactly as the original
    // daemon hands handlers a raw `uint8_t *cdb` with no length.
    const MAX_CDB_LEN: usize = 32;
    let cdb = unsafe { std::slice::from_raw_parts(cdb_ptr, MAX_CDB_LEN) };

    let iov_cnt = unsafe { entry.iov_cnt() };
    let mut iovec: Vec<IoVec> = (0..iov_cnt)
        .map(|i| {
            let (base, len) = unsafe { entry.rewrite_iov(i) };
            IoVec { base, len }
        })
        .collect();

    let ok = device.handler.submit(device, cdb, &mut iovec);

    if ok {
        unsafe { entry.set_scsi_status(scsi_status::GOOD) };
    } else {
        unsafe {
            entry.set_scsi_status(scsi_status::CHECK_CONDITION);
            entry.write_illegal_request_sense();
        }
        debug!("handler rejected CDB opcode {:#04x}", cdb[0]);
    }
}

fn poke_kernel(device: &mut Device) -> std::io::Result<()> {
    write(device.notify_fd.as_fd(), &POKE_TOKEN)
        .map(|_| ())
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}
