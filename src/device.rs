//! Component B: the per-device record.
//!
//! Passive data: §4.B says this is constructed only by the lifecycle
//! component (4.E) and, once a worker owns it, is touched by nothing else.
//! We enforce that by moving the `Device` into the worker thread's closure
//! and never handing a second reference to it anywhere else — the live
//! device table (see [`crate::lifecycle`]) only ever holds a cancellation
//! handle, never the `Device` itself.

use std::any::Any;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::handler::Handler;
use crate::util::Mmap;

/// One active LUN: the kernel's notify-fd, the mapped command ring, and the
/// handler backing it, per §3's "Device" entry.
pub struct Device {
    /// Stable device identifier, e.g. `uio14`.
    pub uio_name: String,
    /// Backend-specific configuration, with the subtype prefix stripped.
    pub cfgstring: String,
    /// The kernel-side fd used for bidirectional "work available" signaling.
    pub notify_fd: OwnedFd,
    /// The device's shared-memory ring mapping.
    pub ring_map: Mmap,
    pub handler: Arc<dyn Handler>,
    /// Opaque per-device state the handler may attach in `open()`.
    pub handler_private: Option<Box<dyn Any + Send>>,
}

impl Device {
    pub fn new(
        uio_name: String,
        cfgstring: String,
        notify_fd: OwnedFd,
        ring_map: Mmap,
        handler: Arc<dyn Handler>,
    ) -> Device {
        Device {
            uio_name,
            cfgstring,
            notify_fd,
            ring_map,
            handler,
            handler_private: None,
        }
    }

    #[inline]
    pub fn map_len(&self) -> usize {
        self.ring_map.len()
    }

    #[inline]
    pub fn notify_raw_fd(&self) -> RawFd {
        self.notify_fd.as_raw_fd()
    }
}
