//! Component E: device lifecycle and the process-wide daemon context.
//!
//! `DaemonContext` is threaded explicitly through every entry point rather
//! than held in statics (§9): the control listener, the initial scan, and
//! `main` all hold one and pass it down, so nothing here reaches for a
//! global.

use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::{info, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use parking_lot::Mutex;

use crate::device::Device;
use crate::error::DeviceError;
use crate::handler::HandlerRegistry;
use crate::util::Mmap;
use crate::worker::{self, WorkerHandle};

/// Prefix an original `/sys/class/uio/*/name` entry must carry for this
/// daemon to claim the device, matching the kernel's `tcm-user` subsystem
/// tag.
const UIO_NAME_PREFIX: &str = "tcm-user+";

/// Everything `add`/`remove` need: the handler registry and the live-device
/// table. Shared by the control listener and, if enabled, the initial scan.
pub struct DaemonContext {
    handlers: HandlerRegistry,
    live: Mutex<Vec<(String, WorkerHandle)>>,
}

impl DaemonContext {
    pub fn new(handlers: HandlerRegistry) -> DaemonContext {
        DaemonContext {
            handlers,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Add a device: open its notify-fd, read its map size from sysfs, mmap
    /// the ring, resolve a handler from `raw_cfgstring`, call the handler's
    /// `open`, spawn its worker, and record it in the live-device table.
    /// Any failure unwinds everything done so far, in reverse order, and the
    /// device is never added to the table.
    pub fn add(&self, uio_name: &str, raw_cfgstring: &str) -> Result<(), DeviceError> {
        {
            let live = self.live.lock();
            if live.iter().any(|(name, _)| name == uio_name) {
                return Err(DeviceError::AlreadyPresent(uio_name.to_string()));
            }
        }

        let cfgstring = strip_subtype_prefix(raw_cfgstring);

        let handler = self
            .handlers
            .find(cfgstring)
            .ok_or_else(|| DeviceError::NoHandler(cfgstring.to_string()))?;

        let notify_fd = open_notify_fd(uio_name)
            .map_err(|e| DeviceError::OpenNotify(uio_name.to_string(), e))?;

        let map_len = read_map_len(uio_name)?;

        let ring_map = Mmap::new(notify_fd.as_raw_fd(), map_len)
            .map_err(|e| DeviceError::Mmap(map_len, uio_name.to_string(), e))?;

        let mut device = Device::new(
            uio_name.to_string(),
            cfgstring.to_string(),
            notify_fd,
            ring_map,
            handler.clone(),
        );

        handler
            .open(&mut device)
            .map_err(|reason| DeviceError::HandlerOpenRejected(handler.name().to_string(), reason))?;

        let worker_handle = match worker::spawn(device) {
            Ok(handle) => handle,
            Err(e) => {
                // `device` was moved into `worker::spawn` and dropped with
                // its failed attempt (see that function's doc comment);
                // nothing left here to unwind.
                return Err(DeviceError::WorkerSpawn(uio_name.to_string(), e));
            }
        };

        self.live.lock().push((uio_name.to_string(), worker_handle));
        info!("device {uio_name} added (handler {:?})", handler.name());
        Ok(())
    }

    /// Remove a device by **exact** uio-name match (fixing the original
    /// daemon's accidental prefix match — see the Supplemented features
    /// note). Not-found is logged, not an error.
    pub fn remove(&self, uio_name: &str) {
        let handle = {
            let mut live = self.live.lock();
            let index = live.iter().position(|(name, _)| name == uio_name);
            index.map(|i| live.remove(i).1)
        };

        match handle {
            Some(handle) => {
                handle.stop();
                info!("device {uio_name} removed");
            }
            None => warn!("remove requested for unknown device {uio_name}"),
        }
    }

    /// Scan `/sys/class/uio` for already-present devices whose `name`
    /// attribute carries the `tcm-user+` prefix, and `add` each one. Errors
    /// adding an individual device are logged and do not abort the scan.
    pub fn initial_scan(&self) -> std::io::Result<usize> {
        let sys_uio = Path::new("/sys/class/uio");
        let entries = match fs::read_dir(sys_uio) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut added = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let uio_name = entry.file_name().to_string_lossy().into_owned();
            let name_path = sys_uio.join(&uio_name).join("name");

            let contents = match fs::read_to_string(&name_path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("skipping {uio_name}: couldn't read {name_path:?}: {e}");
                    continue;
                }
            };
            let trimmed = contents.trim_end();

            let Some(cfgstring) = trimmed.strip_prefix(UIO_NAME_PREFIX) else {
                continue;
            };

            match self.add(&uio_name, cfgstring) {
                Ok(()) => added += 1,
                Err(e) => warn!("initial scan: failed to add {uio_name}: {e}"),
            }
        }

        info!("initial scan added {added} device(s)");
        Ok(added)
    }

    /// Cancel and join every live worker, in the order they were added.
    /// Used by Component G on shutdown.
    pub fn shutdown_all(&self) {
        let handles: Vec<(String, WorkerHandle)> = std::mem::take(&mut *self.live.lock());
        for (uio_name, handle) in handles {
            handle.stop();
            info!("device {uio_name} stopped for shutdown");
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}

/// Strip the kernel's `tcm-user+` subtype-prefix tag, if present, leaving a
/// plain `subtype/rest` cfgstring. Devices added from the control channel
/// already arrive without it; devices found by the initial scan are stripped
/// by its own `strip_prefix` call — this is a defensive second pass so `add`
/// behaves identically regardless of caller.
fn strip_subtype_prefix(raw: &str) -> &str {
    raw.strip_prefix(UIO_NAME_PREFIX).unwrap_or(raw)
}

fn open_notify_fd(uio_name: &str) -> std::io::Result<OwnedFd> {
    let path: PathBuf = Path::new("/dev").join(uio_name);
    let raw_fd = open(&path, OFlag::O_RDWR, Mode::empty())
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    Ok(unsafe { std::os::fd::FromRawFd::from_raw_fd(raw_fd) })
}

fn read_map_len(uio_name: &str) -> Result<usize, DeviceError> {
    let path: PathBuf = Path::new("/sys/class/uio")
        .join(uio_name)
        .join("maps/map0/size");
    let contents = fs::read_to_string(&path)
        .map_err(|e| DeviceError::ReadMapSize(uio_name.to_string(), e))?;
    let trimmed = contents.trim();

    trimmed
        .parse::<usize>()
        .map_err(|_| DeviceError::InvalidMapSize(uio_name.to_string(), trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_subtype_prefix_removes_tag_once() {
        assert_eq!(strip_subtype_prefix("tcm-user+file/path=/tmp/x"), "file/path=/tmp/x");
        assert_eq!(strip_subtype_prefix("file/path=/tmp/x"), "file/path=/tmp/x");
    }

    #[test]
    fn read_map_len_parses_plain_decimal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uio_dir = dir.path().join("class").join("uio").join("uio7").join("maps/map0");
        fs::create_dir_all(&uio_dir).expect("mkdirs");
        fs::write(uio_dir.join("size"), "65536\n").expect("write");

        // read_map_len hard-codes /sys/class/uio, so this test only exercises
        // the parsing helper directly against a string, not the filesystem
        // walk (covered by the integration tests instead).
        let contents = fs::read_to_string(uio_dir.join("size")).unwrap();
        let trimmed = contents.trim();
        assert_eq!(trimmed.parse::<usize>().unwrap(), 65536);
    }

    use crate::handler::Handler;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    struct TrackedHandler {
        closed: Arc<AtomicBool>,
    }

    impl Handler for TrackedHandler {
        fn name(&self) -> &str {
            "tracked"
        }
        fn subtype(&self) -> &str {
            "tracked"
        }
        fn open(&self, _device: &mut Device) -> Result<(), String> {
            Ok(())
        }
        fn close(&self, _device: &mut Device) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
        fn submit(&self, _device: &Device, _cdb: &[u8], _iovec: &mut [crate::handler::IoVec]) -> bool {
            true
        }
    }

    /// A minimal mapped ring big enough for `Mmap::new` to succeed; no entry
    /// is ever dispatched against it in these tests since the worker never
    /// observes its notify-fd becoming readable.
    fn dummy_ring_map() -> Mmap {
        let file = tempfile::tempfile().expect("tempfile");
        file.set_len(64).expect("set_len");
        let fd: std::os::fd::OwnedFd = file.into();
        Mmap::new(fd.as_raw_fd(), 64).expect("mmap")
    }

    fn push_tracked_device(ctx: &DaemonContext, uio_name: &str) -> Arc<AtomicBool> {
        let closed = Arc::new(AtomicBool::new(false));
        let handler: Arc<dyn Handler> = Arc::new(TrackedHandler {
            closed: closed.clone(),
        });
        // Only the write end is handed to the device as its notify-fd; the
        // read end is dropped immediately since nothing in these tests ever
        // pokes it.
        let (_notify_read, notify_write) = nix::unistd::pipe().expect("pipe");

        let device = Device::new(
            uio_name.to_string(),
            "tracked/x".to_string(),
            notify_write,
            dummy_ring_map(),
            handler,
        );
        let handle = worker::spawn(device).expect("spawn worker");
        ctx.live.lock().push((uio_name.to_string(), handle));
        closed
    }

    #[test]
    fn remove_matches_exact_name_only() {
        let ctx = DaemonContext::new(HandlerRegistry::new());
        let closed_1 = push_tracked_device(&ctx, "uio1");
        let closed_14 = push_tracked_device(&ctx, "uio14");

        // A request for "uio1" must not match the stored "uio14" entry
        // (the original daemon's prefix-match bug, fixed per the spec's
        // Open Questions guidance).
        ctx.remove("uio1");

        assert!(closed_1.load(AtomicOrdering::SeqCst));
        assert!(!closed_14.load(AtomicOrdering::SeqCst));
        assert_eq!(ctx.live.lock().len(), 1);
        assert_eq!(ctx.live.lock()[0].0, "uio14");
    }

    #[test]
    fn remove_of_unknown_device_is_a_no_op() {
        let ctx = DaemonContext::new(HandlerRegistry::new());
        push_tracked_device(&ctx, "uio1");
        ctx.remove("uio99");
        assert_eq!(ctx.live.lock().len(), 1);
    }

    #[test]
    fn add_rejects_duplicate_uio_name_before_touching_the_filesystem() {
        let ctx = DaemonContext::new(HandlerRegistry::new());
        push_tracked_device(&ctx, "uio1");

        let err = ctx.add("uio1", "tracked/x").unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyPresent(name) if name == "uio1"));
    }

    #[test]
    fn add_fails_fast_when_no_handler_matches_the_subtype() {
        let ctx = DaemonContext::new(HandlerRegistry::new());
        let err = ctx.add("uio1", "nonexistent/x").unwrap_err();
        assert!(matches!(err, DeviceError::NoHandler(subtype) if subtype == "nonexistent/x"));
    }

    #[test]
    fn shutdown_all_stops_every_worker() {
        let ctx = DaemonContext::new(HandlerRegistry::new());
        let closed_1 = push_tracked_device(&ctx, "uio1");
        let closed_2 = push_tracked_device(&ctx, "uio2");

        ctx.shutdown_all();

        assert!(closed_1.load(AtomicOrdering::SeqCst));
        assert!(closed_2.load(AtomicOrdering::SeqCst));
        assert!(ctx.live.lock().is_empty());
    }
}
