//! Component D: the per-device worker loop.
//!
//! One OS thread per active device, blocked in `poll(2)` on two fds: the
//! kernel's notify-fd (readable whenever new ring entries may be available)
//! and a self-pipe cancellation fd (readable exactly once, when
//! `lifecycle::remove` wants this worker to stop). There is no sound way to
//! interrupt a thread blocked in a blocking syscall from the outside in safe
//! Rust — §4.D calls for the self-pipe/eventfd idiom instead of relying on
//! something like `pthread_cancel`, which cannot unwind Rust stack frames
//! safely.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::thread::JoinHandle;

use log::{info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read};

use crate::device::Device;
use crate::dispatcher;

/// The kernel writes (and expects back) 4-byte tokens on the notify-fd; a
/// short read here means the fd was closed or is misbehaving, not more data
/// pending, so it ends the worker rather than spinning.
const NOTIFY_READ_LEN: usize = 4;

/// A running worker's handle, held by the live-device table (§4.E). Dropping
/// or calling `stop` is the only way anything outside the worker thread
/// touches device state, and it never touches more than this cancellation
/// pipe.
pub struct WorkerHandle {
    cancel_write: OwnedFd,
    join: Option<JoinHandle<()>>,
    uio_name: String,
}

impl WorkerHandle {
    /// Signal the worker to stop and block until its thread has returned,
    /// running the handler's `close()` and unmapping the ring (§4.D's
    /// mandatory cleanup) before this call returns.
    pub fn stop(mut self) {
        // A single byte is enough to wake `poll`; the worker doesn't read
        // this pipe's contents, only its readability.
        if let Err(e) = nix::unistd::write(self.cancel_write.as_fd(), &[0u8]) {
            warn!("failed to signal worker for {}: {e}", self.uio_name);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Reached only if `stop` was never called explicitly (e.g. a panic
        // unwinding through the live-device table); best effort only, since
        // we can't move `self` out of a `&mut self` drop.
        if self.join.is_some() {
            let _ = nix::unistd::write(self.cancel_write.as_fd(), &[0u8]);
        }
    }
}

/// Spawn the worker thread for `device` and return a handle to stop it.
/// `device` is moved into the thread: from this point on nothing outside the
/// thread ever touches it again, satisfying §4.B's single-owner invariant.
///
/// On failure, `device` has already been moved into the closure handed to
/// `thread::Builder::spawn` and is dropped with it — this is the one
/// unwind step the caller cannot run `handler.close()` for. In practice this
/// only happens when the OS is out of threads to give us, a condition the
/// process is not going to recover from cleanly regardless.
pub fn spawn(mut device: Device) -> std::io::Result<WorkerHandle> {
    let (cancel_read, cancel_write) =
        pipe().map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    let uio_name = device.uio_name.clone();

    let join = std::thread::Builder::new()
        .name(format!("tcmu-{uio_name}"))
        .spawn(move || run(&mut device, cancel_read))
        .map_err(std::io::Error::other)?;

    Ok(WorkerHandle {
        cancel_write,
        join: Some(join),
        uio_name,
    })
}

/// The worker body: poll, drain on notify-fd readiness, exit and clean up on
/// cancel-fd readiness or a fatal I/O error.
fn run(device: &mut Device, cancel_read: OwnedFd) {
    info!("worker for {} starting", device.uio_name);

    loop {
        let notify_fd = device.notify_fd.as_fd();
        let cancel_fd = cancel_read.as_fd();
        let mut fds = [
            PollFd::new(notify_fd, PollFlags::POLLIN),
            PollFd::new(cancel_fd, PollFlags::POLLIN),
        ];

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("poll failed for {}: {e}, stopping worker", device.uio_name);
                break;
            }
        }

        let cancel_ready = fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let notify_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));

        if cancel_ready {
            info!("worker for {} cancelled", device.uio_name);
            break;
        }

        if notify_ready {
            let mut buf = [0u8; NOTIFY_READ_LEN];
            match read(device.notify_fd.as_raw_fd(), &mut buf) {
                Ok(NOTIFY_READ_LEN) => {}
                Ok(_) => {
                    warn!(
                        "short read on notify-fd for {}, stopping worker",
                        device.uio_name
                    );
                    break;
                }
                Err(e) => {
                    warn!("notify-fd read failed for {}: {e}", device.uio_name);
                    break;
                }
            }

            if let Err(e) = dispatcher::drain(device) {
                warn!("drain failed for {}: {e}", device.uio_name);
                break;
            }
        }
    }

    cleanup(device);
}

/// Mandatory cleanup on every exit path from `run`, mirroring the original
/// daemon's `pthread_cleanup_push`-registered handler: close the handler's
/// per-device state, then let `Device`'s own `Drop` impls unmap the ring and
/// close the notify-fd.
fn cleanup(device: &mut Device) {
    // Clone the `Arc<dyn Handler>` out first: `close` takes `&mut Device`,
    // which would otherwise overlap with borrowing `device.handler` as the
    // receiver for the same call.
    let handler = device.handler.clone();
    handler.close(device);
    info!("worker for {} stopped", device.uio_name);
}
