//! Userspace dispatcher daemon for a kernel-mediated SCSI target.
//!
//! The kernel exposes virtual SCSI LUNs whose command execution is
//! delegated to this process, which consults pluggable backend handlers to
//! actually service SCSI commands. See each module for its piece of the
//! flow: [`control`] receives add/remove notifications, [`lifecycle`] maps
//! a device's ring and starts its [`worker`], which drives [`dispatcher`]
//! against the ring described by [`mailbox`].

pub mod config;
pub mod control;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod mailbox;
pub mod util;
pub mod worker;

pub use control::{ControlChannel, ControlEvent, GenericNetlinkChannel};
pub use device::Device;
pub use handler::{Handler, HandlerRegistry, IoVec};
pub use lifecycle::DaemonContext;
