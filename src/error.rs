//! Error taxonomy for the daemon, split along the lines §7 of the spec draws:
//! setup-fatal, per-device-fatal, and control-message-malformed never share a
//! type, so a call site can only ever match on the failures that are actually
//! possible for it.

use std::io;

use thiserror::Error;

/// Failures that should abort the whole process before it starts serving.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open control channel: {0}")]
    ControlChannel(#[source] io::Error),

    #[error("could not install signal handler: {0}")]
    SignalHandler(#[source] io::Error),

    #[error("handler plugin directory {0:?} is not readable: {1}")]
    HandlerDirUnreadable(std::path::PathBuf, #[source] io::Error),
}

/// Failures that abort a single `add_device`. The daemon stays alive.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("opening /dev/{0} failed: {1}")]
    OpenNotify(String, #[source] io::Error),

    #[error("reading map size for {0} failed: {1}")]
    ReadMapSize(String, #[source] io::Error),

    #[error("map size attribute for {0} was not a valid integer: {1:?}")]
    InvalidMapSize(String, String),

    #[error("mmap of {0} bytes for {1} failed: {2}")]
    Mmap(usize, String, #[source] io::Error),

    #[error("no handler registered for subtype {0:?}")]
    NoHandler(String),

    #[error("handler {0:?} rejected open() for device {1}")]
    HandlerOpenRejected(String, String),

    #[error("device {0} is already present in the live-device table")]
    AlreadyPresent(String),

    #[error("spawning worker thread for {0} failed: {1}")]
    WorkerSpawn(String, #[source] io::Error),
}

/// Failures in decoding a control-plane message. Always logged and ignored,
/// never propagated, but modeled as a real error type so `recv_message`
/// callers get the same `match`-on-variant ergonomics as everywhere else.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel read failed: {0}")]
    Io(#[source] io::Error),

    #[error("control message missing required attribute {0:?}")]
    MissingAttribute(&'static str),

    #[error("control message had unknown command id {0}")]
    UnknownCommand(u8),

    #[error("control message was truncated or malformed")]
    Truncated,
}
