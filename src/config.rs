//! Command-line configuration, in the `clap` derive idiom used across the
//! retrieval pack.

use std::path::PathBuf;

use clap::Parser;

/// Userspace dispatcher daemon for kernel-mediated SCSI targets.
#[derive(Debug, Parser)]
#[command(name = "tcmu-rs", version, about)]
pub struct Args {
    /// Directory to scan for `handler_*` plugin shared objects.
    #[arg(long, default_value = "/usr/lib/tcmu-runner")]
    pub handler_dir: PathBuf,

    /// Override the log level (otherwise read from `RUST_LOG`).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Skip scanning `/sys/class/uio` for already-present devices at
    /// startup; only devices added after startup via the control channel
    /// are served.
    #[arg(long)]
    pub no_initial_scan: bool,
}
