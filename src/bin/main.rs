//! Entry point: parse CLI args, load handler plugins, optionally enumerate
//! already-present devices, serve the control channel until a shutdown
//! signal arrives.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use thiserror::Error;

use tcmu_rs::config::Args;
use tcmu_rs::control::{serve, GenericNetlinkChannel};
use tcmu_rs::error::{ControlError, SetupError};
use tcmu_rs::{DaemonContext, HandlerRegistry};

/// Top-level failure for the whole process: either a setup step never got
/// the daemon running at all, or the control loop itself died.
#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("control channel error: {0}")]
    Control(#[from] ControlError),
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = &args.log_level {
        builder.parse_filters(level);
    }
    builder.init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), DaemonError> {
    let mut handlers = HandlerRegistry::new();
    let loaded = handlers
        .load_all(&args.handler_dir)
        .map_err(|e| SetupError::HandlerDirUnreadable(args.handler_dir.clone(), e))?;
    info!("loaded {loaded} handler(s) from {:?}", args.handler_dir);

    let ctx = Arc::new(DaemonContext::new(handlers));

    if !args.no_initial_scan {
        if let Err(e) = ctx.initial_scan() {
            error!("initial scan failed: {e}");
        }
    }

    install_shutdown_handler(ctx.clone())?;

    let mut channel = GenericNetlinkChannel::open().map_err(SetupError::ControlChannel)?;

    serve(&mut channel, &ctx)?;
    Ok(())
}

/// Install `SIGINT`/`SIGTERM` handling for Component G.
///
/// The signal handler itself only flips an `AtomicBool` (the one thing
/// `signal-hook`'s docs guarantee is async-signal-safe to do from a real
/// handler); a dedicated thread blocks waiting for that flag and does the
/// actual cancel-and-join-every-worker work, then exits with status 1. A
/// second signal before that thread wakes restores the default disposition,
/// so an unresponsive shutdown can still be killed the usual way.
fn install_shutdown_handler(ctx: Arc<DaemonContext>) -> Result<(), SetupError> {
    let shutdown_requested = Arc::new(AtomicBool::new(false));

    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, shutdown_requested.clone())
            .map_err(SetupError::SignalHandler)?;
        signal_hook::flag::register_conditional_default(signal, shutdown_requested.clone())
            .map_err(SetupError::SignalHandler)?;
    }

    std::thread::spawn(move || {
        while !shutdown_requested.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        info!("shutdown signal received, stopping all workers");
        ctx.shutdown_all();
        std::process::exit(1);
    });

    Ok(())
}
