//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::process;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use pth_runtime::Config;
use tracing_subscriber::EnvFilter;

/// Longest a single runtime test may take before the process is aborted.
const HANG_LIMIT: Duration = Duration::from_secs(30);

/// Route runtime logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Abort the process unless the returned sender is dropped within
/// [`HANG_LIMIT`]. A wedged scheduler never returns to the test harness,
/// so a failed assertion is not enough.
pub fn watchdog() -> Sender<()> {
    let test = thread::current().name().unwrap_or("<unnamed>").to_owned();
    let (armed, rx) = mpsc::channel::<()>();
    thread::Builder::new()
        .name("pth-watchdog".to_owned())
        .spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(HANG_LIMIT) {
                eprintln!("{test}: still running after {HANG_LIMIT:?}, aborting");
                process::abort();
            }
        })
        .expect("watchdog thread");
    armed
}

/// Run `f` as the `main` thread of a fresh runtime group on the calling OS
/// thread, then shut the group down.
pub fn with_runtime<R>(config: Config, f: impl FnOnce() -> R) -> R {
    let _armed = watchdog();
    init_tracing();
    pth_runtime::init_with(config).expect("runtime init");
    let out = f();
    pth_runtime::shutdown().expect("runtime shutdown");
    out
}

/// Single-instance runtime with default settings.
pub fn with_default_runtime<R>(f: impl FnOnce() -> R) -> R {
    with_runtime(Config::default(), f)
}
