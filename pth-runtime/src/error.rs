//! Error type shared by every runtime operation, plus the abort path for
//! conditions the runtime cannot survive.

use std::fmt;
use std::io;

/// Errors returned by the public runtime API.
#[derive(Debug, thiserror::Error)]
pub enum PthError {
    /// Bad handle, bad state or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The handle is not a member of the queue an operation expected.
    #[error("invalid handle: not present in the {0} queue")]
    InvalidHandle(&'static str),
    /// Illegal operation on the calling thread or on a scheduler thread.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    /// Joining would block forever (self-join or last thread standing).
    #[error("operation would deadlock")]
    WouldDeadlock,
    /// Stack or control block allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// A bounded runtime resource (signals, catcher slots, pipes) ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// The thread no longer exists.
    #[error("no such thread")]
    NotFound,
    /// A non-blocking acquire found the resource held by another thread.
    #[error("resource busy")]
    Busy,
    /// No runtime has been initialised on this OS thread.
    #[error("runtime not initialized on this OS thread")]
    NotInitialized,
    /// Underlying system call failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PthError>;

/// Report an unrecoverable runtime condition and abort the process.
///
/// Used for broken scheduler invariants (empty ready queue at dispatch,
/// multiplex failure after retries, stack overflow without a handler).
#[cold]
pub(crate) fn fatal_impl(args: fmt::Arguments<'_>) -> ! {
    tracing::error!("{args}");
    eprintln!("**pth** {args}");
    std::process::abort()
}

/// `fatal!("...", args)` formats its message and aborts.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal_impl(format_args!($($arg)*))
    };
}
pub(crate) use fatal;
