//! Cooperative user-space threads.
//!
//! Lightweight threads run on their own stacks and switch only when they
//! yield, wait, join or exit. Each OS thread that runs the runtime hosts one
//! scheduler instance; a runtime group spreads freshly spawned threads over
//! several instances (one per core) by handing them through pipes before
//! they first run. Within one instance exactly one thread runs at a time.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: error, config, signal, pipe, coro (no internal deps)
//! Layer 1: tcb, pqueue, event, sync (thread model, queues, wait conditions)
//! Layer 2: scheduler, eventmgr (dispatch loop and event multiplexing)
//! Layer 3: balance (groups, sibling instances, migration, join pipe)
//! Layer 4: api (public lifecycle functions)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pth_runtime::{join, spawn, ThreadAttr};
//!
//! let worker = spawn(&ThreadAttr::new().name("worker"), || 6 * 7).unwrap();
//! let value = join(Some(&worker)).unwrap();
//! assert_eq!(*value.downcast::<i32>().unwrap(), 42);
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("pth-runtime supports Linux only");

mod api;
mod balance;
pub mod config;
mod coro;
pub mod error;
pub mod event;
mod eventmgr;
mod pipe;
mod pqueue;
mod scheduler;
pub mod signal;
pub mod sync;
mod tcb;

pub use api::{
    cancel, cleanup_pop, cleanup_push, ctrl, exit, fd_mode, fd_set_mode, init, init_with, join, nap, once,
    raise, resume, scheduler_id, self_handle, set_cancel_enabled, set_specific, shutdown, spawn, suspend,
    test_cancel, thread_exists, wait, with_specific, yield_now, yield_to, Ctrl, CtrlReply, FdMode, Key, Once,
    QueueSet,
};
pub use config::{Config, MAX_SCHEDULERS};
pub use coro::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use error::{PthError, Result};
pub use event::{Event, EventId, EventRing, EventStatus, FdGoal, FdWatch};
pub use signal::SigSet;
pub use sync::{Cond, Message, MsgPort, Mutex};
pub use tcb::{
    Canceled, StackOverflow, ThreadAttr, ThreadHandle, ThreadState, Value, PRIO_MAX, PRIO_MIN, PRIO_STD,
};
