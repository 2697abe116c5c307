//! Thread control blocks.
//!
//! A lightweight thread is split in two:
//!
//! - [`ThreadShared`] (behind the public [`ThreadHandle`]) holds what other
//!   threads and other scheduler instances may look at: identity, state,
//!   priority, owning instance, pending signals, the cancellation request
//!   and the exit value slot. Every mutable field is atomic.
//! - [`Tcb`] holds what only the owning instance may touch: the saved
//!   machine context, the stack, the entry closure, the event ring being
//!   waited on and the per-thread bookkeeping used at exit.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::coro::{CoroContext, CoroStack};
use crate::event::EventRing;
use crate::signal::{signal_bit, SigSet};
use crate::sync::Mutex;

/// Exit value of a thread.
pub type Value = Box<dyn Any + Send>;

/// Lowest thread priority.
pub const PRIO_MIN: i32 = -5;
/// Default thread priority.
pub const PRIO_STD: i32 = 0;
/// Highest thread priority (also the aging ceiling).
pub const PRIO_MAX: i32 = 5;

/// Exit value of a thread that was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

/// Exit value of a thread killed by the stack overflow check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow;

// ── ThreadState ─────────────────────────────────────────────────────────

/// Lifecycle state. The state always names the queue the thread sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    Ready = 1,
    Running = 2,
    Waiting = 3,
    Suspended = 4,
    Dead = 5,
    Joined = 6,
    /// The scheduler's own dispatch thread.
    Scheduler = 7,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::New,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Waiting,
            4 => ThreadState::Suspended,
            5 => ThreadState::Dead,
            6 => ThreadState::Joined,
            _ => ThreadState::Scheduler,
        }
    }

    /// Whether the thread has finished running.
    #[must_use]
    pub fn is_terminated(self) -> bool {
        matches!(self, ThreadState::Dead | ThreadState::Joined)
    }
}

// ── ThreadShared ────────────────────────────────────────────────────────

/// Result of trying to collect a thread's exit value.
#[derive(Debug)]
pub(crate) enum Claim {
    Claimed(Value),
    AlreadyJoined,
    NotDead,
}

pub(crate) struct ThreadShared {
    pub(crate) id: u64,
    pub(crate) group: u64,
    pub(crate) name: String,
    pub(crate) joinable: bool,
    state: AtomicU8,
    prio: AtomicI32,
    home: AtomicUsize,
    /// Instance-private control block; null once freed.
    pub(crate) tcb: AtomicPtr<Tcb>,
    sigpending: AtomicU64,
    cancel_req: AtomicBool,
    /// Written once by the exiting thread before it publishes `Dead`;
    /// taken once by whoever wins the `Dead -> Joined` transition.
    result: UnsafeCell<Option<Value>>,
}

// SAFETY: Every field other than `result` is immutable or atomic. `result`
// is written only by the owning thread before the Release store of `Dead`
// and read only after a successful AcqRel `Dead -> Joined` exchange, which
// at most one caller can win.
unsafe impl Sync for ThreadShared {}
// SAFETY: `Value` is `Send`; the raw TCB pointer is only dereferenced by the
// instance named in `home`.
unsafe impl Send for ThreadShared {}

impl ThreadShared {
    pub(crate) fn new(id: u64, group: u64, name: String, joinable: bool, prio: i32, home: usize) -> Self {
        ThreadShared {
            id,
            group,
            name,
            joinable,
            state: AtomicU8::new(ThreadState::New as u8),
            prio: AtomicI32::new(prio),
            home: AtomicUsize::new(home),
            tcb: AtomicPtr::new(ptr::null_mut()),
            sigpending: AtomicU64::new(0),
            cancel_req: AtomicBool::new(false),
            result: UnsafeCell::new(None),
        }
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn prio(&self) -> i32 {
        self.prio.load(Ordering::Relaxed)
    }

    pub(crate) fn home(&self) -> usize {
        self.home.load(Ordering::Acquire)
    }

    pub(crate) fn set_home(&self, id: usize) {
        self.home.store(id, Ordering::Release);
    }

    pub(crate) fn sigpending(&self) -> SigSet {
        SigSet::from_bits(self.sigpending.load(Ordering::Acquire))
    }

    pub(crate) fn has_pending(&self, sig: i32) -> bool {
        self.sigpending.load(Ordering::Acquire) & signal_bit(sig) != 0
    }

    pub(crate) fn add_pending(&self, sig: i32) {
        self.sigpending.fetch_or(signal_bit(sig), Ordering::AcqRel);
    }

    pub(crate) fn clear_pending(&self, sig: i32) {
        self.sigpending.fetch_and(!signal_bit(sig), Ordering::AcqRel);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_req.load(Ordering::Acquire)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_req.store(true, Ordering::Release);
    }

    /// Store the exit value and publish `Dead`.
    ///
    /// Must be called by the thread itself, exactly once.
    pub(crate) fn finish(&self, value: Value) {
        // SAFETY: only the exiting thread writes `result`, and nobody reads
        // it before observing `Dead` below.
        unsafe { *self.result.get() = Some(value) };
        self.set_state(ThreadState::Dead);
    }

    /// Atomically move `Dead -> Joined` and take the exit value.
    pub(crate) fn try_claim(&self) -> Claim {
        match self.state.compare_exchange(
            ThreadState::Dead as u8,
            ThreadState::Joined as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: we won the only `Dead -> Joined` transition, and the
                // writer's store happened before its Release of `Dead`.
                let value = unsafe { (*self.result.get()).take() };
                Claim::Claimed(value.unwrap_or_else(|| Box::new(())))
            }
            Err(raw) if raw == ThreadState::Joined as u8 => Claim::AlreadyJoined,
            Err(_) => Claim::NotDead,
        }
    }
}

// ── ThreadHandle ────────────────────────────────────────────────────────

/// Cloneable reference to a lightweight thread.
///
/// Equality and hashing are by identity.
#[derive(Clone)]
pub struct ThreadHandle(pub(crate) Arc<ThreadShared>);

impl ThreadHandle {
    /// Unique id of the thread within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.0.state()
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.0.prio()
    }

    #[must_use]
    pub fn is_joinable(&self) -> bool {
        self.0.joinable
    }

    /// Id of the scheduler instance the thread belongs to.
    #[must_use]
    pub fn scheduler_id(&self) -> usize {
        self.0.home()
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ThreadHandle {}

impl Hash for ThreadHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.0.state())
            .finish()
    }
}

// ── ThreadAttr ──────────────────────────────────────────────────────────

/// Spawn attributes. Unset fields take the runtime defaults.
#[derive(Debug, Clone, Default)]
pub struct ThreadAttr {
    pub(crate) name: Option<String>,
    pub(crate) priority: Option<i32>,
    pub(crate) joinable: Option<bool>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) cancel_enabled: Option<bool>,
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Priority in `PRIO_MIN..=PRIO_MAX`.
    #[must_use]
    pub fn priority(mut self, prio: i32) -> Self {
        self.priority = Some(prio);
        self
    }

    /// Whether the thread's exit value must be collected with `join`.
    /// Non-joinable threads are freed as soon as they die.
    #[must_use]
    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = Some(joinable);
        self
    }

    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn cancel_enabled(mut self, enabled: bool) -> Self {
        self.cancel_enabled = Some(enabled);
        self
    }
}

// ── Tcb ─────────────────────────────────────────────────────────────────

pub(crate) type Entry = Box<dyn FnOnce() -> Value + Send>;
pub(crate) type TcbPtr = NonNull<Tcb>;

pub(crate) struct Tcb {
    pub(crate) shared: Arc<ThreadShared>,
    pub(crate) ctx: CoroContext,
    /// `None` for threads running on an OS-provided stack (`main`).
    pub(crate) stack: Option<CoroStack>,
    pub(crate) entry: Option<Entry>,
    pub(crate) spawned: Instant,
    pub(crate) last_ran: Instant,
    pub(crate) running: Duration,
    pub(crate) dispatches: u64,
    pub(crate) sigmask: SigSet,
    /// Ring the thread is blocked on; points into the thread's own stack.
    pub(crate) events: Option<NonNull<EventRing>>,
    pub(crate) suspended_from: ThreadState,
    pub(crate) cleanups: Vec<Box<dyn FnOnce()>>,
    pub(crate) specific: HashMap<usize, Box<dyn Any>>,
    pub(crate) mutexes: Vec<Mutex>,
    pub(crate) cancel_enabled: bool,
}

impl Tcb {
    pub(crate) fn new(shared: Arc<ThreadShared>, stack: Option<CoroStack>, entry: Option<Entry>) -> Box<Tcb> {
        let now = Instant::now();
        Box::new(Tcb {
            shared,
            ctx: CoroContext::new(),
            stack,
            entry,
            spawned: now,
            last_ran: now,
            running: Duration::ZERO,
            dispatches: 0,
            sigmask: SigSet::empty(),
            events: None,
            suspended_from: ThreadState::New,
            cleanups: Vec::new(),
            specific: HashMap::new(),
            mutexes: Vec::new(),
            cancel_enabled: true,
        })
    }

    pub(crate) fn state(&self) -> ThreadState {
        self.shared.state()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.shared.set_state(state);
    }

    pub(crate) fn prio(&self) -> i32 {
        self.shared.prio()
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn handle(&self) -> ThreadHandle {
        ThreadHandle(Arc::clone(&self.shared))
    }
}

impl Drop for Tcb {
    fn drop(&mut self) {
        self.shared.tcb.store(ptr::null_mut(), Ordering::Release);
        if let Some(stack) = self.stack.take() {
            crate::coro::release_stack(stack);
        }
    }
}
