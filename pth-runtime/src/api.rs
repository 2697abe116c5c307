//! The public lifecycle API.
//!
//! Every function here acts on the scheduler instance of the calling OS
//! thread. Functions that need an instance initialise one on demand with the
//! environment configuration, so a program can start with [`spawn`] and never
//! call [`init`] itself.

use std::any::Any;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::process;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::balance::Group;
use crate::config::Config;
use crate::coro::{self, DEFAULT_STACK_SIZE};
use crate::error::{fatal, PthError, Result};
use crate::event::{Event, EventRing};
use crate::scheduler::{self, is_initialized, switch_to_scheduler, with_current, with_local, Scheduler};
use crate::signal;
use crate::tcb::{
    Canceled, Claim, Entry, ThreadAttr, ThreadHandle, ThreadState, Value, PRIO_MAX, PRIO_MIN, PRIO_STD,
};

/// Recheck interval for conditions no other event announces (last thread
/// standing, a `once` initialiser finishing on another instance).
const RECHECK_INTERVAL: Duration = Duration::from_millis(10);

// ── Runtime setup ───────────────────────────────────────────────────────

/// Start a runtime group on the calling OS thread, configured from the
/// environment. The caller becomes the group's `main` thread.
pub fn init() -> Result<()> {
    init_with(Config::from_env())
}

/// Start a runtime group with an explicit configuration.
pub fn init_with(config: Config) -> Result<()> {
    if is_initialized() {
        return Err(PthError::PermissionDenied(
            "runtime already initialized on this OS thread",
        ));
    }
    let schedulers = config.schedulers;
    let group = Group::new(config)?;
    let inst = group.register_instance(0)?;
    scheduler::bootstrap(Arc::clone(&group), inst)?;
    group.reconcile(schedulers);
    info!(group = group.id, schedulers = group.instance_count(), "runtime started");
    Ok(())
}

/// Stop the sibling instances and drop every thread still owned by this
/// instance. Only `main` of the initial instance may call this.
pub fn shutdown() -> Result<()> {
    let (allowed, group) = with_local(|s| (s.is_main_current() && s.id == 0, Arc::clone(&s.group)))
        .ok_or(PthError::NotInitialized)?;
    if !allowed {
        return Err(PthError::PermissionDenied(
            "only the main thread of the initial scheduler may shut down",
        ));
    }
    group.stop_siblings();
    scheduler::teardown_local();
    info!(group = group.id, "runtime stopped");
    Ok(())
}

fn ensure_init() -> Result<()> {
    if !is_initialized() {
        debug!("initializing runtime implicitly");
        init()?;
    }
    Ok(())
}

/// Run `f` against the local instance, initialising one if necessary.
fn local<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R> {
    ensure_init()?;
    with_local(f).ok_or(PthError::NotInitialized)
}

pub(crate) fn current_thread_id() -> Result<u64> {
    local(|s| s.current_tcb().shared.id)
}

// ── Threads ─────────────────────────────────────────────────────────────

/// Create a thread running `f`. It starts in the New queue of the calling
/// instance and may be migrated to a sibling before it first runs.
///
/// The value `f` returns becomes the thread's exit value.
pub fn spawn<F, T>(attr: &ThreadAttr, f: F) -> Result<ThreadHandle>
where
    F: FnOnce() -> T + Send + 'static,
    T: Any + Send,
{
    ensure_init()?;
    let prio = attr.priority.unwrap_or(PRIO_STD);
    if !(PRIO_MIN..=PRIO_MAX).contains(&prio) {
        return Err(PthError::InvalidArgument("priority out of range"));
    }
    let size = attr
        .stack_size
        .or_else(|| with_local(|s| s.group.config.stack_size))
        .unwrap_or(DEFAULT_STACK_SIZE);
    let stack = coro::acquire_stack(size).map_err(|e| {
        warn!(size, error = %e, "thread stack allocation failed");
        PthError::OutOfMemory
    })?;
    let entry: Entry = Box::new(move || Box::new(f()) as Value);
    local(|s| s.spawn_thread(attr, prio, stack, entry))
}

/// Handle of the calling thread.
pub fn self_handle() -> Result<ThreadHandle> {
    local(|s| s.current_tcb().handle())
}

/// Whether `handle` still names a thread that has not been joined.
#[must_use]
pub fn thread_exists(handle: &ThreadHandle) -> bool {
    !handle.0.tcb.load(Ordering::Acquire).is_null() && handle.state() != ThreadState::Joined
}

/// Id of the scheduler instance running the caller.
pub fn scheduler_id() -> Result<usize> {
    local(|s| s.id)
}

/// Give up the CPU to the next Ready thread.
pub fn yield_now() -> Result<()> {
    yield_to(None)
}

/// Give up the CPU, preferring `to` as the next thread to run.
///
/// `to` must be a New or Ready thread of the calling instance.
pub fn yield_to(to: Option<&ThreadHandle>) -> Result<()> {
    if let Some(target) = to {
        local(|s| -> Result<()> {
            let t = s.local_tcb(target)?;
            match target.state() {
                ThreadState::New => s.nq.favourite(t),
                ThreadState::Ready => s.rq.favourite(t),
                _ => Err(PthError::InvalidArgument("yield target is neither new nor ready")),
            }
        })??;
    } else {
        ensure_init()?;
    }
    switch_to_scheduler();
    Ok(())
}

/// Sleep for at least `duration`.
pub fn nap(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Err(PthError::InvalidArgument("nap duration must be positive"));
    }
    let mut ring = EventRing::new();
    ring.push(Event::timeout(duration));
    wait(&mut ring).map(|_| ())
}

/// Block until at least one event of `ring` has occurred or failed.
/// Returns the number of events no longer pending.
pub fn wait(ring: &mut EventRing) -> Result<usize> {
    if ring.is_empty() {
        return Err(PthError::InvalidArgument("empty event ring"));
    }
    let events = std::ptr::NonNull::from(&mut *ring);
    local(|s| {
        let tcb = s.current_tcb();
        tcb.events = Some(events);
        tcb.set_state(ThreadState::Waiting);
    })?;
    switch_to_scheduler();
    with_current(|tcb| tcb.events = None);
    test_cancel();
    Ok(ring.settled())
}

// ── Join / exit ─────────────────────────────────────────────────────────

/// Wait for a thread to terminate and collect its exit value.
///
/// With `None`, collects whichever joinable thread of the group terminates
/// first. A value is handed out exactly once.
pub fn join(target: Option<&ThreadHandle>) -> Result<Value> {
    match target {
        Some(handle) => join_one(handle),
        None => join_any(),
    }
}

fn join_one(target: &ThreadHandle) -> Result<Value> {
    let (me, group) = local(|s| (s.current_tcb().handle(), Arc::clone(&s.group)))?;
    if *target == me {
        return Err(PthError::WouldDeadlock);
    }
    if target.0.group != group.id {
        return Err(PthError::InvalidArgument("thread belongs to another runtime"));
    }
    if !target.0.joinable {
        return Err(PthError::InvalidArgument("thread is not joinable"));
    }
    loop {
        match target.0.try_claim() {
            Claim::Claimed(value) => {
                release_joined(target, &group);
                return Ok(value);
            }
            Claim::AlreadyJoined => {
                return Err(PthError::InvalidArgument("thread has already been joined"));
            }
            Claim::NotDead => {}
        }
        if group.live.load(Ordering::Acquire) <= 1 {
            return Err(PthError::WouldDeadlock);
        }
        let mut ring = EventRing::new();
        ring.push(Event::termination(Some(target), ThreadState::Dead));
        wait(&mut ring)?;
    }
}

fn join_any() -> Result<Value> {
    let group = local(|s| Arc::clone(&s.group))?;
    loop {
        let local_dead = local(|s| {
            s.dq.iter().find_map(|t| {
                // SAFETY: dead-queue entries are live blocks of this instance.
                let tcb = unsafe { &*t.as_ptr() };
                match tcb.shared.try_claim() {
                    Claim::Claimed(value) => Some((tcb.handle(), value)),
                    _ => None,
                }
            })
        })?;
        let claimed = local_dead.or_else(|| {
            group.drain_join_pipe();
            group.claim_from_pool()
        });
        if let Some((handle, value)) = claimed {
            release_joined(&handle, &group);
            return Ok(value);
        }
        if group.live.load(Ordering::Acquire) <= 1 {
            return Err(PthError::WouldDeadlock);
        }
        let mut ring = EventRing::new();
        ring.push(Event::termination(None, ThreadState::Dead));
        wait(&mut ring)?;
    }
}

/// Free a freshly joined thread, or wake its owner to do so.
fn release_joined(handle: &ThreadHandle, group: &Group) {
    let mine = with_local(|s| {
        let mine = handle.0.home() == s.id;
        if mine {
            s.reap(handle);
        }
        mine
    });
    if mine == Some(false) {
        group.poke_owner(handle);
    }
    group.prune_join_pool();
}

/// Terminate the calling thread with `value` as its exit value.
///
/// Cleanup handlers run newest first, thread-specific values are dropped and
/// held mutexes are released. When called from `main`, waits until every
/// other thread has terminated and then ends the process; an `i32` value
/// becomes the exit status.
pub fn exit<T: Any + Send>(value: T) -> ! {
    exit_value(Box::new(value))
}

fn exit_status(value: &Value) -> i32 {
    value.downcast_ref::<i32>().copied().unwrap_or(0)
}

pub(crate) fn exit_value(value: Value) -> ! {
    let Some(is_main) = with_local(|s| s.is_main_current()) else {
        process::exit(exit_status(&value));
    };
    run_exit_hooks();

    if is_main {
        with_current(|tcb| tcb.cancel_enabled = false);
        if let Some(group) = with_local(|s| Arc::clone(&s.group)) {
            let watched = Arc::clone(&group);
            let mut ring = EventRing::new();
            ring.push(Event::func(
                move || watched.live.load(Ordering::Acquire) <= 1,
                RECHECK_INTERVAL,
            ));
            while group.live.load(Ordering::Acquire) > 1 {
                if let Err(e) = wait(&mut ring) {
                    warn!(error = %e, "main stopped waiting for other threads");
                    break;
                }
                ring.reset();
            }
        }
        let status = exit_status(&value);
        if let Err(e) = shutdown() {
            debug!(error = %e, "runtime left running at process exit");
        }
        process::exit(status);
    }

    let finished = with_local(|s| {
        s.group.live.fetch_sub(1, Ordering::AcqRel);
        let sched = s.id;
        let group = Arc::clone(&s.group);
        let handle = s.current_tcb().handle();
        debug!(sched, thread = handle.name(), "exit");
        (handle, group)
    });
    if let Some((handle, group)) = finished {
        handle.0.finish(value);
        if handle.0.joinable {
            group.notify_join(&handle);
        }
    }
    switch_to_scheduler();
    fatal!("terminated thread was dispatched again")
}

/// Cleanup handlers, thread-specific values and held mutexes of the caller.
fn run_exit_hooks() {
    loop {
        let Some(Some(cleanup)) = with_current(|tcb| tcb.cleanups.pop()) else {
            break;
        };
        cleanup();
    }
    // Destructors run outside the scheduler borrow; they may use the API.
    let specifics = with_current(|tcb| std::mem::take(&mut tcb.specific));
    drop(specifics);
    let mutexes = with_current(|tcb| std::mem::take(&mut tcb.mutexes)).unwrap_or_default();
    for m in mutexes {
        m.force_release();
    }
}

// ── Suspend / resume ────────────────────────────────────────────────────

/// Park a New, Ready or Waiting thread in the Suspended queue.
pub fn suspend(target: &ThreadHandle) -> Result<()> {
    local(|s| -> Result<()> {
        let t = s.local_tcb(target)?;
        if t == s.current || t == s.sched {
            return Err(PthError::PermissionDenied(
                "cannot suspend the calling thread or the scheduler",
            ));
        }
        let state = target.state();
        if !matches!(state, ThreadState::New | ThreadState::Ready | ThreadState::Waiting) {
            return Err(PthError::InvalidArgument("thread is not new, ready or waiting"));
        }
        let Some(queue) = s.queue_for(state) else {
            return Err(PthError::InvalidArgument("thread is not queued"));
        };
        let prio = queue.prio_of(t).unwrap_or_else(|| target.priority());
        queue.delete(t)?;
        s.sq.insert(t, prio);
        // SAFETY: `t` is a live block of this instance, now in the
        // suspended queue.
        unsafe { (*t.as_ptr()).suspended_from = state };
        target.0.set_state(ThreadState::Suspended);
        debug!(sched = s.id, thread = target.name(), "suspended");
        Ok(())
    })?
}

/// Return a suspended thread to the queue it was suspended from.
pub fn resume(target: &ThreadHandle) -> Result<()> {
    local(|s| -> Result<()> {
        let t = s.local_tcb(target)?;
        if t == s.current || t == s.sched {
            return Err(PthError::PermissionDenied(
                "cannot resume the calling thread or the scheduler",
            ));
        }
        if target.state() != ThreadState::Suspended {
            return Err(PthError::InvalidArgument("thread is not suspended"));
        }
        s.sq.delete(t)?;
        // SAFETY: `t` is a live block of this instance.
        let state = unsafe { (*t.as_ptr()).suspended_from };
        if let Some(queue) = s.queue_for(state) {
            queue.insert(t, target.priority());
        }
        target.0.set_state(state);
        debug!(sched = s.id, thread = target.name(), "resumed");
        Ok(())
    })?
}

// ── Signals ─────────────────────────────────────────────────────────────

/// Send `sig` to a thread. Signal 0 only checks that the thread exists.
///
/// A signal the process ignores is dropped successfully. Otherwise it is
/// marked pending for the target and delivered the next time it runs or
/// while it waits for that signal. Raising a signal on the calling thread
/// delivers it at once through `pthread_kill` on the current OS thread
/// rather than failing.
pub fn raise(target: &ThreadHandle, sig: i32) -> Result<()> {
    if sig != 0 && !signal::is_valid_signal(sig) {
        return Err(PthError::InvalidArgument("invalid signal number"));
    }
    let (me, my_id, group) = local(|s| (s.current_tcb().handle(), s.id, Arc::clone(&s.group)))?;
    if target.0.group != group.id {
        return Err(PthError::InvalidArgument("thread belongs to another runtime"));
    }
    if !thread_exists(target) || (sig != 0 && target.state().is_terminated()) {
        return Err(PthError::NotFound);
    }
    if sig == 0 {
        return Ok(());
    }
    if *target == me {
        signal::raise_in_thread(sig)?;
        return Ok(());
    }
    if signal::is_ignored(sig) {
        return Ok(());
    }
    target.0.add_pending(sig);
    if target.0.home() != my_id {
        group.poke_owner(target);
        return Ok(());
    }
    if matches!(target.state(), ThreadState::New | ThreadState::Ready) {
        yield_to(Some(target))?;
    }
    Ok(())
}

// ── Cancellation ────────────────────────────────────────────────────────

/// Ask a thread to terminate at its next cancellation point.
pub fn cancel(target: &ThreadHandle) -> Result<()> {
    let (me, group) = local(|s| (s.current_tcb().handle(), Arc::clone(&s.group)))?;
    if *target == me {
        return Err(PthError::InvalidArgument("a thread cannot cancel itself"));
    }
    if target.state().is_terminated() {
        return Err(PthError::PermissionDenied("thread has already terminated"));
    }
    target.0.request_cancel();
    group.poke_owner(target);
    debug!(thread = target.name(), "cancel requested");
    Ok(())
}

/// Cancellation point: exits with [`Canceled`] if a request is pending and
/// cancellation is enabled.
pub fn test_cancel() {
    let requested = with_current(|tcb| tcb.cancel_enabled && tcb.shared.cancel_requested());
    if requested == Some(true) {
        exit(Canceled);
    }
}

/// Enable or disable cancellation for the caller; returns the previous
/// setting.
pub fn set_cancel_enabled(enabled: bool) -> Result<bool> {
    local(|s| std::mem::replace(&mut s.current_tcb().cancel_enabled, enabled))
}

// ── Cleanup handlers ────────────────────────────────────────────────────

/// Register `f` to run when the caller exits.
pub fn cleanup_push(f: impl FnOnce() + 'static) -> Result<()> {
    local(|s| s.current_tcb().cleanups.push(Box::new(f)))
}

/// Remove the newest cleanup handler, running it when `execute` is set.
/// Returns whether there was one.
pub fn cleanup_pop(execute: bool) -> Result<bool> {
    let Some(handler) = local(|s| s.current_tcb().cleanups.pop())? else {
        return Ok(false);
    };
    if execute {
        handler();
    }
    Ok(true)
}

// ── Thread-specific storage ─────────────────────────────────────────────

static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);

/// Key for a per-thread value of type `T`. Values are dropped when their
/// thread exits.
#[derive(Debug)]
pub struct Key<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Key<T> {
    #[must_use]
    pub fn new() -> Self {
        Key {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Default for Key<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Store the caller's value for `key`, returning the previous one.
pub fn set_specific<T: 'static>(key: &Key<T>, value: T) -> Result<Option<T>> {
    let old = local(|s| s.current_tcb().specific.insert(key.id, Box::new(value)))?;
    Ok(old.and_then(|b| b.downcast::<T>().ok()).map(|b| *b))
}

/// Run `f` with the caller's value for `key`, if any.
pub fn with_specific<T: 'static, R>(key: &Key<T>, f: impl FnOnce(Option<&mut T>) -> R) -> Result<R> {
    let mut taken = local(|s| s.current_tcb().specific.remove(&key.id))?;
    let result = f(taken.as_mut().and_then(|b| b.downcast_mut::<T>()));
    if let Some(value) = taken {
        with_current(|tcb| tcb.specific.insert(key.id, value));
    }
    Ok(result)
}

// ── Control and introspection ───────────────────────────────────────────

bitflags! {
    /// Queues to count with [`Ctrl::Count`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueSet: u8 {
        const NEW = 1 << 0;
        const READY = 1 << 1;
        const RUNNING = 1 << 2;
        const WAITING = 1 << 3;
        const SUSPENDED = 1 << 4;
        const DEAD = 1 << 5;
    }
}

/// Queries and policy switches for [`ctrl`].
#[derive(Debug, Clone, Copy)]
pub enum Ctrl<'a> {
    /// Threads in the given queues of the calling instance.
    Count(QueueSet),
    /// Live threads in the whole group, `main` included.
    TotalThreads,
    /// Mean load average across the group's instances.
    AverageLoad,
    Priority(&'a ThreadHandle),
    Name(&'a ThreadHandle),
    SchedulerId,
    SchedulerCount,
    /// Textual dump of the calling instance's queues.
    DumpState,
    /// Set whether newly admitted threads get favourite priority.
    FavourNew(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CtrlReply {
    Count(usize),
    Load(f32),
    Priority(i32),
    Name(String),
    SchedulerId(usize),
    Dump(String),
    /// Previous favour-new setting.
    FavourNew(bool),
}

pub fn ctrl(query: Ctrl<'_>) -> Result<CtrlReply> {
    local(|s| match query {
        Ctrl::Count(set) => {
            let mut n = 0;
            for (flag, queue) in [
                (QueueSet::NEW, &s.nq),
                (QueueSet::READY, &s.rq),
                (QueueSet::WAITING, &s.wq),
                (QueueSet::SUSPENDED, &s.sq),
                (QueueSet::DEAD, &s.dq),
            ] {
                if set.contains(flag) {
                    n += queue.len();
                }
            }
            if set.contains(QueueSet::RUNNING) {
                n += 1;
            }
            CtrlReply::Count(n)
        }
        Ctrl::TotalThreads => CtrlReply::Count(s.group.live.load(Ordering::Acquire)),
        Ctrl::AverageLoad => {
            let loads: Vec<f32> = (0..s.group.instance_count())
                .filter_map(|id| s.group.instance(id))
                .map(|inst| inst.load())
                .collect();
            #[expect(clippy::cast_precision_loss, reason = "at most 96 instances")]
            let mean = loads.iter().sum::<f32>() / loads.len().max(1) as f32;
            CtrlReply::Load(mean)
        }
        Ctrl::Priority(h) => CtrlReply::Priority(h.priority()),
        Ctrl::Name(h) => CtrlReply::Name(h.name().to_owned()),
        Ctrl::SchedulerId => CtrlReply::SchedulerId(s.id),
        Ctrl::SchedulerCount => CtrlReply::Count(s.group.instance_count()),
        Ctrl::DumpState => CtrlReply::Dump(s.dump_state()),
        Ctrl::FavourNew(on) => CtrlReply::FavourNew(std::mem::replace(&mut s.favour_new, on)),
    })
}

// ── Descriptors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdMode {
    Blocking,
    NonBlocking,
}

/// Switch `fd` between blocking and non-blocking mode, returning the
/// previous mode.
pub fn fd_set_mode(fd: RawFd, mode: FdMode) -> Result<FdMode> {
    let old = fd_mode(fd)?;
    if old != mode {
        // SAFETY: F_GETFL/F_SETFL only read and write the descriptor flags.
        let rc = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            let flags = match mode {
                FdMode::Blocking => flags & !libc::O_NONBLOCK,
                FdMode::NonBlocking => flags | libc::O_NONBLOCK,
            };
            libc::fcntl(fd, libc::F_SETFL, flags)
        };
        if rc == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(old)
}

/// Current blocking mode of `fd`.
pub fn fd_mode(fd: RawFd) -> Result<FdMode> {
    if fd < 0 {
        return Err(PthError::InvalidArgument("negative file descriptor"));
    }
    // SAFETY: F_GETFL has no side effects.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(if flags & libc::O_NONBLOCK != 0 {
        FdMode::NonBlocking
    } else {
        FdMode::Blocking
    })
}

// ── Once ────────────────────────────────────────────────────────────────

const ONCE_INCOMPLETE: u8 = 0;
const ONCE_RUNNING: u8 = 1;
const ONCE_DONE: u8 = 2;

/// Flag for [`once`].
#[derive(Debug, Default)]
pub struct Once(AtomicU8);

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Once(AtomicU8::new(ONCE_INCOMPLETE))
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.0.load(Ordering::Acquire) == ONCE_DONE
    }
}

/// Run `init` unless some thread already ran it through `flag`. Callers
/// arriving while another thread runs it wait for it to finish.
pub fn once(flag: &'static Once, init: impl FnOnce()) -> Result<()> {
    struct Reset(&'static Once);
    impl Drop for Reset {
        fn drop(&mut self) {
            let _ = self.0 .0.compare_exchange(
                ONCE_RUNNING,
                ONCE_INCOMPLETE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    loop {
        match flag
            .0
            .compare_exchange(ONCE_INCOMPLETE, ONCE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let guard = Reset(flag);
                init();
                flag.0.store(ONCE_DONE, Ordering::Release);
                drop(guard);
                return Ok(());
            }
            Err(ONCE_DONE) => return Ok(()),
            Err(_) => {
                let mut ring = EventRing::new();
                ring.push(Event::func(
                    move || flag.0.load(Ordering::Acquire) != ONCE_RUNNING,
                    RECHECK_INTERVAL,
                ));
                wait(&mut ring)?;
            }
        }
    }
}
