//! Scheduler instances and the dispatch loop.
//!
//! Each OS thread running the runtime owns exactly one [`Scheduler`]. The
//! instance is reachable only through a thread-local pointer, so queue and
//! TCB state is never touched from another OS thread. Cross-instance
//! traffic goes through pipes (see [`crate::balance`]).
//!
//! The dispatch loop itself runs as a coroutine with its own stack, the
//! *scheduler thread*. User threads give up the CPU by switching into it
//! ([`switch_to_scheduler`]); it picks the next thread and switches back
//! out. The switch is the only suspension point in the system, and no Rust
//! reference into the scheduler is held across it.

use std::cell::Cell;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::balance::{Group, InstanceShared};
use crate::coro::{coro_init, coro_switch, CoroContext, CoroStack};
use crate::error::{fatal, PthError, Result};
use crate::eventmgr::CycleMode;
use crate::pipe::Pipe;
use crate::pqueue::PQueue;
use crate::signal::{self, Catcher, SigSet};
use crate::tcb::{
    Entry, StackOverflow, Tcb, TcbPtr, ThreadAttr, ThreadHandle, ThreadShared, ThreadState, PRIO_MAX,
    PRIO_STD,
};

/// Stack size of the dispatch-loop coroutine.
const SCHEDULER_STACK_SIZE: usize = 256 * 1024;

// ── Thread-local instance ───────────────────────────────────────────────

thread_local! {
    static LOCAL: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };
    static BORROWED: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` against this OS thread's scheduler instance.
///
/// Returns `None` if no instance exists. `f` must not switch contexts and
/// must not call back into the runtime.
pub(crate) fn with_local<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let ptr = LOCAL.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    if BORROWED.with(|b| b.replace(true)) {
        fatal!("scheduler state re-entered from inside the runtime");
    }
    // SAFETY: `ptr` was produced by `Box::into_raw` in `bootstrap` and is
    // only freed by `teardown_local` on this same OS thread. The BORROWED
    // flag rules out a second live `&mut`.
    let result = f(unsafe { &mut *ptr });
    BORROWED.with(|b| b.set(false));
    Some(result)
}

/// Run `f` against the calling thread's control block.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Tcb) -> R) -> Option<R> {
    with_local(|s| f(s.current_tcb()))
}

/// Whether this OS thread runs a scheduler instance.
pub(crate) fn is_initialized() -> bool {
    !LOCAL.with(Cell::get).is_null()
}

// ── Scheduler ───────────────────────────────────────────────────────────

pub(crate) struct Scheduler {
    pub(crate) id: usize,
    pub(crate) group: Arc<Group>,
    pub(crate) inst: Arc<InstanceShared>,
    /// The thread that bootstrapped this instance on the OS stack.
    pub(crate) main: TcbPtr,
    /// The dispatch-loop coroutine.
    pub(crate) sched: TcbPtr,
    pub(crate) current: TcbPtr,
    pub(crate) nq: PQueue<TcbPtr>,
    pub(crate) rq: PQueue<TcbPtr>,
    pub(crate) wq: PQueue<TcbPtr>,
    pub(crate) sq: PQueue<TcbPtr>,
    pub(crate) dq: PQueue<TcbPtr>,
    pub(crate) favour_new: bool,
    load_next: Instant,
    pub(crate) sigpipe: Pipe,
    pub(crate) catcher: Option<Catcher>,
    /// Signals pending before the current dispatch.
    sig_pending_before: SigSet,
}

/// Create a scheduler instance on the calling OS thread. The caller's
/// execution context becomes the instance's `main` thread.
pub(crate) fn bootstrap(group: Arc<Group>, inst: Arc<InstanceShared>) -> Result<()> {
    if is_initialized() {
        return Err(PthError::PermissionDenied(
            "runtime already initialized on this OS thread",
        ));
    }

    let sigpipe = Pipe::new()?;
    let catcher = Catcher::register(sigpipe.write_fd())
        .ok_or(PthError::ResourceExhausted("signal catcher slots"))?;

    let stack = CoroStack::new(SCHEDULER_STACK_SIZE).map_err(|e| {
        warn!(error = %e, "scheduler stack allocation failed");
        PthError::OutOfMemory
    })?;
    let sched_shared = Arc::new(ThreadShared::new(
        group.next_thread_id(),
        group.id,
        "scheduler".to_owned(),
        false,
        PRIO_MAX,
        inst.id,
    ));
    sched_shared.set_state(ThreadState::Scheduler);
    let top = stack.top();
    let mut sched_tcb = Tcb::new(Arc::clone(&sched_shared), Some(stack), None);
    // SAFETY: `top` is the top of the stack now owned by `sched_tcb`, and
    // `scheduler_entry` never returns.
    unsafe { coro_init(&raw mut sched_tcb.ctx, top, scheduler_entry, ptr::null_mut()) };

    let main_shared = Arc::new(ThreadShared::new(
        group.next_thread_id(),
        group.id,
        "main".to_owned(),
        false,
        PRIO_STD,
        inst.id,
    ));
    main_shared.set_state(ThreadState::Running);
    let mut main_tcb = Tcb::new(Arc::clone(&main_shared), None, None);
    main_tcb.sigmask = SigSet::current_mask();

    let sched = NonNull::from(Box::leak(sched_tcb));
    let main = NonNull::from(Box::leak(main_tcb));
    sched_shared.tcb.store(sched.as_ptr(), Ordering::Release);
    main_shared.tcb.store(main.as_ptr(), Ordering::Release);

    let id = inst.id;
    let load_next = Instant::now() + group.config.load_tick;
    let scheduler = Box::new(Scheduler {
        id,
        group,
        inst,
        main,
        sched,
        current: main,
        nq: PQueue::new("new"),
        rq: PQueue::new("ready"),
        wq: PQueue::new("waiting"),
        sq: PQueue::new("suspended"),
        dq: PQueue::new("dead"),
        favour_new: true,
        load_next,
        sigpipe,
        catcher: Some(catcher),
        sig_pending_before: SigSet::empty(),
    });
    LOCAL.with(|l| l.set(Box::into_raw(scheduler)));
    debug!(sched = id, "scheduler instance started");
    Ok(())
}

/// Destroy this OS thread's scheduler instance and every thread it still
/// owns. Must be called from the instance's `main` thread.
pub(crate) fn teardown_local() {
    let ptr = LOCAL.with(|l| l.replace(ptr::null_mut()));
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` came from `Box::into_raw` in `bootstrap`; clearing
    // LOCAL first means nothing else can reach it any more.
    let scheduler = unsafe { Box::from_raw(ptr) };
    debug!(sched = scheduler.id, "scheduler instance stopped");
    drop(scheduler);
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut leftovers = Vec::new();
        for q in [&mut self.nq, &mut self.rq, &mut self.wq, &mut self.sq, &mut self.dq] {
            while let Some(t) = q.dequeue_max() {
                leftovers.push(t);
            }
        }
        if !leftovers.is_empty() {
            debug!(sched = self.id, count = leftovers.len(), "dropping unfinished threads");
        }
        for t in leftovers {
            // SAFETY: queue entries are live blocks owned by this instance.
            unsafe { free_tcb(t) };
        }
        // SAFETY: `sched` and `main` are owned by this instance and are
        // never queued.
        unsafe {
            free_tcb(self.sched);
            free_tcb(self.main);
        }
    }
}

/// # Safety
///
/// `t` must be a live block owned by the calling instance and reachable
/// from nowhere else.
pub(crate) unsafe fn free_tcb(t: TcbPtr) {
    // SAFETY: guaranteed by the caller; blocks are created by `Box::leak`.
    drop(unsafe { Box::from_raw(t.as_ptr()) });
}

impl Scheduler {
    pub(crate) fn current_tcb(&mut self) -> &mut Tcb {
        // SAFETY: `current` always names a live block of this instance.
        unsafe { &mut *self.current.as_ptr() }
    }

    pub(crate) fn is_main_current(&self) -> bool {
        self.current == self.main
    }

    fn sched_ctx(&self) -> *mut CoroContext {
        // SAFETY: the scheduler block lives as long as the instance.
        unsafe { &raw mut (*self.sched.as_ptr()).ctx }
    }

    /// Resolve a handle to a control block owned by this instance.
    pub(crate) fn local_tcb(&self, handle: &ThreadHandle) -> Result<TcbPtr> {
        if handle.0.group != self.group.id {
            return Err(PthError::InvalidArgument("thread belongs to another runtime"));
        }
        if handle.0.home() != self.id {
            return Err(PthError::InvalidArgument(
                "thread runs on another scheduler instance",
            ));
        }
        NonNull::new(handle.0.tcb.load(Ordering::Acquire)).ok_or(PthError::NotFound)
    }

    /// The queue a thread in `state` lives in.
    pub(crate) fn queue_for(&mut self, state: ThreadState) -> Option<&mut PQueue<TcbPtr>> {
        match state {
            ThreadState::New => Some(&mut self.nq),
            ThreadState::Ready => Some(&mut self.rq),
            ThreadState::Waiting => Some(&mut self.wq),
            ThreadState::Suspended => Some(&mut self.sq),
            ThreadState::Dead => Some(&mut self.dq),
            _ => None,
        }
    }

    pub(crate) fn spawn_thread(&mut self, attr: &ThreadAttr, prio: i32, stack: CoroStack, entry: Entry) -> ThreadHandle {
        let id = self.group.next_thread_id();
        let name = attr.name.clone().unwrap_or_else(|| format!("thread-{id}"));
        let shared = Arc::new(ThreadShared::new(
            id,
            self.group.id,
            name,
            attr.joinable.unwrap_or(true),
            prio,
            self.id,
        ));
        let top = stack.top();
        let mut tcb = Tcb::new(Arc::clone(&shared), Some(stack), Some(entry));
        // SAFETY: `top` is the top of the stack owned by `tcb`, and
        // `thread_start` never returns.
        unsafe { coro_init(&raw mut tcb.ctx, top, thread_start, ptr::null_mut()) };
        tcb.sigmask = SigSet::current_mask();
        tcb.cancel_enabled = attr.cancel_enabled.unwrap_or(true);

        let t = NonNull::from(Box::leak(tcb));
        shared.tcb.store(t.as_ptr(), Ordering::Release);
        self.nq.insert(t, prio);
        self.group.live.fetch_add(1, Ordering::AcqRel);
        debug!(sched = self.id, thread = %shared.name, prio, "spawned");
        ThreadHandle(shared)
    }

    /// Move everything in the New queue to the Ready queue.
    fn admit_new_threads(&mut self) {
        while let Some(t) = self.nq.pop_tail() {
            // SAFETY: queue entries are live blocks owned by this instance.
            unsafe { (*t.as_ptr()).set_state(ThreadState::Ready) };
            if self.favour_new {
                self.rq.insert_favourite(t);
            } else {
                self.rq.insert(t, PRIO_STD);
            }
        }
    }

    /// Exponential moving average of the Ready queue length, one sample per
    /// elapsed tick.
    fn update_load(&mut self, now: Instant) {
        if now < self.load_next {
            return;
        }
        #[expect(clippy::cast_precision_loss, reason = "queue lengths are small")]
        let ready = self.rq.len() as f32;
        let mut load = self.inst.load();
        while now >= self.load_next {
            load = ready * 0.25 + load * 0.75;
            self.load_next += self.group.config.load_tick;
        }
        self.inst.set_load(load);
    }

    /// Free dead threads whose value has been collected.
    fn reap_joined(&mut self) {
        // SAFETY: queue entries are live blocks owned by this instance.
        let joined = self
            .dq
            .drain_where(|t| unsafe { (*t.as_ptr()).state() } == ThreadState::Joined);
        for t in joined {
            // SAFETY: just removed from the dead queue.
            unsafe { free_tcb(t) };
        }
    }

    /// Free a specific joined thread right away.
    pub(crate) fn reap(&mut self, handle: &ThreadHandle) {
        if let Ok(t) = self.local_tcb(handle) {
            if self.dq.delete(t).is_ok() {
                // SAFETY: just removed from the dead queue.
                unsafe { free_tcb(t) };
            }
        }
    }

    /// Steps before the switch: intake, receive, load, selection and
    /// signal merge. Returns the contexts to switch between.
    fn prepare_dispatch(&mut self) -> (*mut CoroContext, *const CoroContext) {
        self.distribute_new_threads();
        self.admit_new_threads();
        self.handle_received();
        let now = Instant::now();
        self.update_load(now);
        self.reap_joined();

        let Some(next) = self.rq.dequeue_max() else {
            fatal!("scheduler {}: no more threads available to schedule", self.id);
        };
        // SAFETY: queue entries are live blocks owned by this instance.
        let tcb = unsafe { &mut *next.as_ptr() };

        // Thread-directed signals become OS-pending just before the thread
        // runs, so they are delivered once it unblocks them.
        self.sig_pending_before = SigSet::pending();
        for sig in tcb.shared.sigpending().iter() {
            if !self.sig_pending_before.contains(sig) {
                if let Err(e) = signal::raise_in_thread(sig) {
                    warn!(sched = self.id, sig, error = %e, "cannot deliver thread signal");
                }
            }
        }

        tcb.last_ran = now;
        tcb.dispatches += 1;
        tcb.set_state(ThreadState::Running);
        self.current = next;
        trace!(sched = self.id, thread = tcb.name(), "dispatch");
        (self.sched_ctx(), &raw const tcb.ctx)
    }

    /// Steps after the thread switched back: accounting, signal
    /// reconciliation, overflow check, requeue and the event cycle.
    fn finish_dispatch(&mut self) {
        let t = self.current;
        self.current = self.sched;
        // SAFETY: `t` was dispatched by `prepare_dispatch` and is owned by
        // this instance.
        let tcb = unsafe { &mut *t.as_ptr() };
        tcb.running += tcb.last_ran.elapsed();

        let pending_now = SigSet::pending();
        for sig in tcb.shared.sigpending().iter() {
            if !pending_now.contains(sig) {
                tcb.shared.clear_pending(sig);
            } else if !self.sig_pending_before.contains(sig) {
                signal::consume_pending(sig);
            }
        }

        if tcb.stack.as_ref().is_some_and(|s| !s.canary_intact()) {
            self.stack_overflow(tcb);
        }

        let mut requeue = false;
        match tcb.state() {
            ThreadState::Dead => {
                if tcb.shared.joinable {
                    self.dq.insert(t, tcb.prio());
                } else {
                    trace!(sched = self.id, thread = tcb.name(), "freeing detached thread");
                    // SAFETY: a dead detached thread is referenced by no queue.
                    unsafe { free_tcb(t) };
                }
            }
            // SAFETY: claimed between exit and now; no queue holds it.
            ThreadState::Joined => unsafe { free_tcb(t) },
            ThreadState::Waiting => self.wq.insert(t, tcb.prio()),
            _ => {
                tcb.set_state(ThreadState::Ready);
                requeue = true;
            }
        }

        self.rq.age();
        if requeue {
            // SAFETY: still live; only Dead/Joined blocks were freed above.
            self.rq.insert(t, unsafe { (*t.as_ptr()).prio() });
        }

        let mode = if self.rq.is_empty() && self.nq.is_empty() {
            CycleMode::Wait
        } else {
            CycleMode::Poll
        };
        self.run_event_cycle(mode);
    }

    fn stack_overflow(&mut self, tcb: &mut Tcb) {
        if signal::has_default_action(libc::SIGSEGV) {
            fatal!(
                "STACK OVERFLOW: thread {:p}, name={}",
                Arc::as_ptr(&tcb.shared),
                tcb.name()
            );
        }
        error!(sched = self.id, thread = tcb.name(), "stack overflow, terminating thread");
        if !tcb.state().is_terminated() {
            tcb.shared.finish(Box::new(StackOverflow));
            self.group.live.fetch_sub(1, Ordering::AcqRel);
            if tcb.shared.joinable {
                self.group.notify_join(&tcb.handle());
            }
        }
        signal::raise_in_process(libc::SIGSEGV);
    }

    /// Human-readable snapshot of every queue.
    pub(crate) fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "scheduler {} (load {:.2})", self.id, self.inst.load());
        let describe = |t: TcbPtr| {
            // SAFETY: the dump runs inside `with_local`; all blocks are live.
            let tcb = unsafe { &*t.as_ptr() };
            format!(
                "{} [id {}, prio {}, dispatches {}, ran {:?}, age {:?}]",
                tcb.name(),
                tcb.shared.id,
                tcb.prio(),
                tcb.dispatches,
                tcb.running,
                tcb.spawned.elapsed()
            )
        };
        let _ = writeln!(out, "  running: {}", describe(self.current));
        for q in [&self.nq, &self.rq, &self.wq, &self.sq, &self.dq] {
            let _ = writeln!(out, "  {} ({}):", q.name(), q.len());
            for (t, qprio) in q.iter_with_prio() {
                let _ = writeln!(out, "    qprio {qprio:>3}  {}", describe(t));
            }
        }
        out
    }
}

// ── Coroutine entry points ──────────────────────────────────────────────

unsafe extern "C" fn scheduler_entry(_arg: *mut u8) {
    dispatch_loop()
}

/// Every entry into the dispatch loop comes from a thread that just gave up
/// the CPU, so each iteration settles that thread before picking the next.
fn dispatch_loop() -> ! {
    loop {
        if with_local(Scheduler::finish_dispatch).is_none() {
            fatal!("dispatch loop lost its scheduler instance");
        }
        let Some((from, to)) = with_local(Scheduler::prepare_dispatch) else {
            fatal!("dispatch loop running without a scheduler instance");
        };
        // SAFETY: both contexts belong to live blocks of this instance; no
        // reference into the scheduler is held across the switch.
        unsafe { coro_switch(from, to) };
    }
}

/// First code every spawned thread runs.
unsafe extern "C" fn thread_start(_arg: *mut u8) {
    let start = with_current(|tcb| (tcb.entry.take(), tcb.sigmask, tcb.shared.name.clone()));
    let Some((Some(entry), mask, name)) = start else {
        fatal!("thread started without an entry point");
    };
    signal::set_mask(&mask);
    let value = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(value) => value,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            warn!(thread = %name, panic = %msg, "thread panicked");
            payload
        }
    };
    crate::api::exit_value(value)
}

/// Give the CPU to the dispatch loop. The caller sets its own state first
/// (`Waiting`, `Dead`, ...) or leaves it `Running` to be requeued as Ready.
pub(crate) fn switch_to_scheduler() {
    let Some((cur, to)) = with_local(|s| (s.current, s.sched_ctx())) else {
        return;
    };
    let mask = signal::block_all();
    // SAFETY: `cur` is the calling thread's own block; it stays alive while
    // the thread is suspended.
    let from = unsafe {
        (*cur.as_ptr()).sigmask = mask;
        &raw mut (*cur.as_ptr()).ctx
    };
    // SAFETY: `to` is the dispatch loop's context of this instance.
    unsafe { coro_switch(from, to) };
    // SAFETY: resumed by the dispatch loop, so `cur` is current again.
    let mask = unsafe { (*cur.as_ptr()).sigmask };
    signal::set_mask(&mask);
}
