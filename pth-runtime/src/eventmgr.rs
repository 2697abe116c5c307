//! The event manager: turns every pending wait condition of the Waiting
//! queue into one `ppoll(2)` call, then moves satisfied waiters to Ready.
//!
//! One cycle is:
//!
//! 1. **Scan.** Resolve what needs no syscall (timers already due,
//!    thread-directed signals, unlocked mutexes, cancellation requests...),
//!    collect descriptors to poll, the nearest deadline, and the signals
//!    waiters are interested in.
//! 2. **Multiplex.** Poll waiter descriptors plus the internal pipes,
//!    unblocking only the interesting signals, which are routed into the
//!    instance's self-pipe. `EINTR` is retried.
//! 3. **Late pass.** Re-evaluate descriptor, signal, timer and termination
//!    events against the result and wake every thread with a settled event.
//! 4. **Pipes.** Drained join-pipe handles go to the group's join pool;
//!    migrated threads are landed.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::fatal;
use crate::event::{EventKind, EventStatus};
use crate::scheduler::Scheduler;
use crate::signal::{self, SigSet};
use crate::sync::Cond;
use crate::tcb::{TcbPtr, ThreadHandle, ThreadState};

/// Upper bound on a blocking wait while some waiter depends on another
/// scheduler instance, which cannot wake us directly.
pub(crate) const REMOTE_RECHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleMode {
    /// Check without blocking; other threads are runnable.
    Poll,
    /// Block until at least one thread becomes runnable.
    Wait,
}

// ── PollSet ─────────────────────────────────────────────────────────────

/// `pollfd` array with one entry per descriptor.
#[derive(Default)]
struct PollSet {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl PollSet {
    fn watch(&mut self, fd: RawFd, events: libc::c_short) -> usize {
        if let Some(&i) = self.index.get(&fd) {
            self.fds[i].events |= events;
            return i;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.index.insert(fd, self.fds.len() - 1);
        self.fds.len() - 1
    }

    fn revents(&self, fd: RawFd) -> libc::c_short {
        self.index.get(&fd).map_or(0, |&i| self.fds[i].revents)
    }

    fn readable(&self, slot: usize) -> bool {
        self.fds[slot].revents & (libc::POLLIN | libc::POLLHUP) != 0
    }

    /// `ppoll` with `mask` installed for the duration of the call,
    /// retrying on `EINTR` with the remaining time.
    fn wait(&mut self, timeout: Option<Duration>, mask: &SigSet) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ts = deadline.map(|d| {
                let left = d.saturating_duration_since(Instant::now());
                libc::timespec {
                    tv_sec: libc::time_t::try_from(left.as_secs()).unwrap_or(libc::time_t::MAX),
                    tv_nsec: left.subsec_nanos().into(),
                }
            });
            let ts_ptr = ts.as_ref().map_or(std::ptr::null(), std::ptr::from_ref);
            // SAFETY: `fds` is a valid pollfd array of the given length and
            // `ts_ptr`/`mask` are valid or null for the call's duration.
            let rc = unsafe {
                libc::ppoll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    ts_ptr,
                    mask.as_raw(),
                )
            };
            if let Ok(n) = usize::try_from(rc) {
                return Ok(n);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

// ── Event cycle ─────────────────────────────────────────────────────────

impl Scheduler {
    /// Run one `Poll` cycle, or `Wait` cycles until some thread is runnable.
    ///
    /// A `Wait` cycle may block indefinitely, so another one never starts
    /// once Ready or New holds a thread. Join-pipe handles drained by one
    /// cycle are matched against waiters by the scan of the next.
    pub(crate) fn run_event_cycle(&mut self, mode: CycleMode) {
        loop {
            self.event_cycle_once(mode);
            if mode == CycleMode::Poll || !self.rq.is_empty() || !self.nq.is_empty() {
                return;
            }
        }
    }

    /// Whether a termination event for `target` has been reached.
    fn termination_reached(&self, target: Option<&ThreadHandle>, goal: ThreadState) -> bool {
        match target {
            Some(h) => {
                let state = h.state();
                state == goal || (goal == ThreadState::Dead && state == ThreadState::Joined)
            }
            None => {
                // SAFETY: dead-queue entries are live blocks of this instance.
                self.dq.iter().any(|t| unsafe { (*t.as_ptr()).state() } == ThreadState::Dead)
                    || !self.group.join_pool.is_empty()
            }
        }
    }

    #[expect(clippy::too_many_lines, reason = "one pass per phase of the cycle")]
    fn event_cycle_once(&mut self, mode: CycleMode) {
        let now = Instant::now();
        let multi = self.group.instance_count() > 1;
        let os_pending = SigSet::pending();
        let waiters: Vec<TcbPtr> = self.wq.iter().collect();

        let mut polls = PollSet::default();
        let mut catch = SigSet::empty();
        let mut next_timer: Option<Instant> = None;
        let mut any_settled = false;
        let mut remote = false;
        let mut watch_joins = false;

        // ── Scan ────────────────────────────────────────────────────────
        for &t in &waiters {
            // SAFETY: waiting-queue entries are live blocks of this instance.
            let tcb = unsafe { &mut *t.as_ptr() };
            if tcb.cancel_enabled && tcb.shared.cancel_requested() {
                any_settled = true;
            }
            let Some(ring) = tcb.events else {
                continue;
            };
            // SAFETY: the ring lives on the stack of this suspended thread,
            // which cannot run before it is moved back to Ready.
            let ring = unsafe { &mut *ring.as_ptr() };
            for ev in ring.iter_mut().filter(|ev| ev.is_pending()) {
                let settled = match &mut ev.kind {
                    EventKind::Fd { fd, goal, .. } => {
                        if *fd < 0 {
                            Some(EventStatus::Failed)
                        } else {
                            polls.watch(*fd, goal.poll_events());
                            None
                        }
                    }
                    EventKind::FdSet { watches, .. } => {
                        if watches.iter().any(|w| w.fd < 0) {
                            Some(EventStatus::Failed)
                        } else {
                            for w in watches.iter() {
                                polls.watch(w.fd, w.goal.poll_events());
                            }
                            None
                        }
                    }
                    EventKind::Signal { set, caught } => {
                        let hit = set.iter().find(|&sig| {
                            if tcb.shared.has_pending(sig) {
                                tcb.shared.clear_pending(sig);
                                true
                            } else if os_pending.contains(sig) {
                                signal::consume_pending(sig);
                                true
                            } else {
                                false
                            }
                        });
                        if let Some(sig) = hit {
                            *caught = Some(sig);
                            Some(EventStatus::Occurred)
                        } else {
                            for sig in set.iter() {
                                catch.add(sig);
                            }
                            None
                        }
                    }
                    EventKind::Timer { deadline } => {
                        if *deadline <= now {
                            Some(EventStatus::Occurred)
                        } else {
                            next_timer = Some(next_timer.map_or(*deadline, |n| n.min(*deadline)));
                            None
                        }
                    }
                    EventKind::MessagePort(port) => {
                        remote |= multi;
                        port.has_messages().then_some(EventStatus::Occurred)
                    }
                    EventKind::MutexRelease(mutex) => {
                        remote |= multi;
                        (!mutex.is_locked()).then_some(EventStatus::Occurred)
                    }
                    EventKind::CondSignal(cond) => {
                        remote |= multi;
                        cond.observe().then_some(EventStatus::Occurred)
                    }
                    EventKind::ThreadTermination { target, goal } => {
                        watch_joins = true;
                        if self.termination_reached(target.as_ref(), *goal) {
                            Some(EventStatus::Occurred)
                        } else {
                            remote |= multi && target.as_ref().map_or(true, |h| h.0.home() != self.id);
                            None
                        }
                    }
                    EventKind::CustomFunc { func, interval } => {
                        if func() {
                            Some(EventStatus::Occurred)
                        } else {
                            let due = now + *interval;
                            next_timer = Some(next_timer.map_or(due, |n| n.min(due)));
                            None
                        }
                    }
                };
                if let Some(status) = settled {
                    ev.status = status;
                    any_settled = true;
                }
            }
        }

        // ── Multiplex ───────────────────────────────────────────────────
        let timeout = if mode == CycleMode::Poll || any_settled {
            Some(Duration::ZERO)
        } else {
            let until_timer = next_timer.map(|d| d.saturating_duration_since(now));
            if remote {
                Some(until_timer.map_or(REMOTE_RECHECK, |t| t.min(REMOTE_RECHECK)))
            } else {
                until_timer
            }
        };

        let sig_slot = polls.watch(self.sigpipe.read_fd(), libc::POLLIN);
        let join_slot = watch_joins.then(|| polls.watch(self.group.join_pipe.read_fd(), libc::POLLIN));
        let recv_slot =
            (mode == CycleMode::Wait).then(|| polls.watch(self.inst.receive.read_fd(), libc::POLLIN));

        let installed = if catch.is_empty() {
            None
        } else {
            if let Some(c) = &self.catcher {
                c.watch(&catch);
            }
            Some(signal::install_catchers(&catch))
        };
        let mut mask = SigSet::full();
        mask.subtract(&catch);

        trace!(sched = self.id, ?mode, ?timeout, fds = polls.fds.len(), "event wait");
        let polled = polls.wait(timeout, &mask);
        drop(installed);
        if let Some(c) = &self.catcher {
            c.watch(&SigSet::empty());
        }
        if let Err(e) = polled {
            fatal!("scheduler {}: event multiplexing failed: {e}", self.id);
        }

        let mut raised = SigSet::empty();
        if polls.readable(sig_slot) {
            for sig in self.sigpipe.drain_bytes() {
                raised.add(i32::from(sig));
            }
        }

        // ── Late pass ───────────────────────────────────────────────────
        let now = Instant::now();
        let mut woken = Vec::new();
        let mut fired_conds: Vec<Cond> = Vec::new();
        for &t in &waiters {
            // SAFETY: as in the scan pass.
            let tcb = unsafe { &mut *t.as_ptr() };
            let mut wake = tcb.cancel_enabled && tcb.shared.cancel_requested();
            if let Some(ring) = tcb.events {
                // SAFETY: as in the scan pass.
                let ring = unsafe { &mut *ring.as_ptr() };
                for ev in ring.iter_mut() {
                    if ev.is_pending() {
                        let settled = match &mut ev.kind {
                            EventKind::Fd { fd, goal, ready } => {
                                let revents = polls.revents(*fd);
                                if revents & libc::POLLNVAL != 0 {
                                    Some(EventStatus::Failed)
                                } else {
                                    *ready = goal.satisfied_by(revents);
                                    (!ready.is_empty()).then_some(EventStatus::Occurred)
                                }
                            }
                            EventKind::FdSet { watches, ready } => {
                                let mut failed = false;
                                *ready = 0;
                                for w in watches.iter_mut() {
                                    let revents = polls.revents(w.fd);
                                    failed |= revents & libc::POLLNVAL != 0;
                                    w.ready = w.goal.satisfied_by(revents);
                                    *ready += usize::from(!w.ready.is_empty());
                                }
                                if failed {
                                    Some(EventStatus::Failed)
                                } else {
                                    (*ready > 0).then_some(EventStatus::Occurred)
                                }
                            }
                            EventKind::Signal { set, caught } => {
                                set.iter().find(|&sig| raised.contains(sig)).map(|sig| {
                                    *caught = Some(sig);
                                    EventStatus::Occurred
                                })
                            }
                            EventKind::Timer { deadline } => {
                                (*deadline <= now).then_some(EventStatus::Occurred)
                            }
                            EventKind::ThreadTermination { target, goal } => self
                                .termination_reached(target.as_ref(), *goal)
                                .then_some(EventStatus::Occurred),
                            _ => None,
                        };
                        if let Some(status) = settled {
                            ev.status = status;
                        }
                    }
                    if !ev.is_pending() {
                        wake = true;
                        if let (EventKind::CondSignal(cond), EventStatus::Occurred) = (&ev.kind, ev.status) {
                            fired_conds.push(cond.clone());
                        }
                    }
                }
            }
            if wake {
                woken.push(t);
            }
        }

        for cond in &fired_conds {
            cond.reset();
        }
        for t in woken {
            if self.wq.delete(t).is_err() {
                continue;
            }
            // SAFETY: just removed from the waiting queue; still live.
            let tcb = unsafe { &*t.as_ptr() };
            tcb.set_state(ThreadState::Ready);
            self.rq.insert(t, tcb.prio() + 1);
            trace!(sched = self.id, thread = tcb.name(), "woken");
        }

        // ── Internal pipes ──────────────────────────────────────────────
        if join_slot.is_some_and(|slot| polls.readable(slot)) {
            let drained = self.group.drain_join_pipe();
            trace!(sched = self.id, drained, "join pipe drained");
        }
        if recv_slot.is_some_and(|slot| polls.readable(slot)) {
            self.handle_received();
        }
    }
}
