//! Wait conditions.
//!
//! A thread blocks by handing an [`EventRing`] to [`wait`](crate::wait).
//! The event manager only ever changes the status (and the outputs) of the
//! events in the ring; the ring itself stays owned by the waiting thread.
//! The thread becomes runnable once at least one event is no longer
//! [`EventStatus::Pending`].

use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::signal::SigSet;
use crate::sync::{Cond, MsgPort, Mutex};
use crate::tcb::{ThreadHandle, ThreadState};

bitflags! {
    /// File descriptor conditions to wait for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdGoal: u8 {
        const READABLE  = 0b001;
        const WRITABLE  = 0b010;
        const EXCEPTION = 0b100;
    }
}

impl FdGoal {
    pub(crate) fn poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(FdGoal::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(FdGoal::WRITABLE) {
            events |= libc::POLLOUT;
        }
        if self.contains(FdGoal::EXCEPTION) {
            events |= libc::POLLPRI;
        }
        events
    }

    /// Which requested conditions `revents` satisfies. Hang-ups and errors
    /// count as readable and writable so the owner notices them on its
    /// next read or write.
    pub(crate) fn satisfied_by(self, revents: libc::c_short) -> FdGoal {
        let mut ready = FdGoal::empty();
        if self.contains(FdGoal::READABLE) && revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            ready |= FdGoal::READABLE;
        }
        if self.contains(FdGoal::WRITABLE) && revents & (libc::POLLOUT | libc::POLLERR) != 0 {
            ready |= FdGoal::WRITABLE;
        }
        if self.contains(FdGoal::EXCEPTION) && revents & libc::POLLPRI != 0 {
            ready |= FdGoal::EXCEPTION;
        }
        ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Occurred,
    /// The condition can never occur (for example a closed descriptor).
    Failed,
}

/// One descriptor of an fd-set event.
#[derive(Debug, Clone)]
pub struct FdWatch {
    pub fd: RawFd,
    pub goal: FdGoal,
    /// Conditions found ready by the last event cycle.
    pub ready: FdGoal,
}

impl FdWatch {
    #[must_use]
    pub fn new(fd: RawFd, goal: FdGoal) -> Self {
        FdWatch {
            fd,
            goal,
            ready: FdGoal::empty(),
        }
    }
}

pub(crate) enum EventKind {
    Fd {
        fd: RawFd,
        goal: FdGoal,
        ready: FdGoal,
    },
    FdSet {
        watches: Vec<FdWatch>,
        ready: usize,
    },
    Signal {
        set: SigSet,
        caught: Option<i32>,
    },
    Timer {
        deadline: Instant,
    },
    MessagePort(MsgPort),
    MutexRelease(Mutex),
    CondSignal(Cond),
    ThreadTermination {
        /// `None` waits for any joinable thread of the group.
        target: Option<ThreadHandle>,
        goal: ThreadState,
    },
    CustomFunc {
        func: Box<dyn FnMut() -> bool>,
        interval: Duration,
    },
}

/// A single wait condition.
pub struct Event {
    pub(crate) kind: EventKind,
    pub(crate) status: EventStatus,
}

impl Event {
    fn new(kind: EventKind) -> Self {
        Event {
            kind,
            status: EventStatus::Pending,
        }
    }

    /// Wait until `fd` satisfies `goal`.
    #[must_use]
    pub fn fd(fd: RawFd, goal: FdGoal) -> Self {
        Self::new(EventKind::Fd {
            fd,
            goal,
            ready: FdGoal::empty(),
        })
    }

    /// Wait until at least one descriptor in `watches` is ready.
    #[must_use]
    pub fn fd_set(watches: Vec<FdWatch>) -> Self {
        Self::new(EventKind::FdSet { watches, ready: 0 })
    }

    /// Wait for any signal in `set`.
    #[must_use]
    pub fn signals(set: SigSet) -> Self {
        Self::new(EventKind::Signal { set, caught: None })
    }

    /// Wait until the absolute `deadline`.
    #[must_use]
    pub fn deadline(deadline: Instant) -> Self {
        Self::new(EventKind::Timer { deadline })
    }

    /// Wait for `after` to elapse from now.
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::deadline(Instant::now() + after)
    }

    /// Wait until `port` holds a message.
    #[must_use]
    pub fn message(port: &MsgPort) -> Self {
        Self::new(EventKind::MessagePort(port.clone()))
    }

    /// Wait until `mutex` is unlocked.
    #[must_use]
    pub fn mutex(mutex: &Mutex) -> Self {
        Self::new(EventKind::MutexRelease(mutex.clone()))
    }

    /// Wait until `cond` is signalled.
    #[must_use]
    pub fn cond(cond: &Cond) -> Self {
        Self::new(EventKind::CondSignal(cond.clone()))
    }

    /// Wait until `target` (or, with `None`, any joinable thread) reaches
    /// `goal`.
    #[must_use]
    pub fn termination(target: Option<&ThreadHandle>, goal: ThreadState) -> Self {
        Self::new(EventKind::ThreadTermination {
            target: target.cloned(),
            goal,
        })
    }

    /// Wait until `func` returns `true`, re-checking at least every
    /// `interval`.
    ///
    /// `func` runs inside the scheduler and must not call into the runtime.
    #[must_use]
    pub fn func(func: impl FnMut() -> bool + 'static, interval: Duration) -> Self {
        Self::new(EventKind::CustomFunc {
            func: Box::new(func),
            interval,
        })
    }

    #[must_use]
    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.status == EventStatus::Pending
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::Fd { .. } => "fd",
            EventKind::FdSet { .. } => "fd-set",
            EventKind::Signal { .. } => "signal",
            EventKind::Timer { .. } => "timer",
            EventKind::MessagePort(_) => "message",
            EventKind::MutexRelease(_) => "mutex",
            EventKind::CondSignal(_) => "cond",
            EventKind::ThreadTermination { .. } => "termination",
            EventKind::CustomFunc { .. } => "func",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind_name())
            .field("status", &self.status)
            .finish()
    }
}

// ── EventRing ───────────────────────────────────────────────────────────

/// Index of an event inside its ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(usize);

/// The set of events one thread waits on at a time.
#[derive(Debug, Default)]
pub struct EventRing {
    events: Vec<Event>,
}

impl EventRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) -> EventId {
        self.events.push(event);
        EventId(self.events.len() - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this ring.
    #[must_use]
    pub fn status(&self, id: EventId) -> EventStatus {
        self.events[id.0].status
    }

    /// Ids of every event that is no longer pending.
    pub fn occurred(&self) -> impl Iterator<Item = EventId> + '_ {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, ev)| !ev.is_pending())
            .map(|(i, _)| EventId(i))
    }

    /// Number of events that are no longer pending.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.occurred().count()
    }

    /// Set every event back to pending so the ring can be waited on again.
    pub fn reset(&mut self) {
        for ev in &mut self.events {
            ev.status = EventStatus::Pending;
            match &mut ev.kind {
                EventKind::Fd { ready, .. } => *ready = FdGoal::empty(),
                EventKind::FdSet { watches, ready } => {
                    *ready = 0;
                    for w in watches {
                        w.ready = FdGoal::empty();
                    }
                }
                EventKind::Signal { caught, .. } => *caught = None,
                _ => {}
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Event> {
        self.events.iter_mut()
    }

    /// Signal that satisfied a signal event.
    #[must_use]
    pub fn caught_signal(&self, id: EventId) -> Option<i32> {
        match self.events.get(id.0)?.kind {
            EventKind::Signal { caught, .. } => caught,
            _ => None,
        }
    }

    /// Conditions found ready for an fd event.
    #[must_use]
    pub fn fd_ready(&self, id: EventId) -> FdGoal {
        match self.events.get(id.0).map(|ev| &ev.kind) {
            Some(EventKind::Fd { ready, .. }) => *ready,
            _ => FdGoal::empty(),
        }
    }

    /// Watches of an fd-set event, each with the conditions found ready.
    #[must_use]
    pub fn fd_set_watches(&self, id: EventId) -> &[FdWatch] {
        match self.events.get(id.0).map(|ev| &ev.kind) {
            Some(EventKind::FdSet { watches, .. }) => watches,
            _ => &[],
        }
    }

    /// Number of ready descriptors of an fd-set event.
    #[must_use]
    pub fn fd_set_ready_count(&self, id: EventId) -> usize {
        match self.events.get(id.0).map(|ev| &ev.kind) {
            Some(EventKind::FdSet { ready, .. }) => *ready,
            _ => 0,
        }
    }
}

impl FromIterator<Event> for EventRing {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        EventRing {
            events: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_goal_translation() {
        let goal = FdGoal::READABLE | FdGoal::EXCEPTION;
        assert_eq!(goal.poll_events(), libc::POLLIN | libc::POLLPRI);
        assert_eq!(goal.satisfied_by(libc::POLLHUP), FdGoal::READABLE);
        assert_eq!(goal.satisfied_by(libc::POLLOUT), FdGoal::empty());
        assert_eq!(FdGoal::WRITABLE.satisfied_by(libc::POLLERR), FdGoal::WRITABLE);
    }

    #[test]
    fn ring_tracks_settled_events() {
        let mut ring = EventRing::new();
        let a = ring.push(Event::timeout(Duration::from_secs(60)));
        let b = ring.push(Event::signals(SigSet::empty()));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.settled(), 0);

        ring.events[b.0].status = EventStatus::Occurred;
        if let EventKind::Signal { caught, .. } = &mut ring.events[b.0].kind {
            *caught = Some(libc::SIGUSR1);
        }
        assert_eq!(ring.occurred().collect::<Vec<_>>(), vec![b]);
        assert_eq!(ring.caught_signal(b), Some(libc::SIGUSR1));
        assert_eq!(ring.status(a), EventStatus::Pending);

        ring.reset();
        assert_eq!(ring.settled(), 0);
        assert_eq!(ring.caught_signal(b), None);
    }

    #[test]
    fn fd_set_outputs() {
        let mut ring: EventRing = [Event::fd_set(vec![FdWatch::new(0, FdGoal::READABLE)])]
            .into_iter()
            .collect();
        let id = EventId(0);
        assert_eq!(ring.fd_set_ready_count(id), 0);
        if let EventKind::FdSet { watches, ready } = &mut ring.events[0].kind {
            watches[0].ready = FdGoal::READABLE;
            *ready = 1;
        }
        assert_eq!(ring.fd_set_ready_count(id), 1);
        assert_eq!(ring.fd_set_watches(id)[0].ready, FdGoal::READABLE);
        assert_eq!(ring.fd_ready(id), FdGoal::empty());
    }
}
