//! Cooperative synchronisation primitives.
//!
//! None of these block the OS thread. A thread that cannot proceed waits on
//! the matching event kind and the event manager wakes it once the
//! condition holds. State lives in atomics so the primitives can be shared
//! between threads of different scheduler instances.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal};

use crate::api;
use crate::error::{PthError, Result};
use crate::event::{Event, EventRing};
use crate::scheduler::with_current;

// ── Mutex ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MutexState {
    /// Id of the owning thread; 0 when unlocked.
    owner: AtomicU64,
    /// Recursion depth of the owner.
    count: AtomicUsize,
}

/// Recursive mutex owned by a lightweight thread.
///
/// Mutexes still held when their owner exits are released automatically.
#[derive(Clone, Default)]
pub struct Mutex(Arc<MutexState>);

impl Mutex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.0.owner.load(Ordering::Acquire) != 0
    }

    /// Lock, waiting cooperatively while another thread holds the mutex.
    pub fn acquire(&self) -> Result<()> {
        self.lock(false)
    }

    /// Lock without waiting; [`PthError::Busy`] if another thread holds it.
    pub fn try_acquire(&self) -> Result<()> {
        self.lock(true)
    }

    fn lock(&self, try_only: bool) -> Result<()> {
        let me = api::current_thread_id()?;
        loop {
            let owner = self.0.owner.load(Ordering::Acquire);
            if owner == me {
                self.0.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if owner == 0
                && self
                    .0
                    .owner
                    .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                self.0.count.store(1, Ordering::Relaxed);
                let held = self.clone();
                with_current(|tcb| tcb.mutexes.push(held));
                return Ok(());
            }
            if try_only {
                return Err(PthError::Busy);
            }
            let mut ring = EventRing::new();
            ring.push(Event::mutex(self));
            api::wait(&mut ring)?;
        }
    }

    /// Drop one level of ownership; unlocks at depth zero.
    pub fn release(&self) -> Result<()> {
        let me = api::current_thread_id()?;
        if self.0.owner.load(Ordering::Acquire) != me {
            return Err(PthError::PermissionDenied("mutex is not held by the calling thread"));
        }
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.owner.store(0, Ordering::Release);
            with_current(|tcb| tcb.mutexes.retain(|m| !Arc::ptr_eq(&m.0, &self.0)));
        }
        Ok(())
    }

    /// Unlock regardless of depth. Used when the owner exits.
    pub(crate) fn force_release(&self) {
        self.0.count.store(0, Ordering::Relaxed);
        self.0.owner.store(0, Ordering::Release);
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("owner", &self.0.owner.load(Ordering::Relaxed))
            .field("count", &self.0.count.load(Ordering::Relaxed))
            .finish()
    }
}

// ── Cond ────────────────────────────────────────────────────────────────

const COND_SIGNALED: u8 = 0b001;
const COND_BROADCAST: u8 = 0b010;
const COND_HANDLED: u8 = 0b100;

#[derive(Debug, Default)]
struct CondState {
    flags: AtomicU8,
    waiters: AtomicUsize,
}

/// Condition variable used together with a [`Mutex`].
#[derive(Clone, Default)]
pub struct Cond(Arc<CondState>);

impl Cond {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `mutex`, wait for a notification, then re-acquire `mutex`.
    ///
    /// A signal (not a broadcast) that no waiter has consumed yet is taken
    /// immediately.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        let flags = self.0.flags.load(Ordering::Acquire);
        if flags & COND_SIGNALED != 0 && flags & COND_BROADCAST == 0 {
            self.reset();
            return Ok(());
        }

        self.0.waiters.fetch_add(1, Ordering::AcqRel);
        let waited = mutex.release().and_then(|()| {
            let mut ring = EventRing::new();
            ring.push(Event::cond(self));
            api::wait(&mut ring)
        });
        let relocked = mutex.acquire();
        self.0.waiters.fetch_sub(1, Ordering::AcqRel);
        waited?;
        relocked
    }

    /// Wake one waiter, or every waiter when `broadcast` is set, then
    /// yield so they get a chance to run.
    pub fn notify(&self, broadcast: bool) -> Result<()> {
        if self.0.waiters.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let flags = if broadcast {
            COND_SIGNALED | COND_BROADCAST
        } else {
            COND_SIGNALED
        };
        self.0.flags.store(flags, Ordering::Release);
        api::yield_now()
    }

    /// Number of threads currently waiting.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.0.waiters.load(Ordering::Acquire)
    }

    /// Whether a waiter observing the condition now should wake. A plain
    /// signal is handed to exactly one observer.
    pub(crate) fn observe(&self) -> bool {
        let flags = self.0.flags.load(Ordering::Acquire);
        if flags & COND_SIGNALED == 0 {
            return false;
        }
        if flags & COND_BROADCAST != 0 {
            return true;
        }
        flags & COND_HANDLED == 0
            && self
                .0
                .flags
                .compare_exchange(flags, flags | COND_HANDLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Clear the notification once its waiters have been woken.
    pub(crate) fn reset(&self) {
        self.0.flags.store(0, Ordering::Release);
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cond")
            .field("flags", &self.0.flags.load(Ordering::Relaxed))
            .field("waiters", &self.0.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

// ── MsgPort ─────────────────────────────────────────────────────────────

/// A message carried by a [`MsgPort`].
pub type Message = Box<dyn Any + Send>;

/// Lock-free FIFO message queue.
#[derive(Clone, Default)]
pub struct MsgPort(Arc<Injector<Message>>);

impl MsgPort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send>(&self, msg: T) {
        self.0.push(Box::new(msg));
    }

    /// Take the oldest message, if any.
    #[must_use]
    pub fn try_get(&self) -> Option<Message> {
        loop {
            match self.0.steal() {
                Steal::Success(msg) => return Some(msg),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Take the oldest message, waiting cooperatively for one to arrive.
    pub fn get(&self) -> Result<Message> {
        loop {
            if let Some(msg) = self.try_get() {
                return Ok(msg);
            }
            let mut ring = EventRing::new();
            ring.push(Event::message(self));
            api::wait(&mut ring)?;
        }
    }

    #[must_use]
    pub fn has_messages(&self) -> bool {
        !self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for MsgPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgPort").field("len", &self.0.len()).finish()
    }
}
