//! Runtime groups, sibling scheduler instances and new-thread migration.
//!
//! A [`Group`] is created by `init` on the calling OS thread, which becomes
//! instance 0. `reconcile` starts one OS thread per additional instance.
//! Every instance, on every dispatch iteration, hands a share of its New
//! queue to its siblings by writing the control block pointers into their
//! receive pipes. Only threads that have never run migrate, so a stack is
//! never resumed on a different OS thread than the one that started it.
//!
//! The group also owns the join pipe: exiting joinable threads write their
//! handle into it, and whichever instance drains it parks the handles in a
//! lock-free pool where `join(None)` on any instance can claim them.

use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use tracing::{debug, error, trace, warn};

use crate::config::{Config, MAX_SCHEDULERS};
use crate::event::{Event, EventRing};
use crate::pipe::{InFlight, Pipe};
use crate::scheduler::{self, Scheduler};
use crate::tcb::{Claim, ThreadHandle, ThreadShared, ThreadState, Value};

/// How often an idle sibling re-checks its stop flag without a doorbell.
const IDLE_RECHECK: Duration = Duration::from_secs(1);

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

// ── InstanceShared ──────────────────────────────────────────────────────

/// The part of a scheduler instance its siblings may touch.
#[derive(Debug)]
pub(crate) struct InstanceShared {
    pub(crate) id: usize,
    /// Migration inbox; also carries doorbells.
    pub(crate) receive: Pipe,
    /// `f32` bits of the load average.
    load: AtomicU32,
    stop: AtomicBool,
}

impl InstanceShared {
    fn new(id: usize) -> io::Result<Self> {
        // The first instance starts out assumed busy so that early load
        // readings do not report an idle process.
        let initial: f32 = if id == 0 { 1.0 } else { 0.0 };
        Ok(InstanceShared {
            id,
            receive: Pipe::new()?,
            load: AtomicU32::new(initial.to_bits()),
            stop: AtomicBool::new(false),
        })
    }

    pub(crate) fn load(&self) -> f32 {
        f32::from_bits(self.load.load(Ordering::Relaxed))
    }

    pub(crate) fn set_load(&self, load: f32) {
        self.load.store(load.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.receive.ring_doorbell();
    }
}

// ── Group ───────────────────────────────────────────────────────────────

pub(crate) struct Group {
    pub(crate) id: u64,
    pub(crate) config: Config,
    instances: Box<[OnceLock<Arc<InstanceShared>>]>,
    count: AtomicUsize,
    /// Threads that have not exited yet, `main` included.
    pub(crate) live: AtomicUsize,
    pub(crate) join_pipe: Pipe,
    pub(crate) join_pool: Injector<ThreadHandle>,
    os_threads: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl Group {
    pub(crate) fn new(config: Config) -> io::Result<Arc<Group>> {
        Ok(Arc::new(Group {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            instances: (0..MAX_SCHEDULERS).map(|_| OnceLock::new()).collect(),
            count: AtomicUsize::new(0),
            live: AtomicUsize::new(1),
            join_pipe: Pipe::new()?,
            join_pool: Injector::new(),
            os_threads: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Create the shared part of instance `id` and make it visible to the
    /// other instances.
    pub(crate) fn register_instance(&self, id: usize) -> io::Result<Arc<InstanceShared>> {
        let slot = self
            .instances
            .get(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "too many scheduler instances"))?;
        let inst = Arc::new(InstanceShared::new(id)?);
        if slot.set(Arc::clone(&inst)).is_err() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "instance already registered"));
        }
        self.count.fetch_max(id + 1, Ordering::AcqRel);
        Ok(inst)
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn instance(&self, id: usize) -> Option<&Arc<InstanceShared>> {
        self.instances.get(id)?.get()
    }

    /// Running instances other than `of`, in id order.
    fn siblings(&self, of: usize) -> impl Iterator<Item = &Arc<InstanceShared>> {
        (0..self.instance_count())
            .filter(move |&id| id != of)
            .filter_map(|id| self.instance(id))
            .filter(|inst| !inst.stop_requested())
    }

    /// Bring the number of instances up to `target`.
    ///
    /// Instances are never retired: once started, an instance lives until
    /// the group shuts down. A lower target is logged and ignored.
    pub(crate) fn reconcile(self: &Arc<Self>, target: usize) {
        let target = target.clamp(1, MAX_SCHEDULERS);
        let current = self.instance_count();
        if target < current {
            debug!(current, target, "scheduler instances are not retired; keeping all");
            return;
        }
        let mut handles = match self.os_threads.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        for id in current..target {
            let inst = match self.register_instance(id) {
                Ok(inst) => inst,
                Err(e) => {
                    warn!(sched = id, error = %e, "cannot register scheduler instance");
                    break;
                }
            };
            let group = Arc::clone(self);
            let sibling = Arc::clone(&inst);
            match thread::Builder::new()
                .name(format!("pth-sched-{id}"))
                .spawn(move || sibling_main(group, sibling))
            {
                Ok(handle) => handles.push(Some(handle)),
                Err(e) => {
                    warn!(sched = id, error = %e, "cannot start scheduler OS thread");
                    inst.request_stop();
                    break;
                }
            }
        }
        debug!(group = self.id, instances = self.instance_count(), "scheduler instances reconciled");
    }

    /// Ask every sibling to stop and wait for their OS threads.
    pub(crate) fn stop_siblings(&self) {
        for id in 1..self.instance_count() {
            if let Some(inst) = self.instance(id) {
                inst.request_stop();
            }
        }
        let handles: Vec<_> = {
            let mut guard = match self.os_threads.lock() {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            guard.iter_mut().filter_map(Option::take).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!(group = self.id, "scheduler OS thread panicked");
            }
        }
    }

    /// Publish that a joinable thread has died.
    pub(crate) fn notify_join(&self, handle: &ThreadHandle) {
        let raw = Arc::into_raw(Arc::clone(&handle.0)) as usize;
        loop {
            match self.join_pipe.send_word(raw) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Nobody is draining; make room ourselves.
                    self.drain_join_pipe();
                }
                Err(e) => {
                    warn!(thread = %handle.name(), error = %e, "join pipe write failed");
                    // SAFETY: `raw` came from `Arc::into_raw` above and was
                    // not written to the pipe.
                    drop(unsafe { Arc::from_raw(raw as *const ThreadShared) });
                    self.join_pool.push(handle.clone());
                    return;
                }
            }
        }
    }

    /// Move every handle in the join pipe to the join pool, dropping
    /// handles that were already joined. Returns how many were read.
    pub(crate) fn drain_join_pipe(&self) -> usize {
        let mut read = 0;
        loop {
            match self.join_pipe.recv_word() {
                Ok(Some(0)) => {}
                Ok(Some(word)) => {
                    read += 1;
                    // SAFETY: non-zero words are written only by
                    // `notify_join`, each from its own `Arc::into_raw`.
                    let shared = unsafe { Arc::from_raw(word as *const ThreadShared) };
                    if shared.state() == ThreadState::Dead {
                        self.join_pool.push(ThreadHandle(shared));
                    }
                }
                Ok(None) => return read,
                Err(e) => {
                    warn!(group = self.id, error = %e, "join pipe read failed");
                    return read;
                }
            }
        }
    }

    /// Claim any dead joinable thread parked in the join pool.
    pub(crate) fn claim_from_pool(&self) -> Option<(ThreadHandle, Value)> {
        loop {
            match self.join_pool.steal() {
                Steal::Success(handle) => {
                    if let Claim::Claimed(value) = handle.0.try_claim() {
                        return Some((handle, value));
                    }
                }
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Drop pooled handles that are no longer claimable.
    ///
    /// Threads joined by handle still pass through the pool when they die
    /// while someone waits on a termination event.
    pub(crate) fn prune_join_pool(&self) {
        let mut keep = Vec::new();
        loop {
            match self.join_pool.steal() {
                Steal::Success(handle) => {
                    if handle.state() == ThreadState::Dead {
                        keep.push(handle);
                    }
                }
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        for handle in keep {
            self.join_pool.push(handle);
        }
    }

    /// Wake the instance owning `handle` so it re-examines its waiters.
    pub(crate) fn poke_owner(&self, handle: &ThreadHandle) {
        if let Some(inst) = self.instance(handle.0.home()) {
            inst.receive.ring_doorbell();
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.drain_join_pipe();
        while !matches!(self.join_pool.steal(), Steal::Empty) {}
    }
}

// ── Sibling instances ───────────────────────────────────────────────────

fn sibling_main(group: Arc<Group>, inst: Arc<InstanceShared>) {
    let id = inst.id;
    if let Err(e) = scheduler::bootstrap(Arc::clone(&group), Arc::clone(&inst)) {
        error!(sched = id, error = %e, "sibling scheduler failed to start");
        inst.request_stop();
        return;
    }
    if group.config.affinity_nodes.is_some_and(|nodes| id < nodes) {
        pin_to_cpu(id);
    }
    debug!(sched = id, "sibling scheduler running");

    let watched = Arc::clone(&inst);
    let mut ring = EventRing::new();
    ring.push(Event::func(move || watched.stop_requested(), IDLE_RECHECK));
    while !inst.stop_requested() {
        if let Err(e) = crate::api::wait(&mut ring) {
            error!(sched = id, error = %e, "sibling scheduler wait failed");
            break;
        }
        ring.reset();
    }
    scheduler::teardown_local();
}

fn pin_to_cpu(id: usize) {
    let cpus = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    let cpu = id % cpus;
    // SAFETY: a zeroed cpu_set_t is a valid empty set; CPU_SET stays in
    // bounds for `cpu < cpus <= CPU_SETSIZE` and sched_setaffinity only
    // reads the set.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        warn!(sched = id, cpu, error = %io::Error::last_os_error(), "cannot set CPU affinity");
    }
}

// ── Migration ───────────────────────────────────────────────────────────

impl Scheduler {
    /// Hand a share of the New queue to every sibling.
    ///
    /// With `n` new threads and `k` instances each instance ends up with
    /// `n / k` threads, the `n % k` left over spread one apiece starting
    /// with this instance.
    pub(crate) fn distribute_new_threads(&mut self) {
        if self.nq.is_empty() || self.group.instance_count() < 2 {
            return;
        }
        let siblings: Vec<Arc<InstanceShared>> = self.group.siblings(self.id).cloned().collect();
        let total = siblings.len() + 1;
        let n = self.nq.len();
        let share = n / total;
        let mut extra = (n % total).saturating_sub(1);

        for sib in siblings {
            let mut quota = share;
            if extra > 0 {
                quota += 1;
                extra -= 1;
            }
            while quota > 0 {
                let Some(t) = self.nq.pop_tail() else {
                    return;
                };
                // SAFETY: `t` was just removed from the New queue; blocks are
                // created by `Box::leak`, so this reclaims unique ownership.
                let tcb = unsafe { Box::from_raw(t.as_ptr()) };
                let shared = Arc::clone(&tcb.shared);
                shared.set_home(sib.id);
                match InFlight::launch(tcb).send(&sib.receive) {
                    Ok(()) => {
                        trace!(sched = self.id, to = sib.id, thread = %shared.name, "migrated");
                        quota -= 1;
                    }
                    Err((flight, e)) => {
                        debug!(sched = self.id, to = sib.id, error = %e, "migration deferred");
                        shared.set_home(self.id);
                        let back = std::ptr::NonNull::from(Box::leak(flight.land()));
                        self.nq.insert(back, shared.prio());
                        break;
                    }
                }
            }
        }
    }

    /// Land every thread waiting in this instance's receive pipe.
    pub(crate) fn handle_received(&mut self) {
        loop {
            match InFlight::receive(&self.inst.receive) {
                Ok(Some(flight)) => {
                    let tcb = flight.land();
                    let state = tcb.state();
                    let t = std::ptr::NonNull::from(Box::leak(tcb));
                    // SAFETY: just landed; this instance is now the owner.
                    let tcb = unsafe { &*t.as_ptr() };
                    tcb.shared.set_home(self.id);
                    match state {
                        ThreadState::Waiting => self.wq.insert(t, tcb.prio()),
                        _ => {
                            tcb.set_state(ThreadState::Ready);
                            self.rq.insert_favourite(t);
                        }
                    }
                    trace!(sched = self.id, thread = tcb.name(), "received");
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(sched = self.id, error = %e, "receive pipe read failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_grows_the_instance_count() {
        let group = Group::new(Config::default()).unwrap();
        assert_eq!(group.instance_count(), 0);
        group.register_instance(0).unwrap();
        group.register_instance(1).unwrap();
        assert_eq!(group.instance_count(), 2);
        assert!(group.register_instance(1).is_err());
        assert_eq!(group.siblings(0).map(|i| i.id).collect::<Vec<_>>(), vec![1]);
        assert!((group.instance(0).unwrap().load() - 1.0).abs() < f32::EPSILON);
        assert!(group.instance(1).unwrap().load().abs() < f32::EPSILON);
    }

    #[test]
    fn stopped_instances_are_not_siblings() {
        let group = Group::new(Config::default()).unwrap();
        group.register_instance(0).unwrap();
        group.register_instance(1).unwrap().request_stop();
        assert_eq!(group.siblings(0).count(), 0);
    }

    #[test]
    fn join_pipe_feeds_the_pool() {
        let group = Group::new(Config::default()).unwrap();
        let dead = ThreadHandle(Arc::new(ThreadShared::new(1, group.id, "d".into(), true, 0, 0)));
        dead.0.finish(Box::new(5_u8));
        let alive = ThreadHandle(Arc::new(ThreadShared::new(2, group.id, "a".into(), true, 0, 0)));

        group.notify_join(&dead);
        group.notify_join(&alive);
        assert_eq!(group.drain_join_pipe(), 2);

        let (handle, value) = group.claim_from_pool().unwrap();
        assert_eq!(handle, dead);
        assert_eq!(*value.downcast::<u8>().unwrap(), 5);
        assert!(group.claim_from_pool().is_none());
        drop(handle);
        assert_eq!(Arc::strong_count(&dead.0), 1);
    }
}
