//! Waiting on events: timers, descriptors, signals, synchronisation
//! primitives, message ports and custom predicates.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::with_default_runtime;
use pth_runtime::{
    join, nap, raise, self_handle, spawn, wait, yield_now, Cond, Event, EventRing, EventStatus,
    FdGoal, FdWatch, MsgPort, Mutex, PthError, SigSet, ThreadAttr, ThreadState,
};

fn pipe() -> (i32, i32) {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close(fd: i32) {
    // SAFETY: closes a descriptor this test opened.
    unsafe { libc::close(fd) };
}

#[test]
fn nap_sleeps_at_least_the_requested_time() {
    with_default_runtime(|| {
        let started = Instant::now();
        nap(Duration::from_millis(100)).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "woke after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "woke after {elapsed:?}");
        assert!(matches!(nap(Duration::ZERO), Err(PthError::InvalidArgument(_))));
    });
}

#[test]
fn other_threads_run_while_one_naps() {
    with_default_runtime(|| {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let sleeper = spawn(&ThreadAttr::new(), move || {
            nap(Duration::from_millis(50)).unwrap();
            flag.load(Ordering::SeqCst)
        })
        .unwrap();
        yield_now().unwrap();
        assert_eq!(sleeper.state(), ThreadState::Waiting);
        done.store(true, Ordering::SeqCst);
        let saw = join(Some(&sleeper)).unwrap();
        assert!(*saw.downcast::<bool>().unwrap());
    });
}

#[test]
fn empty_ring_is_rejected() {
    with_default_runtime(|| {
        let mut ring = EventRing::new();
        assert!(matches!(wait(&mut ring), Err(PthError::InvalidArgument(_))));
    });
}

#[test]
fn readable_descriptor_wakes_its_waiter() {
    with_default_runtime(|| {
        let (rd, wr) = pipe();
        let reader = spawn(&ThreadAttr::new().name("reader"), move || {
            let mut ring = EventRing::new();
            let fd = ring.push(Event::fd(rd, FdGoal::READABLE));
            let timer = ring.push(Event::timeout(Duration::from_secs(10)));
            let settled = wait(&mut ring).unwrap();
            (settled, ring.status(fd), ring.status(timer), ring.fd_ready(fd))
        })
        .unwrap();

        yield_now().unwrap();
        assert_eq!(reader.state(), ThreadState::Waiting);
        // SAFETY: writes one byte from a valid buffer to our pipe.
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);

        let value = join(Some(&reader)).unwrap();
        let (settled, fd_status, timer_status, ready) = *value
            .downcast::<(usize, EventStatus, EventStatus, FdGoal)>()
            .unwrap();
        assert_eq!(settled, 1);
        assert_eq!(fd_status, EventStatus::Occurred);
        assert_eq!(timer_status, EventStatus::Pending);
        assert!(ready.contains(FdGoal::READABLE));
        close(rd);
        close(wr);
    });
}

#[test]
fn fd_set_reports_every_ready_descriptor() {
    with_default_runtime(|| {
        let (rd_a, wr_a) = pipe();
        let (rd_b, wr_b) = pipe();
        let mut ring = EventRing::new();
        let set = ring.push(Event::fd_set(vec![
            FdWatch::new(rd_a, FdGoal::READABLE),
            FdWatch::new(rd_b, FdGoal::READABLE),
            FdWatch::new(wr_a, FdGoal::WRITABLE),
        ]));
        // SAFETY: writes one byte from a valid buffer to our pipe.
        assert_eq!(unsafe { libc::write(wr_b, b"y".as_ptr().cast(), 1) }, 1);

        assert_eq!(wait(&mut ring).unwrap(), 1);
        assert_eq!(ring.status(set), EventStatus::Occurred);
        assert_eq!(ring.fd_set_ready_count(set), 2);
        let watches = ring.fd_set_watches(set);
        assert!(watches[0].ready.is_empty());
        assert!(watches[1].ready.contains(FdGoal::READABLE));
        assert!(watches[2].ready.contains(FdGoal::WRITABLE));
        for fd in [rd_a, wr_a, rd_b, wr_b] {
            close(fd);
        }
    });
}

#[test]
fn invalid_descriptor_fails_the_event() {
    with_default_runtime(|| {
        let mut ring = EventRing::new();
        let bad = ring.push(Event::fd(-1, FdGoal::READABLE));
        assert_eq!(wait(&mut ring).unwrap(), 1);
        assert_eq!(ring.status(bad), EventStatus::Failed);
    });
}

#[test]
fn raised_signal_wakes_a_signal_waiter() {
    with_default_runtime(|| {
        // Keep SIGUSR1 away from the default action if it ever reaches the
        // OS thread; the event consumes it either way.
        // SAFETY: builds a one-signal set and adds it to this OS thread's
        // mask; every pointer refers to the local set.
        unsafe {
            let mut blocked: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut blocked);
            libc::sigaddset(&mut blocked, libc::SIGUSR1);
            libc::pthread_sigmask(libc::SIG_BLOCK, &blocked, std::ptr::null_mut());
        }

        let waiter = spawn(&ThreadAttr::new().name("sig-waiter"), || {
            let mut set = SigSet::empty();
            set.add(libc::SIGUSR1);
            let mut ring = EventRing::new();
            let id = ring.push(Event::signals(set));
            wait(&mut ring).unwrap();
            ring.caught_signal(id)
        })
        .unwrap();

        yield_now().unwrap();
        assert_eq!(waiter.state(), ThreadState::Waiting);
        raise(&waiter, libc::SIGUSR1).unwrap();
        let caught = join(Some(&waiter)).unwrap();
        assert_eq!(*caught.downcast::<Option<i32>>().unwrap(), Some(libc::SIGUSR1));
    });
}

#[test]
fn raising_on_oneself_targets_the_current_os_thread() {
    with_default_runtime(|| {
        // SAFETY: every pointer refers to the local sets; SIGUSR2 stays
        // blocked so the default action never runs.
        unsafe {
            let mut blocked: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut blocked);
            libc::sigaddset(&mut blocked, libc::SIGUSR2);
            libc::pthread_sigmask(libc::SIG_BLOCK, &blocked, std::ptr::null_mut());
        }

        raise(&self_handle().unwrap(), libc::SIGUSR2).unwrap();

        // SAFETY: as above; the zero timeout only polls for SIGUSR2.
        unsafe {
            let mut pending: libc::sigset_t = std::mem::zeroed();
            libc::sigpending(&mut pending);
            assert_eq!(libc::sigismember(&pending, libc::SIGUSR2), 1);

            let mut only: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut only);
            libc::sigaddset(&mut only, libc::SIGUSR2);
            let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            assert_eq!(libc::sigtimedwait(&only, std::ptr::null_mut(), &zero), libc::SIGUSR2);
        }
    });
}

#[test]
fn mutex_serialises_cooperative_critical_sections() {
    with_default_runtime(|| {
        let mutex = Mutex::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (mutex, inside) = (mutex.clone(), Arc::clone(&inside));
                spawn(&ThreadAttr::new(), move || {
                    let mut max_seen = 0;
                    for _ in 0..5 {
                        mutex.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen = max_seen.max(now);
                        yield_now().unwrap();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mutex.release().unwrap();
                        yield_now().unwrap();
                    }
                    max_seen
                })
                .unwrap()
            })
            .collect();
        for h in &handles {
            assert_eq!(*join(Some(h)).unwrap().downcast::<usize>().unwrap(), 1);
        }
        assert!(!mutex.is_locked());
    });
}

#[test]
fn mutex_ownership_is_enforced() {
    with_default_runtime(|| {
        let mutex = Mutex::new();
        mutex.acquire().unwrap();
        mutex.acquire().unwrap();

        let other = mutex.clone();
        let t = spawn(&ThreadAttr::new(), move || {
            let busy = matches!(other.try_acquire(), Err(PthError::Busy));
            let denied = matches!(other.release(), Err(PthError::PermissionDenied(_)));
            busy && denied
        })
        .unwrap();
        assert!(*join(Some(&t)).unwrap().downcast::<bool>().unwrap());

        mutex.release().unwrap();
        assert!(mutex.is_locked());
        mutex.release().unwrap();
        assert!(!mutex.is_locked());
    });
}

#[test]
fn exiting_owner_releases_its_mutexes() {
    with_default_runtime(|| {
        let mutex = Mutex::new();
        let held = mutex.clone();
        let t = spawn(&ThreadAttr::new(), move || held.acquire().unwrap()).unwrap();
        join(Some(&t)).unwrap();
        assert!(!mutex.is_locked());
        mutex.try_acquire().unwrap();
        mutex.release().unwrap();
    });
}

#[test]
fn cond_signal_wakes_the_waiter() {
    with_default_runtime(|| {
        let mutex = Mutex::new();
        let cond = Cond::new();
        let ready = Arc::new(AtomicBool::new(false));

        let (m, c, r) = (mutex.clone(), cond.clone(), Arc::clone(&ready));
        let waiter = spawn(&ThreadAttr::new().name("cond-waiter"), move || {
            m.acquire().unwrap();
            let mut wakeups = 0_u32;
            while !r.load(Ordering::SeqCst) {
                c.wait(&m).unwrap();
                wakeups += 1;
            }
            m.release().unwrap();
            wakeups
        })
        .unwrap();

        yield_now().unwrap();
        assert_eq!(cond.waiters(), 1);
        mutex.acquire().unwrap();
        ready.store(true, Ordering::SeqCst);
        mutex.release().unwrap();
        cond.notify(false).unwrap();

        assert_eq!(*join(Some(&waiter)).unwrap().downcast::<u32>().unwrap(), 1);
        assert_eq!(cond.waiters(), 0);
    });
}

#[test]
fn cond_broadcast_wakes_every_waiter() {
    with_default_runtime(|| {
        let mutex = Mutex::new();
        let cond = Cond::new();
        let go = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let (m, c, go) = (mutex.clone(), cond.clone(), Arc::clone(&go));
                spawn(&ThreadAttr::new(), move || {
                    m.acquire().unwrap();
                    while !go.load(Ordering::SeqCst) {
                        c.wait(&m).unwrap();
                    }
                    m.release().unwrap();
                })
                .unwrap()
            })
            .collect();

        yield_now().unwrap();
        assert_eq!(cond.waiters(), 3);
        go.store(true, Ordering::SeqCst);
        cond.notify(true).unwrap();
        for h in &handles {
            join(Some(h)).unwrap();
        }
    });
}

#[test]
fn message_port_delivers_in_order() {
    with_default_runtime(|| {
        let port = MsgPort::new();
        let inbox = port.clone();
        let consumer = spawn(&ThreadAttr::new().name("consumer"), move || {
            (0..3)
                .map(|_| *inbox.get().unwrap().downcast::<u32>().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        yield_now().unwrap();
        assert_eq!(consumer.state(), ThreadState::Waiting);
        for n in [1_u32, 2, 3] {
            port.put(n);
        }
        let got = join(Some(&consumer)).unwrap();
        assert_eq!(*got.downcast::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
        assert!(port.is_empty());
    });
}

#[test]
fn custom_predicate_is_polled_until_true() {
    with_default_runtime(|| {
        let calls = Rc::new(Cell::new(0_u32));
        let counter = Rc::clone(&calls);
        let mut ring = EventRing::new();
        let id = ring.push(Event::func(
            move || {
                counter.set(counter.get() + 1);
                counter.get() >= 3
            },
            Duration::from_millis(5),
        ));
        assert_eq!(wait(&mut ring).unwrap(), 1);
        assert_eq!(ring.status(id), EventStatus::Occurred);
        assert_eq!(calls.get(), 3);
        assert_eq!(ring.occurred().count(), 1);

        ring.reset();
        assert_eq!(ring.status(id), EventStatus::Pending);
    });
}

#[test]
fn termination_event_fires_on_exit() {
    with_default_runtime(|| {
        let t = spawn(&ThreadAttr::new(), || nap(Duration::from_millis(10))).unwrap();
        let mut ring = EventRing::new();
        let id = ring.push(Event::termination(Some(&t), ThreadState::Dead));
        wait(&mut ring).unwrap();
        assert_eq!(ring.status(id), EventStatus::Occurred);
        assert_eq!(t.state(), ThreadState::Dead);
        join(Some(&t)).unwrap();
    });
}
