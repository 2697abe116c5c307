//! Thread lifecycle: dispatch order, aging, join, suspend/resume, control
//! queries, cancellation, cleanup handlers and thread-specific values.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use common::with_default_runtime;
use pth_runtime::{
    cancel, cleanup_pop, cleanup_push, ctrl, exit, join, nap, once, raise, resume, self_handle,
    set_specific, spawn, suspend, thread_exists, with_specific, yield_now, yield_to, Canceled, Ctrl,
    CtrlReply, Key, Once, PthError, QueueSet, ThreadAttr, ThreadHandle, ThreadState, PRIO_MAX,
    PRIO_MIN,
};

fn named(name: &str) -> ThreadAttr {
    ThreadAttr::new().name(name)
}

// ── Scheduling order ─────────────────────────────────────────────────────

#[test]
fn equal_priority_threads_run_in_spawn_order() {
    let log = with_default_runtime(|| {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let log = Arc::clone(&log);
                spawn(&named(name), move || {
                    log.lock().unwrap().push(name);
                    yield_now().unwrap();
                    log.lock().unwrap().push(name);
                })
                .unwrap()
            })
            .collect();
        for h in &handles {
            join(Some(h)).unwrap();
        }
        let log = log.lock().unwrap().clone();
        log
    });
    assert_eq!(log, vec!["a", "b", "c", "a", "b", "c"]);
}

#[test]
fn aging_lets_a_low_priority_thread_through() {
    let iterations = with_default_runtime(|| {
        assert_eq!(ctrl(Ctrl::FavourNew(false)).unwrap(), CtrlReply::FavourNew(true));
        let ran = Arc::new(AtomicBool::new(false));

        let low_ran = Arc::clone(&ran);
        let low = spawn(&named("low").priority(PRIO_MIN), move || {
            yield_now().unwrap();
            low_ran.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let high_sees = Arc::clone(&ran);
        let high = spawn(&named("high").priority(PRIO_MAX), move || {
            let mut iterations = 0_usize;
            while !high_sees.load(Ordering::SeqCst) && iterations < 10_000 {
                spawn(&ThreadAttr::new().priority(PRIO_MAX).joinable(false), || ()).unwrap();
                yield_now().unwrap();
                iterations += 1;
            }
            iterations
        })
        .unwrap();

        let iterations = *join(Some(&high)).unwrap().downcast::<usize>().unwrap();
        join(Some(&low)).unwrap();
        iterations
    });
    assert!(iterations < 200, "low-priority thread waited {iterations} iterations");
}

#[test]
fn yield_to_prefers_the_named_thread() {
    let log = with_default_runtime(|| {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mk = |name: &'static str| {
            let log = Arc::clone(&log);
            spawn(&named(name), move || log.lock().unwrap().push(name)).unwrap()
        };
        let first = mk("first");
        let second = mk("second");
        yield_to(Some(&second)).unwrap();
        join(Some(&first)).unwrap();
        join(Some(&second)).unwrap();
        let log = log.lock().unwrap().clone();
        log
    });
    assert_eq!(log.first(), Some(&"second"));
}

#[test]
fn yield_to_a_waiting_thread_is_rejected() {
    with_default_runtime(|| {
        let sleeper = spawn(&named("sleeper"), || nap(Duration::from_secs(30))).unwrap();
        yield_now().unwrap();
        assert_eq!(sleeper.state(), ThreadState::Waiting);
        assert!(matches!(
            yield_to(Some(&sleeper)),
            Err(PthError::InvalidArgument(_))
        ));
        cancel(&sleeper).unwrap();
        join(Some(&sleeper)).unwrap();
    });
}

// ── Join ─────────────────────────────────────────────────────────────────

#[test]
fn join_hands_out_the_value_exactly_once() {
    with_default_runtime(|| {
        let t = spawn(&named("seven"), || 7_u32).unwrap();
        let value = join(Some(&t)).unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 7);
        assert_eq!(t.state(), ThreadState::Joined);
        assert!(!thread_exists(&t));
        assert!(matches!(join(Some(&t)), Err(PthError::InvalidArgument(_))));
    });
}

#[test]
fn join_returns_once_an_immediate_exit_is_seen() {
    with_default_runtime(|| {
        for _ in 0..10 {
            let t = spawn(&named("brief"), || 7_u8).unwrap();
            assert_eq!(*join(Some(&t)).unwrap().downcast::<u8>().unwrap(), 7);
        }
        let t = spawn(&named("brief"), || 8_u8).unwrap();
        assert_eq!(*join(None).unwrap().downcast::<u8>().unwrap(), 8);
        assert_eq!(t.state(), ThreadState::Joined);
    });
}

#[test]
fn joining_oneself_or_nobody_would_deadlock() {
    with_default_runtime(|| {
        let me = self_handle().unwrap();
        assert!(matches!(join(Some(&me)), Err(PthError::WouldDeadlock)));
        assert!(matches!(join(None), Err(PthError::WouldDeadlock)));
    });
}

#[test]
fn detached_threads_cannot_be_joined() {
    with_default_runtime(|| {
        let t = spawn(&ThreadAttr::new().joinable(false), || ()).unwrap();
        assert!(!t.is_joinable());
        assert!(matches!(join(Some(&t)), Err(PthError::InvalidArgument(_))));
        yield_now().unwrap();
        assert!(!thread_exists(&t));
    });
}

#[test]
fn join_any_collects_every_thread() {
    let mut values = with_default_runtime(|| {
        for n in 1..=3_i32 {
            spawn(&ThreadAttr::new(), move || n * 10).unwrap();
        }
        let values: Vec<i32> = (0..3)
            .map(|_| *join(None).unwrap().downcast::<i32>().unwrap())
            .collect();
        assert!(matches!(join(None), Err(PthError::WouldDeadlock)));
        values
    });
    values.sort_unstable();
    assert_eq!(values, vec![10, 20, 30]);
}

#[test]
fn explicit_exit_sets_the_value() {
    with_default_runtime(|| {
        let t = spawn(&named("quitter"), || {
            exit("early");
        })
        .unwrap();
        let value = join(Some(&t)).unwrap();
        assert_eq!(*value.downcast::<&str>().unwrap(), "early");
    });
}

fn explode() -> u8 {
    panic!("boom")
}

#[test]
fn a_panic_becomes_the_exit_value() {
    with_default_runtime(|| {
        let t = spawn(&named("panicky"), explode).unwrap();
        let value = join(Some(&t)).unwrap();
        assert_eq!(*value.downcast::<&str>().unwrap(), "boom");
    });
}

// ── Suspend / resume ─────────────────────────────────────────────────────

#[test]
fn suspended_threads_do_not_run_until_resumed() {
    with_default_runtime(|| {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let t = spawn(&named("parked"), move || flag.store(true, Ordering::SeqCst)).unwrap();

        suspend(&t).unwrap();
        assert_eq!(t.state(), ThreadState::Suspended);
        assert_eq!(ctrl(Ctrl::Count(QueueSet::SUSPENDED)).unwrap(), CtrlReply::Count(1));
        yield_now().unwrap();
        assert!(!ran.load(Ordering::SeqCst));

        assert!(matches!(suspend(&t), Err(PthError::InvalidArgument(_))));
        resume(&t).unwrap();
        assert_eq!(t.state(), ThreadState::New);
        join(Some(&t)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    });
}

#[test]
fn suspending_oneself_is_denied() {
    with_default_runtime(|| {
        let me = self_handle().unwrap();
        assert!(matches!(suspend(&me), Err(PthError::PermissionDenied(_))));
        assert!(matches!(resume(&me), Err(PthError::PermissionDenied(_))));
    });
}

// ── Control queries ──────────────────────────────────────────────────────

#[test]
fn ctrl_reports_queues_and_threads() {
    with_default_runtime(|| {
        let a = spawn(&named("alpha").priority(3), || ()).unwrap();
        let b = spawn(&named("beta"), || ()).unwrap();

        assert_eq!(ctrl(Ctrl::Count(QueueSet::NEW)).unwrap(), CtrlReply::Count(2));
        assert_eq!(
            ctrl(Ctrl::Count(QueueSet::NEW | QueueSet::RUNNING)).unwrap(),
            CtrlReply::Count(3)
        );
        assert_eq!(ctrl(Ctrl::TotalThreads).unwrap(), CtrlReply::Count(3));
        assert_eq!(ctrl(Ctrl::Priority(&a)).unwrap(), CtrlReply::Priority(3));
        assert_eq!(ctrl(Ctrl::Name(&b)).unwrap(), CtrlReply::Name("beta".to_owned()));
        assert_eq!(ctrl(Ctrl::SchedulerId).unwrap(), CtrlReply::SchedulerId(0));
        assert_eq!(ctrl(Ctrl::SchedulerCount).unwrap(), CtrlReply::Count(1));
        assert!(matches!(ctrl(Ctrl::AverageLoad).unwrap(), CtrlReply::Load(_)));

        let CtrlReply::Dump(dump) = ctrl(Ctrl::DumpState).unwrap() else {
            panic!("expected a dump");
        };
        assert!(dump.contains("alpha"));
        assert!(dump.contains("beta"));

        join(Some(&a)).unwrap();
        join(Some(&b)).unwrap();
        assert_eq!(ctrl(Ctrl::TotalThreads).unwrap(), CtrlReply::Count(1));
    });
}

fn queue_of(state: ThreadState) -> QueueSet {
    match state {
        ThreadState::New => QueueSet::NEW,
        ThreadState::Ready => QueueSet::READY,
        ThreadState::Running => QueueSet::RUNNING,
        ThreadState::Waiting => QueueSet::WAITING,
        ThreadState::Suspended => QueueSet::SUSPENDED,
        ThreadState::Dead => QueueSet::DEAD,
        _ => QueueSet::empty(),
    }
}

/// Every queue holds exactly the threads whose state names it.
fn assert_queues_match_states(threads: &[&ThreadHandle]) {
    for flag in QueueSet::all().iter() {
        let expected = threads.iter().filter(|h| queue_of(h.state()) == flag).count();
        assert_eq!(
            ctrl(Ctrl::Count(flag)).unwrap(),
            CtrlReply::Count(expected),
            "queue {flag:?}"
        );
    }
}

#[test]
fn queue_membership_follows_thread_state() {
    with_default_runtime(|| {
        let stop = Arc::new(AtomicBool::new(false));
        let spin = |stop: &Arc<AtomicBool>| {
            let stop = Arc::clone(stop);
            move || {
                while !stop.load(Ordering::SeqCst) {
                    yield_now().unwrap();
                }
            }
        };
        let me = self_handle().unwrap();
        let sleeper = spawn(&named("sleeper"), || nap(Duration::from_secs(30))).unwrap();
        let spinner = spawn(&named("spinner"), spin(&stop)).unwrap();
        let parked = spawn(&named("parked"), spin(&stop)).unwrap();
        let brief = spawn(&named("brief"), || ()).unwrap();
        let all = [&me, &sleeper, &spinner, &parked, &brief];
        assert_queues_match_states(&all);

        for _ in 0..100 {
            if sleeper.state() == ThreadState::Waiting
                && brief.state() == ThreadState::Dead
                && spinner.state() == ThreadState::Ready
                && parked.state() == ThreadState::Ready
            {
                break;
            }
            yield_now().unwrap();
        }
        assert_eq!(sleeper.state(), ThreadState::Waiting);
        assert_eq!(brief.state(), ThreadState::Dead);
        assert_queues_match_states(&all);

        suspend(&parked).unwrap();
        assert_queues_match_states(&all);
        resume(&parked).unwrap();
        join(Some(&brief)).unwrap();
        assert_queues_match_states(&all);

        cancel(&sleeper).unwrap();
        stop.store(true, Ordering::SeqCst);
        for t in [&sleeper, &spinner, &parked] {
            join(Some(t)).unwrap();
        }
        assert_queues_match_states(&all);
    });
}

#[test]
fn out_of_range_priority_is_rejected() {
    with_default_runtime(|| {
        let attr = ThreadAttr::new().priority(PRIO_MAX + 1);
        assert!(matches!(spawn(&attr, || ()), Err(PthError::InvalidArgument(_))));
    });
}

// ── Cancellation ─────────────────────────────────────────────────────────

#[test]
fn cancel_wakes_a_napping_thread() {
    with_default_runtime(|| {
        let t = spawn(&named("napper"), || nap(Duration::from_secs(30))).unwrap();
        yield_now().unwrap();
        cancel(&t).unwrap();
        let value = join(Some(&t)).unwrap();
        assert!(value.downcast_ref::<Canceled>().is_some());
        assert!(matches!(cancel(&t), Err(PthError::PermissionDenied(_))));
    });
}

#[test]
fn cancellation_can_be_deferred() {
    with_default_runtime(|| {
        let t = spawn(&named("stubborn"), || {
            assert!(pth_runtime::set_cancel_enabled(false).unwrap());
            nap(Duration::from_millis(20)).unwrap();
            pth_runtime::set_cancel_enabled(true).unwrap();
            pth_runtime::test_cancel();
            "not canceled"
        })
        .unwrap();
        yield_now().unwrap();
        cancel(&t).unwrap();
        let value = join(Some(&t)).unwrap();
        assert!(value.downcast_ref::<Canceled>().is_some());
    });
}

// ── Exit hooks ───────────────────────────────────────────────────────────

#[test]
fn cleanup_handlers_run_newest_first() {
    let log = with_default_runtime(|| {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner = Arc::clone(&log);
        let t = spawn(&named("tidy"), move || {
            for tag in ["first", "second", "dropped"] {
                let log = Arc::clone(&inner);
                cleanup_push(move || log.lock().unwrap().push(tag)).unwrap();
            }
            assert!(cleanup_pop(false).unwrap());
        })
        .unwrap();
        join(Some(&t)).unwrap();
        let log = log.lock().unwrap().clone();
        log
    });
    assert_eq!(log, vec!["second", "first"]);
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn thread_specific_values_are_private_and_dropped_at_exit() {
    with_default_runtime(|| {
        let counter: Arc<Key<u32>> = Arc::new(Key::new());
        let flag_key: Arc<Key<DropFlag>> = Arc::new(Key::new());
        let dropped = Arc::new(AtomicBool::new(false));

        let (k, fk, d) = (Arc::clone(&counter), Arc::clone(&flag_key), Arc::clone(&dropped));
        let t = spawn(&named("owner"), move || {
            assert_eq!(set_specific(&k, 1).unwrap(), None);
            set_specific(&fk, DropFlag(d)).unwrap();
            yield_now().unwrap();
            with_specific(&k, |v| {
                let v = v.unwrap();
                *v += 1;
                *v
            })
            .unwrap()
        })
        .unwrap();

        assert!(with_specific(&counter, |v| v.is_none()).unwrap());
        let value = join(Some(&t)).unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 2);
        assert!(dropped.load(Ordering::SeqCst));
    });
}

static INIT_ONCE: Once = Once::new();
static INIT_RUNS: AtomicUsize = AtomicUsize::new(0);

#[test]
fn once_runs_its_initialiser_a_single_time() {
    with_default_runtime(|| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                spawn(&ThreadAttr::new(), || {
                    once(&INIT_ONCE, || {
                        INIT_RUNS.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                })
                .unwrap()
            })
            .collect();
        for h in &handles {
            join(Some(h)).unwrap();
        }
        assert!(INIT_ONCE.is_completed());
        assert_eq!(INIT_RUNS.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn raise_zero_only_checks_existence() {
    with_default_runtime(|| {
        let t = spawn(&named("target"), || nap(Duration::from_secs(30))).unwrap();
        yield_now().unwrap();
        raise(&t, 0).unwrap();
        assert!(matches!(raise(&t, 4096), Err(PthError::InvalidArgument(_))));
        cancel(&t).unwrap();
        join(Some(&t)).unwrap();
        assert!(matches!(raise(&t, 0), Err(PthError::NotFound)));
    });
}
