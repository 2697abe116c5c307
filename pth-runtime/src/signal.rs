//! Signal plumbing for the scheduler.
//!
//! Scheduler instances run with every signal blocked. Signals a waiting
//! thread cares about are unblocked only for the duration of the event
//! manager's `ppoll`, with a temporary handler that writes the signal number
//! into the instance's private self-pipe. That keeps the blocking call
//! prompt without ever running user signal handlers on the scheduler stack.
//!
//! # Safety Design
//!
//! The handler is async-signal-safe: it only reads atomics from a static
//! table and calls `write(2)`. No allocation, locking or TLS access.

use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Highest signal number tracked by the runtime.
pub const MAX_SIGNAL: i32 = 64;

// ── SigSet ──────────────────────────────────────────────────────────────

/// Owned `sigset_t` with the handful of operations the runtime needs.
#[derive(Clone, Copy)]
pub struct SigSet(libc::sigset_t);

impl SigSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        let mut raw = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset fully initialises the set it is given.
        unsafe {
            libc::sigemptyset(raw.as_mut_ptr());
            SigSet(raw.assume_init())
        }
    }

    /// The set of all signals.
    #[must_use]
    pub fn full() -> Self {
        let mut raw = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigfillset fully initialises the set it is given.
        unsafe {
            libc::sigfillset(raw.as_mut_ptr());
            SigSet(raw.assume_init())
        }
    }

    /// Signals currently pending for the calling OS thread or the process.
    #[must_use]
    pub fn pending() -> Self {
        let mut set = Self::empty();
        // SAFETY: `set.0` is a valid, initialised sigset_t.
        unsafe { libc::sigpending(&mut set.0) };
        set
    }

    /// The calling OS thread's current signal mask.
    #[must_use]
    pub fn current_mask() -> Self {
        let mut set = Self::empty();
        // SAFETY: a null `set` argument only queries the mask.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &mut set.0) };
        set
    }

    /// Build a set from a bitmask where bit `n - 1` stands for signal `n`.
    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        let mut set = Self::empty();
        for sig in 1..=MAX_SIGNAL {
            if bits & signal_bit(sig) != 0 {
                set.add(sig);
            }
        }
        set
    }

    /// Bitmask form of the set (signals above [`MAX_SIGNAL`] are dropped).
    #[must_use]
    pub fn bits(&self) -> u64 {
        self.iter().fold(0, |acc, sig| acc | signal_bit(sig))
    }

    pub fn add(&mut self, sig: i32) {
        // SAFETY: `self.0` is initialised; invalid numbers are rejected by libc.
        unsafe { libc::sigaddset(&mut self.0, sig) };
    }

    pub fn remove(&mut self, sig: i32) {
        // SAFETY: as above.
        unsafe { libc::sigdelset(&mut self.0, sig) };
    }

    #[must_use]
    pub fn contains(&self, sig: i32) -> bool {
        // SAFETY: `self.0` is initialised.
        unsafe { libc::sigismember(&self.0, sig) == 1 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Members of the set in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (1..=MAX_SIGNAL).filter(|&sig| self.contains(sig))
    }

    /// Remove every member of `other` from `self`.
    pub fn subtract(&mut self, other: &SigSet) {
        for sig in other.iter() {
            self.remove(sig);
        }
    }

    pub(crate) fn as_raw(&self) -> *const libc::sigset_t {
        &self.0
    }
}

impl Default for SigSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for SigSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<i32> for SigSet {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        let mut set = Self::empty();
        for sig in iter {
            set.add(sig);
        }
        set
    }
}

/// Bit used for `sig` in pending-signal masks.
#[must_use]
pub(crate) fn signal_bit(sig: i32) -> u64 {
    match u32::try_from(sig) {
        Ok(n @ 1..=64) => 1u64 << (n - 1),
        _ => 0,
    }
}

/// Whether `sig` is a signal number the runtime can track (`1..=64`).
#[must_use]
pub fn is_valid_signal(sig: i32) -> bool {
    (1..=MAX_SIGNAL).contains(&sig)
}

// ── Masks ───────────────────────────────────────────────────────────────

/// Block every signal on the calling OS thread, returning the old mask.
pub(crate) fn block_all() -> SigSet {
    let full = SigSet::full();
    let mut old = SigSet::empty();
    // SAFETY: both sets are valid sigset_t values.
    unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, full.as_raw(), &mut old.0) };
    old
}

/// Replace the calling OS thread's signal mask.
pub(crate) fn set_mask(mask: &SigSet) {
    // SAFETY: `mask` is a valid sigset_t; the old mask is discarded.
    unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, mask.as_raw(), ptr::null_mut()) };
}

// ── Queries and delivery ────────────────────────────────────────────────

fn current_action(sig: i32) -> Option<libc::sighandler_t> {
    let mut old = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null `act` only queries the disposition into `old`.
    let rc = unsafe { libc::sigaction(sig, ptr::null(), old.as_mut_ptr()) };
    // SAFETY: sigaction succeeded, so `old` was written.
    (rc == 0).then(|| unsafe { old.assume_init() }.sa_sigaction)
}

/// Whether the process-wide disposition of `sig` is `SIG_IGN`.
#[must_use]
pub fn is_ignored(sig: i32) -> bool {
    current_action(sig) == Some(libc::SIG_IGN)
}

/// Whether `sig` still has its default disposition.
#[must_use]
pub fn has_default_action(sig: i32) -> bool {
    current_action(sig) == Some(libc::SIG_DFL)
}

/// Accept a pending instance of `sig` without running any handler.
///
/// Only meaningful while `sig` is blocked on the calling OS thread.
pub(crate) fn consume_pending(sig: i32) -> bool {
    let mut set = SigSet::empty();
    set.add(sig);
    let zero = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `set` and `zero` are valid for the duration of the call; a
    // null info pointer is permitted.
    unsafe { libc::sigtimedwait(set.as_raw(), ptr::null_mut(), &zero) == sig }
}

/// Make `sig` pending for the calling OS thread.
pub(crate) fn raise_in_thread(sig: i32) -> io::Result<()> {
    // SAFETY: pthread_self always names the calling thread.
    let rc = unsafe { libc::pthread_kill(libc::pthread_self(), sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Send `sig` to the whole process.
pub(crate) fn raise_in_process(sig: i32) {
    // SAFETY: kill(getpid()) has no memory-safety preconditions.
    unsafe { libc::kill(libc::getpid(), sig) };
}

// ── Self-pipe catchers ──────────────────────────────────────────────────

/// Number of concurrently registered catchers (one per scheduler instance).
const CATCHER_SLOTS: usize = 128;

struct CatcherSlot {
    fd: AtomicI32,
    mask: AtomicU64,
}

#[expect(
    clippy::declare_interior_mutable_const,
    reason = "used only as an array initialiser"
)]
const EMPTY_SLOT: CatcherSlot = CatcherSlot {
    fd: AtomicI32::new(-1),
    mask: AtomicU64::new(0),
};

static CATCHERS: [CatcherSlot; CATCHER_SLOTS] = [EMPTY_SLOT; CATCHER_SLOTS];

extern "C" fn catch_signal(sig: libc::c_int) {
    let bit = signal_bit(sig);
    let byte = u8::try_from(sig).unwrap_or(0);
    for slot in &CATCHERS {
        if slot.mask.load(Ordering::Acquire) & bit == 0 {
            continue;
        }
        let fd = slot.fd.load(Ordering::Acquire);
        if fd >= 0 {
            // SAFETY: write(2) is async-signal-safe; a full or closed pipe
            // just drops the byte, which is harmless for a wake-up channel.
            unsafe { libc::write(fd, (&raw const byte).cast(), 1) };
        }
    }
}

/// A registered self-pipe write end in the process-wide catcher table.
///
/// Unregisters on drop.
#[derive(Debug)]
pub(crate) struct Catcher {
    index: usize,
}

impl Catcher {
    /// Claim a free slot for `fd`.
    pub(crate) fn register(fd: libc::c_int) -> Option<Catcher> {
        CATCHERS.iter().enumerate().find_map(|(index, slot)| {
            slot.fd
                .compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Relaxed)
                .ok()
                .map(|_| Catcher { index })
        })
    }

    /// Set which signals this catcher is interested in.
    pub(crate) fn watch(&self, set: &SigSet) {
        CATCHERS[self.index]
            .mask
            .store(set.bits(), Ordering::Release);
    }
}

impl Drop for Catcher {
    fn drop(&mut self) {
        let slot = &CATCHERS[self.index];
        slot.mask.store(0, Ordering::Release);
        slot.fd.store(-1, Ordering::Release);
    }
}

/// Dispositions replaced by [`install_catchers`], restored on drop.
pub(crate) struct InstalledCatchers {
    saved: Vec<(i32, libc::sigaction)>,
}

/// Point every signal in `set` at the self-pipe handler.
///
/// `SIGKILL` and `SIGSTOP` cannot be caught and are skipped.
pub(crate) fn install_catchers(set: &SigSet) -> InstalledCatchers {
    let mut saved = Vec::new();
    for sig in set.iter() {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        // SAFETY: zeroed is a valid initial sigaction; every field we rely
        // on is set explicitly below.
        let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
        act.sa_sigaction = catch_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        act.sa_flags = libc::SA_RESTART;
        // SAFETY: `act.sa_mask` is a valid sigset_t inside `act`.
        unsafe { libc::sigfillset(&mut act.sa_mask) };
        let mut old = MaybeUninit::<libc::sigaction>::zeroed();
        // SAFETY: both pointers are valid for the call.
        if unsafe { libc::sigaction(sig, &act, old.as_mut_ptr()) } == 0 {
            // SAFETY: sigaction succeeded, so `old` was written.
            saved.push((sig, unsafe { old.assume_init() }));
        }
    }
    InstalledCatchers { saved }
}

impl Drop for InstalledCatchers {
    fn drop(&mut self) {
        for (sig, old) in self.saved.drain(..).rev() {
            // SAFETY: `old` is the disposition sigaction returned earlier.
            unsafe { libc::sigaction(sig, &old, ptr::null_mut()) };
        }
    }
}
