//! Stackful coroutine infrastructure: guarded mmap'd stacks and the machine
//! context switch.
//!
//! This is the only place where register state and stack pointers change
//! hands. Everything above it (queues, TCBs, events) is plain Rust that runs
//! either before or after a [`coro_switch`], never during one.

use std::cell::RefCell;
use std::io;

// ── CoroStack ────────────────────────────────────────────────────────────────

/// Default usable stack size for spawned threads (256 KiB).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
/// Smallest usable stack size accepted by [`CoroStack::new`].
pub const MIN_STACK_SIZE: usize = 16 * 1024;
/// Canary written at the lowest usable word of every stack.
const STACK_CANARY: u64 = 0xDEAD_DEAD_DEAD_DEAD;

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
}

/// A coroutine stack: `size` usable bytes above one `PROT_NONE` guard page.
///
/// The lowest usable word holds a canary; [`CoroStack::canary_intact`]
/// reports whether a thread has scribbled past the end of its stack without
/// touching the guard page itself.
pub struct CoroStack {
    /// Base of the allocation (guard page starts here).
    base: *mut u8,
    /// Total allocation size (guard + usable).
    alloc_size: usize,
    /// Size of the guard region at `base`.
    guard_size: usize,
}

// SAFETY: The stack memory is exclusively owned by the `CoroStack` and is not
// shared across threads. A stack only changes OS thread while its thread is
// in flight between scheduler instances, during which nothing executes on it.
unsafe impl Send for CoroStack {}

impl CoroStack {
    /// Allocate a new stack with at least `size` usable bytes.
    ///
    /// The size is rounded up to a whole number of pages and raised to
    /// [`MIN_STACK_SIZE`] if smaller.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = size.max(MIN_STACK_SIZE).div_ceil(page) * page;
        let alloc_size = usable + page;

        // SAFETY: We request an anonymous, private mapping with read/write
        // permissions. `fd = -1` and `offset = 0` is the standard incantation
        // for anonymous maps.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `base` is a valid mapping of `alloc_size >= page` bytes. The
        // bottom page becomes inaccessible so running off the stack faults
        // instead of silently corrupting a neighbour.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: `base` / `alloc_size` match the preceding `mmap`.
            unsafe { libc::munmap(base, alloc_size) };
            return Err(err);
        }

        let stack = CoroStack {
            base: base.cast::<u8>(),
            alloc_size,
            guard_size: page,
        };
        stack.arm_canary();
        Ok(stack)
    }

    /// Usable size in bytes (excluding the guard page).
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.alloc_size - self.guard_size
    }

    /// Top of usable stack (stacks grow downward on x86-64 / aarch64).
    #[must_use]
    pub fn top(&self) -> *mut u8 {
        // SAFETY: `base + alloc_size` is one byte past the allocation, which
        // is a valid address for pointer arithmetic (not dereferenced).
        unsafe { self.base.add(self.alloc_size) }
    }

    #[expect(
        clippy::cast_ptr_alignment,
        reason = "the usable region starts on a page boundary"
    )]
    fn canary_slot(&self) -> *mut u64 {
        // SAFETY: `guard_size < alloc_size`, so the slot is the first word of
        // the read/write region.
        unsafe { self.base.add(self.guard_size).cast::<u64>() }
    }

    /// Write the canary at the lowest usable word.
    pub fn arm_canary(&self) {
        // SAFETY: the slot lies inside the writable part of our mapping.
        unsafe { self.canary_slot().write_volatile(STACK_CANARY) };
    }

    /// Whether the canary at the bottom of the stack is still intact.
    #[must_use]
    pub fn canary_intact(&self) -> bool {
        // SAFETY: the slot lies inside the readable part of our mapping.
        unsafe { self.canary_slot().read_volatile() == STACK_CANARY }
    }

    /// Overwrite the canary as a stack overflow would.
    #[cfg(test)]
    pub(crate) fn clobber_canary(&self) {
        // SAFETY: the slot lies inside the writable part of our mapping.
        unsafe { self.canary_slot().write_volatile(0) };
    }
}

impl Drop for CoroStack {
    fn drop(&mut self) {
        // SAFETY: `base` and `alloc_size` correspond to a live `mmap`
        // allocation that has not yet been unmapped.
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.alloc_size);
        }
    }
}

impl std::fmt::Debug for CoroStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroStack")
            .field("base", &self.base)
            .field("alloc_size", &self.alloc_size)
            .finish()
    }
}

// ── Stack pool ───────────────────────────────────────────────────────────────

/// Maximum number of stacks kept in the per-OS-thread pool.
const MAX_POOL_SIZE: usize = 64;

thread_local! {
    /// Per-OS-thread pool recycling default-sized stacks.
    static STACK_POOL: RefCell<Vec<CoroStack>> = const { RefCell::new(Vec::new()) };
}

/// Get a stack of at least `size` bytes, reusing a pooled one when the size
/// matches the default.
pub fn acquire_stack(size: usize) -> io::Result<CoroStack> {
    if size == DEFAULT_STACK_SIZE {
        if let Some(stack) = STACK_POOL.with(|pool| pool.borrow_mut().pop()) {
            stack.arm_canary();
            return Ok(stack);
        }
    }
    CoroStack::new(size)
}

/// Return a stack to the pool for reuse.
///
/// Non-default sizes and stacks beyond the pool capacity are unmapped.
pub fn release_stack(stack: CoroStack) {
    if stack.usable_size() != CoroStack::pooled_usable_size() {
        return;
    }
    STACK_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < MAX_POOL_SIZE {
            pool.push(stack);
        }
    });
}

impl CoroStack {
    fn pooled_usable_size() -> usize {
        let page = page_size();
        DEFAULT_STACK_SIZE.div_ceil(page) * page
    }
}

// ── CoroContext ──────────────────────────────────────────────────────────────

/// Saved CPU registers for a coroutine context switch.
///
/// On x86-64: `rbx, rbp, r12, r13, r14, r15, rsp, rip` (8 × 8 bytes).
///
/// On aarch64: `x19-x28`, `x29` (fp), `x30` (lr), `sp`, `pc` (14 × 8 bytes).
/// The callee-saved SIMD registers `d8-d15` are not stored here; they are
/// declared clobbered by [`coro_switch`] so the compiler spills them.
#[repr(C)]
#[derive(Debug)]
pub struct CoroContext {
    #[cfg(target_arch = "aarch64")]
    regs: [u64; 14],
    #[cfg(not(target_arch = "aarch64"))]
    regs: [u64; 8],
}

impl CoroContext {
    /// Create a zeroed context. It is filled either by [`coro_init`] or by
    /// the first [`coro_switch`] away from it.
    #[must_use]
    pub fn new() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            CoroContext { regs: [0; 14] }
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            CoroContext { regs: [0; 8] }
        }
    }
}

impl Default for CoroContext {
    fn default() -> Self {
        Self::new()
    }
}

// ── Entry trampolines ────────────────────────────────────────────────────────
//
// A fresh context "returns" into the trampoline, which moves the argument
// from a callee-saved register into the first argument register and calls
// the entry function. Entry functions never return.

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl pth_coro_trampoline",
    "pth_coro_trampoline:",
    "mov rdi, r12",
    "call r13",
    "ud2",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl pth_coro_trampoline",
    "pth_coro_trampoline:",
    "mov x0, x19",
    "blr x20",
    "brk #0",
);

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn pth_coro_trampoline();
}

// ── Context switch: x86-64 ──────────────────────────────────────────────────

/// Switch from the current coroutine context to the target.
///
/// Saves callee-saved registers + `rsp` + return address into `from`, then
/// restores the same set from `to` and jumps to its saved `rip`. Returns
/// when some other context switches back into `from`.
///
/// # Safety
///
/// * Both pointers must point to valid, aligned `CoroContext` values.
/// * `to` must have been initialised by [`coro_init`] or saved by an earlier
///   `coro_switch`, and the stack it refers to must still be mapped.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub unsafe fn coro_switch(from: *mut CoroContext, to: *const CoroContext) {
    // SAFETY: Caller guarantees both pointers are valid. The operands are
    // pinned to rdi/rsi so restoring r12-r15 cannot overwrite them. rbx and
    // rbp are saved and restored by hand; everything else the SysV ABI lets
    // a call clobber is declared via `clobber_abi`.
    unsafe {
        std::arch::asm!(
            "mov [rdi + 0*8], rbx",
            "mov [rdi + 1*8], rbp",
            "mov [rdi + 2*8], r12",
            "mov [rdi + 3*8], r13",
            "mov [rdi + 4*8], r14",
            "mov [rdi + 5*8], r15",
            "mov [rdi + 6*8], rsp",
            "lea rax, [rip + 2f]",
            "mov [rdi + 7*8], rax",
            "mov rbx, [rsi + 0*8]",
            "mov rbp, [rsi + 1*8]",
            "mov r12, [rsi + 2*8]",
            "mov r13, [rsi + 3*8]",
            "mov r14, [rsi + 4*8]",
            "mov r15, [rsi + 5*8]",
            "mov rsp, [rsi + 6*8]",
            "jmp qword ptr [rsi + 7*8]",
            "2:",
            in("rdi") from,
            in("rsi") to,
            clobber_abi("C"),
        );
    }
}

/// Switch from the current coroutine context to the target (aarch64).
///
/// # Safety
///
/// Same contract as the x86-64 variant.
#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub unsafe fn coro_switch(from: *mut CoroContext, to: *const CoroContext) {
    // SAFETY: Caller guarantees both pointers are valid. Operands are pinned
    // to x0/x1, which are never restored from the target. x19-x30 and sp are
    // saved by hand. `clobber_abi` covers v0-v31 in full, so the compiler
    // spills d8-d15 around the call.
    // Layout: x19-x28 (regs[0..10]), x29, x30 (regs[10..12]), sp, pc (regs[12..14])
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [x0, #0]",
            "stp x21, x22, [x0, #16]",
            "stp x23, x24, [x0, #32]",
            "stp x25, x26, [x0, #48]",
            "stp x27, x28, [x0, #64]",
            "stp x29, x30, [x0, #80]",
            "mov x9, sp",
            "str x9, [x0, #96]",
            "adr x9, 2f",
            "str x9, [x0, #104]",
            "ldp x19, x20, [x1, #0]",
            "ldp x21, x22, [x1, #16]",
            "ldp x23, x24, [x1, #32]",
            "ldp x25, x26, [x1, #48]",
            "ldp x27, x28, [x1, #64]",
            "ldp x29, x30, [x1, #80]",
            "ldr x9, [x1, #96]",
            "mov sp, x9",
            "ldr x9, [x1, #104]",
            "br x9",
            "2:",
            in("x0") from,
            in("x1") to,
            clobber_abi("C"),
        );
    }
}

/// Fallback for unsupported targets.
///
/// # Safety
///
/// Never safe to call; always panics.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn coro_switch(_from: *mut CoroContext, _to: *const CoroContext) {
    unimplemented!("coro_switch is only implemented for x86_64 and aarch64");
}

/// Initialise a [`CoroContext`] so that switching to it starts executing
/// `entry(arg)` on the given stack.
///
/// # Safety
///
/// * `ctx` must point to a valid, writable `CoroContext`.
/// * `stack_top` must be the page-aligned top of a mapped stack region.
/// * `entry` must never return.
#[cfg(target_arch = "x86_64")]
pub unsafe fn coro_init(
    ctx: *mut CoroContext,
    stack_top: *mut u8,
    entry: unsafe extern "C" fn(*mut u8),
    arg: *mut u8,
) {
    // SAFETY: Caller guarantees `ctx` is writable and `stack_top` is the top
    // of a mapped stack. rsp stays 16-byte aligned so that the trampoline's
    // `call` leaves the callee with the alignment the ABI expects.
    unsafe {
        let sp = stack_top.sub(16);
        (*ctx).regs = [0; 8];
        (*ctx).regs[2] = arg as u64; // r12 = arg
        (*ctx).regs[3] = entry as usize as u64; // r13 = entry
        (*ctx).regs[6] = sp as u64; // rsp
        (*ctx).regs[7] = pth_coro_trampoline as usize as u64; // rip
    }
}

/// Initialise a [`CoroContext`] so that switching to it starts executing
/// `entry(arg)` on the given stack (aarch64).
///
/// # Safety
///
/// Same contract as the x86-64 variant.
#[cfg(target_arch = "aarch64")]
pub unsafe fn coro_init(
    ctx: *mut CoroContext,
    stack_top: *mut u8,
    entry: unsafe extern "C" fn(*mut u8),
    arg: *mut u8,
) {
    // SAFETY: Caller guarantees `ctx` is writable and `stack_top` is the top
    // of a mapped stack; sp stays 16-byte aligned (AAPCS64).
    unsafe {
        let sp = stack_top.sub(16);
        (*ctx).regs = [0; 14];
        (*ctx).regs[0] = arg as u64; // x19 = arg
        (*ctx).regs[1] = entry as usize as u64; // x20 = entry
        (*ctx).regs[12] = sp as u64; // sp
        (*ctx).regs[13] = pth_coro_trampoline as usize as u64; // pc
    }
}

/// Fallback for unsupported targets.
///
/// # Safety
///
/// Never safe to call; always panics.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn coro_init(
    _ctx: *mut CoroContext,
    _stack_top: *mut u8,
    _entry: unsafe extern "C" fn(*mut u8),
    _arg: *mut u8,
) {
    unimplemented!("coro_init is only implemented for x86_64 and aarch64");
}

// ── Tests ────────────────────────────────────────────────────────────────────
