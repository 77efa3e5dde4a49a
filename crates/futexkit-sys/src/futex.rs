//! Futex wait/wake wrappers.
//!
//! The kernel primitive underneath every blocking operation in futexkit:
//! atomically block while a 32-bit word holds an expected value, and wake a
//! bounded number of threads blocked on that word. On Linux this is the
//! `futex(2)` syscall; elsewhere a yield-based emulation keeps the crate
//! usable for development.
//!
//! Waiters and wakers must agree on the [`Scope`]: private-scope waits use
//! `FUTEX_PRIVATE_FLAG` (cheaper, keyed by virtual address), shared-scope
//! waits omit it so a word placed in memory mapped by several processes
//! queues waiters from all of them.

use core::sync::atomic::AtomicU32;

use crate::clock::Deadline;

/// Sharing scope of a futex word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Word is only ever touched by threads of this process.
    #[default]
    Private,
    /// Word may live in memory mapped by multiple processes.
    Shared,
}

/// Why a futex wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A waker woke us (or the kernel woke us spuriously).
    Woken,
    /// The word no longer held the expected value; we never slept.
    Mismatch,
    /// The absolute deadline elapsed.
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
}

#[cfg(target_os = "linux")]
fn wait_op(scope: Scope) -> libc::c_int {
    match scope {
        Scope::Private => libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
        Scope::Shared => libc::FUTEX_WAIT,
    }
}

#[cfg(target_os = "linux")]
fn wake_op(scope: Scope) -> libc::c_int {
    match scope {
        Scope::Private => libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
        Scope::Shared => libc::FUTEX_WAKE,
    }
}

/// Block while `*word == expected`, without a deadline.
///
/// Returns [`WaitOutcome::Mismatch`] without sleeping if the word already
/// differs, [`WaitOutcome::Interrupted`] on signal delivery. Callers are
/// expected to re-check their predicate and loop on either.
pub fn wait(word: &AtomicU32, expected: u32, scope: Scope) -> WaitOutcome {
    wait_until(word, expected, None, scope)
}

/// Block while `*word == expected`, up to an optional absolute deadline.
///
/// The remaining time is recomputed from the deadline on entry, so callers
/// looping around spurious wakeups do not accumulate drift.
#[cfg(target_os = "linux")]
pub fn wait_until(
    word: &AtomicU32,
    expected: u32,
    deadline: Option<&Deadline>,
    scope: Scope,
) -> WaitOutcome {
    let timeout_storage;
    let timeout_ptr: *const libc::timespec = match deadline {
        Some(deadline) => {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            timeout_storage = libc::timespec {
                tv_sec: remaining.as_secs() as libc::time_t,
                // Always below 1e9; lossless even where c_long is 32-bit.
                tv_nsec: remaining.subsec_nanos() as libc::c_long,
            };
            &timeout_storage
        }
        None => std::ptr::null(),
    };

    // SAFETY: Linux futex syscall with a valid userspace word address and
    // either a null or stack-valid timeout pointer.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            wait_op(scope),
            expected,
            timeout_ptr,
        )
    };
    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error().unwrap_or(0) {
        libc::EAGAIN => WaitOutcome::Mismatch,
        libc::EINTR => WaitOutcome::Interrupted,
        libc::ETIMEDOUT => WaitOutcome::TimedOut,
        _ => WaitOutcome::Woken,
    }
}

/// Yield-based emulation for non-Linux hosts.
#[cfg(not(target_os = "linux"))]
pub fn wait_until(
    word: &AtomicU32,
    expected: u32,
    deadline: Option<&Deadline>,
    _scope: Scope,
) -> WaitOutcome {
    use core::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) != expected {
        return WaitOutcome::Mismatch;
    }
    loop {
        std::thread::yield_now();
        if word.load(Ordering::Acquire) != expected {
            return WaitOutcome::Woken;
        }
        if let Some(deadline) = deadline
            && deadline.has_expired()
        {
            return WaitOutcome::TimedOut;
        }
    }
}

/// Wake up to `count` threads blocked on `word`. Returns how many were woken.
#[cfg(target_os = "linux")]
pub fn wake(word: &AtomicU32, count: u32, scope: Scope) -> usize {
    // SAFETY: Linux futex syscall with a valid userspace word address.
    let woken = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            wake_op(scope),
            count,
        )
    };
    if woken > 0 { woken as usize } else { 0 }
}

#[cfg(not(target_os = "linux"))]
pub fn wake(_word: &AtomicU32, _count: u32, _scope: Scope) -> usize {
    // Emulated waiters poll the word; nothing to do.
    0
}

/// Wake every thread blocked on `word`.
pub fn wake_all(word: &AtomicU32, scope: Scope) -> usize {
    // The kernel reads the count as a signed int, so u32::MAX would be -1.
    wake(word, i32::MAX as u32, scope)
}
