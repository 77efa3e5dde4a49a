//! Thread identity and liveness.
//!
//! Lock owners are identified by the kernel thread ID (`gettid`), not a
//! process-local pointer: the TID is stable for the thread's lifetime and
//! unique machine-wide, so it names an owner unambiguously even when a
//! shared-scope primitive lives in memory mapped by several processes.
//!
//! Robust mutexes additionally need to ask "is this owner still alive?";
//! [`thread_alive`] answers that with a signal-0 probe.

use std::cell::Cell;

/// TID value that never names a real thread.
pub const NO_THREAD: u32 = 0;

thread_local! {
    static CACHED_TID: Cell<u32> = const { Cell::new(NO_THREAD) };
}

/// Kernel thread ID of the calling thread, cached after the first call.
#[cfg(target_os = "linux")]
pub fn thread_id() -> u32 {
    CACHED_TID.with(|slot| {
        let existing = slot.get();
        if existing != NO_THREAD {
            return existing;
        }
        // SAFETY: gettid takes no arguments and cannot fail.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        slot.set(tid);
        tid
    })
}

/// Fallback identity for non-Linux hosts: a monotonically assigned ID.
#[cfg(not(target_os = "linux"))]
pub fn thread_id() -> u32 {
    use core::sync::atomic::{AtomicU32, Ordering};
    static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

    CACHED_TID.with(|slot| {
        let existing = slot.get();
        if existing != NO_THREAD {
            return existing;
        }
        let tid = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        slot.set(tid);
        tid
    })
}

/// Whether the thread named by `tid` still exists.
///
/// Probes with `tkill(tid, 0)`: signal 0 performs permission and existence
/// checks without delivering anything. `ESRCH` means the thread is gone;
/// `EPERM` means it exists but belongs to another credential domain, which
/// still counts as alive.
#[cfg(target_os = "linux")]
pub fn thread_alive(tid: u32) -> bool {
    if tid == NO_THREAD {
        return false;
    }
    // SAFETY: tkill with signal 0 delivers nothing; arguments are plain ints.
    let rc = unsafe { libc::syscall(libc::SYS_tkill, tid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Non-Linux hosts cannot probe; report alive so robust detection degrades
/// to ordinary blocking rather than false owner-death reports.
#[cfg(not(target_os = "linux"))]
pub fn thread_alive(tid: u32) -> bool {
    tid != NO_THREAD
}
