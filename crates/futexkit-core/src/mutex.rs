//! Blocking mutual exclusion over a futex word.
//!
//! The lock state is a single 32-bit word: 0 = unlocked, 1 = locked with no
//! waiters, 2 = locked with (possible) waiters. The uncontended paths are a
//! single compare-and-swap each; the kernel is only entered when a lock is
//! contended or a contended lock is released.
//!
//! ## Variants
//!
//! - **Normal**: no ownership checks on the fast path. Relocking by the
//!   owner deadlocks; unlocking from a non-owning thread is undefined.
//! - **Recursive**: the owner may relock; the mutex is released when the
//!   recursion depth returns to zero.
//! - **ErrorCheck**: relock, unlock-without-ownership, and
//!   destroy-while-locked are reported as [`SyncError::Misuse`] instead of
//!   undefined behavior.
//! - **Robust** (orthogonal flag): a lock attempt that finds the recorded
//!   owner dead marks the mutex inconsistent and reports
//!   [`SyncError::OwnerDied`]. Every subsequent lock attempt keeps failing
//!   the same way until [`Mutex::make_consistent`] resets the mutex.
//!
//! All state lives in plain atomics and the type is `#[repr(C)]`, so a
//! [`Scope::Shared`] instance placed in memory mapped by several processes
//! has one layout everywhere and behaves identically; owners are named by
//! kernel TID, which stays meaningful across address spaces.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futexkit_sys::thread_id::NO_THREAD;
use futexkit_sys::{Deadline, Scope, WaitOutcome, futex, thread_alive, thread_id};

use crate::error::{Result, SyncError};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const FLAG_INCONSISTENT: u32 = 1 << 0;
const FLAG_DESTROYED: u32 = 1 << 1;

/// How often a blocked robust-mutex waiter re-probes owner liveness.
/// A dead owner never calls unlock, so parked waiters cannot rely on a wake.
const ROBUST_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Contention event counters
// ---------------------------------------------------------------------------

static LOCK_SPIN_EVENTS: AtomicU64 = AtomicU64::new(0);
static LOCK_WAIT_EVENTS: AtomicU64 = AtomicU64::new(0);
static UNLOCK_WAKE_EVENTS: AtomicU64 = AtomicU64::new(0);

/// Test hook: reset the process-wide contention counters.
#[doc(hidden)]
pub fn mutex_reset_event_counters_for_tests() {
    LOCK_SPIN_EVENTS.store(0, Ordering::Relaxed);
    LOCK_WAIT_EVENTS.store(0, Ordering::Relaxed);
    UNLOCK_WAKE_EVENTS.store(0, Ordering::Relaxed);
}

/// Test hook: snapshot (spin, wait, wake) contention counters.
#[doc(hidden)]
#[must_use]
pub fn mutex_event_counters_for_tests() -> (u64, u64, u64) {
    (
        LOCK_SPIN_EVENTS.load(Ordering::Relaxed),
        LOCK_WAIT_EVENTS.load(Ordering::Relaxed),
        UNLOCK_WAKE_EVENTS.load(Ordering::Relaxed),
    )
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Behavioral variant of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// No error checking, no recursion. The default.
    #[default]
    Normal,
    /// The owning thread may relock without deadlocking.
    Recursive,
    /// Contract violations are reported instead of being undefined.
    ErrorCheck,
}

/// Priority protocol requested for a mutex.
///
/// With [`Protocol::Inherit`] the mutex exposes the current owner's TID via
/// [`Mutex::owner`]; the actual priority boost is the scheduler's business,
/// not this crate's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// No priority interaction.
    #[default]
    None,
    /// Priority inheritance: owner identity is exposed for boosting.
    Inherit,
    /// Priority ceiling. Not supported; construction fails with `Invalid`.
    Protect,
}

/// Construction-time attributes, defaulting to a private normal mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexAttributes {
    pub kind: MutexKind,
    pub robust: bool,
    pub scope: Scope,
    pub protocol: Protocol,
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// A futex-backed blocking mutex. See the module docs for variant behavior.
#[derive(Debug)]
#[repr(C)]
pub struct Mutex {
    /// 0 unlocked / 1 locked / 2 contended. This is the futex word.
    state: AtomicU32,
    /// Kernel TID of the owner, `NO_THREAD` while unlocked.
    owner: AtomicU32,
    /// Recursion depth. Written only by the owner.
    depth: AtomicU32,
    /// Inconsistent / destroyed flags.
    flags: AtomicU32,
    kind: MutexKind,
    robust: bool,
    scope: Scope,
    protocol: Protocol,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// A private, normal, non-robust mutex (the historical static-initializer
    /// default configuration).
    #[must_use]
    pub fn new() -> Self {
        Self::with_attributes(MutexAttributes::default())
            .unwrap_or_else(|_| unreachable!("default attributes are always valid"))
    }

    /// A mutex with explicit attributes.
    ///
    /// Fails with [`SyncError::Invalid`] for unsupported attribute
    /// combinations (currently [`Protocol::Protect`]).
    pub fn with_attributes(attrs: MutexAttributes) -> Result<Self> {
        if attrs.protocol == Protocol::Protect {
            return Err(SyncError::Invalid("priority ceiling is not supported"));
        }
        Ok(Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU32::new(NO_THREAD),
            depth: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            kind: attrs.kind,
            robust: attrs.robust,
            scope: attrs.scope,
            protocol: attrs.protocol,
        })
    }

    /// The configured behavioral variant.
    #[must_use]
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    /// The configured priority protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Kernel TID of the current owner, if any.
    ///
    /// This is the identity an external scheduler uses to apply priority
    /// inheritance when [`Protocol::Inherit`] is configured.
    #[must_use]
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<()> {
        if self.flags() & FLAG_DESTROYED != 0 {
            return Err(SyncError::Invalid("mutex has been destroyed"));
        }
        Ok(())
    }

    fn inconsistent(&self) -> bool {
        self.flags() & FLAG_INCONSISTENT != 0
    }

    /// Robust path: did the recorded owner terminate while holding the lock?
    ///
    /// The liveness probe is a syscall, so a healthy holder can unlock and
    /// exit inside the probe window. The verdict only stands if the same
    /// TID is still recorded as holder, with the lock still taken, after
    /// the probe comes back negative; otherwise ownership moved on and the
    /// probe hit a stale TID.
    fn owner_died_holding(&self) -> bool {
        let owner = self.owner.load(Ordering::Acquire);
        if owner == NO_THREAD || self.state.load(Ordering::Relaxed) == UNLOCKED {
            return false;
        }
        if thread_alive(owner) {
            return false;
        }
        self.owner.load(Ordering::Acquire) == owner
            && self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn note_acquired(&self, me: u32) {
        self.owner.store(me, Ordering::Release);
        self.depth.store(1, Ordering::Relaxed);
    }

    /// Acquire the mutex, blocking while it is held by another thread.
    pub fn lock(&self) -> Result<()> {
        self.lock_inner(None)
    }

    /// Acquire the mutex or fail with [`SyncError::Timeout`] once the
    /// absolute `deadline` elapses.
    pub fn lock_deadline(&self, deadline: &Deadline) -> Result<()> {
        self.lock_inner(Some(deadline))
    }

    fn lock_inner(&self, deadline: Option<&Deadline>) -> Result<()> {
        self.check_live()?;
        let me = thread_id();

        if self.owner.load(Ordering::Acquire) == me
            && self.state.load(Ordering::Relaxed) != UNLOCKED
        {
            match self.kind {
                MutexKind::Recursive => {
                    let depth = self.depth.load(Ordering::Relaxed);
                    let next = depth
                        .checked_add(1)
                        .ok_or(SyncError::Exhausted("recursion depth overflow"))?;
                    self.depth.store(next, Ordering::Relaxed);
                    return Ok(());
                }
                MutexKind::ErrorCheck => {
                    return Err(SyncError::Misuse("relock of a non-recursive mutex"));
                }
                // Normal: self-deadlock, as documented. A deadline still
                // bounds the wait below.
                MutexKind::Normal => {}
            }
        }

        if self.robust && self.inconsistent() {
            return Err(SyncError::OwnerDied);
        }

        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.note_acquired(me);
            return Ok(());
        }

        self.lock_contended(me, deadline)
    }

    fn lock_contended(&self, me: u32, deadline: Option<&Deadline>) -> Result<()> {
        LOCK_SPIN_EVENTS.fetch_add(1, Ordering::Relaxed);
        loop {
            let observed = self.state.load(Ordering::Relaxed);
            if observed == UNLOCKED {
                if self
                    .state
                    .compare_exchange(UNLOCKED, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.note_acquired(me);
                    return Ok(());
                }
                continue;
            }

            if self.robust {
                if self.inconsistent() {
                    return Err(SyncError::OwnerDied);
                }
                if self.owner_died_holding() {
                    self.flags.fetch_or(FLAG_INCONSISTENT, Ordering::AcqRel);
                    // Release the other blocked lockers so they observe
                    // the inconsistent state too.
                    futex::wake_all(&self.state, self.scope);
                    return Err(SyncError::OwnerDied);
                }
            }

            if observed == LOCKED {
                let _ = self.state.compare_exchange(
                    LOCKED,
                    CONTENDED,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }

            LOCK_WAIT_EVENTS.fetch_add(1, Ordering::Relaxed);
            let poll;
            let effective = if self.robust {
                // Bounded sleeps: a dead owner never issues the wake.
                poll = nearer_deadline(deadline, ROBUST_POLL_INTERVAL);
                Some(&poll)
            } else {
                deadline
            };
            match futex::wait_until(&self.state, CONTENDED, effective, self.scope) {
                WaitOutcome::TimedOut => {
                    if let Some(deadline) = deadline
                        && deadline.has_expired()
                    {
                        return Err(SyncError::Timeout);
                    }
                    // Robust poll tick, not the caller's deadline.
                }
                WaitOutcome::Woken | WaitOutcome::Mismatch | WaitOutcome::Interrupted => {}
            }
        }
    }

    /// Acquire the mutex without blocking; [`SyncError::Busy`] if held.
    pub fn try_lock(&self) -> Result<()> {
        self.check_live()?;
        let me = thread_id();

        if self.owner.load(Ordering::Acquire) == me
            && self.state.load(Ordering::Relaxed) != UNLOCKED
        {
            return match self.kind {
                MutexKind::Recursive => {
                    let depth = self.depth.load(Ordering::Relaxed);
                    let next = depth
                        .checked_add(1)
                        .ok_or(SyncError::Exhausted("recursion depth overflow"))?;
                    self.depth.store(next, Ordering::Relaxed);
                    Ok(())
                }
                _ => Err(SyncError::Busy),
            };
        }

        if self.robust {
            if self.inconsistent() {
                return Err(SyncError::OwnerDied);
            }
            if self.owner_died_holding() {
                self.flags.fetch_or(FLAG_INCONSISTENT, Ordering::AcqRel);
                futex::wake_all(&self.state, self.scope);
                return Err(SyncError::OwnerDied);
            }
        }

        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.note_acquired(me);
            Ok(())
        } else {
            Err(SyncError::Busy)
        }
    }

    /// Release the mutex.
    ///
    /// Ownership is verified for ErrorCheck, Recursive, and robust mutexes;
    /// for a Normal mutex an unlock from a non-owning thread is undefined
    /// (only unlock-while-unlocked is cheap enough to always detect).
    pub fn unlock(&self) -> Result<()> {
        self.check_live()?;
        if self.robust && self.inconsistent() {
            return Err(SyncError::Misuse("unlock of an inconsistent mutex"));
        }
        if self.state.load(Ordering::Relaxed) == UNLOCKED {
            return Err(SyncError::Misuse("unlock of an unlocked mutex"));
        }

        let me = thread_id();
        let checking =
            self.robust || matches!(self.kind, MutexKind::ErrorCheck | MutexKind::Recursive);
        if checking && self.owner.load(Ordering::Acquire) != me {
            return Err(SyncError::Misuse("unlock by a thread that is not the owner"));
        }

        if self.kind == MutexKind::Recursive {
            let depth = self.depth.load(Ordering::Relaxed);
            if depth > 1 {
                self.depth.store(depth - 1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.owner.store(NO_THREAD, Ordering::Release);
        self.depth.store(0, Ordering::Relaxed);
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            UNLOCK_WAKE_EVENTS.fetch_add(1, Ordering::Relaxed);
            futex::wake(&self.state, 1, self.scope);
        }
        Ok(())
    }

    /// Repair a robust mutex after its owner died holding it.
    ///
    /// Resets the mutex to unlocked; callers are responsible for having
    /// restored the protected data to a consistent state first.
    pub fn make_consistent(&self) -> Result<()> {
        self.check_live()?;
        if !self.robust {
            return Err(SyncError::Misuse("make_consistent on a non-robust mutex"));
        }
        if !self.inconsistent() {
            return Err(SyncError::Misuse("mutex is not in an inconsistent state"));
        }
        // An inconsistent mark with a live recorded owner means the mark is
        // wrong, not the owner; resetting here would yank the lock out from
        // under a thread inside its critical section.
        let owner = self.owner.load(Ordering::Acquire);
        if owner != NO_THREAD && thread_alive(owner) {
            return Err(SyncError::Misuse("recorded owner is still alive"));
        }
        self.owner.store(NO_THREAD, Ordering::Release);
        self.depth.store(0, Ordering::Relaxed);
        self.flags.fetch_and(!FLAG_INCONSISTENT, Ordering::AcqRel);
        self.state.store(UNLOCKED, Ordering::Release);
        futex::wake_all(&self.state, self.scope);
        Ok(())
    }

    /// Tear the mutex down. Fails with [`SyncError::Misuse`] while the mutex
    /// is locked, contended, or inconsistent; afterwards every operation
    /// reports [`SyncError::Invalid`].
    pub fn destroy(&self) -> Result<()> {
        self.check_live()?;
        if self.state.load(Ordering::Acquire) != UNLOCKED || self.inconsistent() {
            return Err(SyncError::Misuse("destroy of a locked or waited-on mutex"));
        }
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
        Ok(())
    }

    /// Full release on behalf of a condition-variable wait.
    ///
    /// The caller must hold the mutex exactly once; a recursively held
    /// mutex cannot be atomically released for a wait.
    pub(crate) fn release_for_wait(&self) -> Result<()> {
        self.check_live()?;
        let me = thread_id();
        if self.state.load(Ordering::Relaxed) == UNLOCKED
            || self.owner.load(Ordering::Acquire) != me
        {
            return Err(SyncError::Misuse("condition wait without holding the mutex"));
        }
        if self.kind == MutexKind::Recursive && self.depth.load(Ordering::Relaxed) > 1 {
            return Err(SyncError::Misuse("condition wait on a recursively held mutex"));
        }
        self.unlock()
    }

    /// Re-acquisition after a condition-variable wait.
    pub(crate) fn relock_after_wait(&self) -> Result<()> {
        self.lock()
    }
}


/// The nearer of the caller's deadline and `interval` from now.
fn nearer_deadline(deadline: Option<&Deadline>, interval: Duration) -> Deadline {
    let poll = Deadline::after(interval);
    match deadline {
        Some(deadline) if deadline.remaining() < poll.remaining() => *deadline,
        _ => poll,
    }
}
