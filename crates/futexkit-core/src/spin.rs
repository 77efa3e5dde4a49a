//! Busy-wait spinlock.
//!
//! For critical sections short enough that parking in the kernel costs more
//! than burning the remaining cycles. No ownership tracking, no recursion,
//! no deadlines: just a CAS loop with a pause hint. Anything that might
//! block while holding one of these belongs under a [`crate::mutex::Mutex`]
//! instead.

use core::sync::atomic::{AtomicU32, Ordering};

use futexkit_sys::Scope;

use crate::error::{Result, SyncError};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

const FLAG_DESTROYED: u32 = 1 << 0;

/// A test-and-set spinlock.
#[derive(Debug)]
#[repr(C)]
pub struct SpinLock {
    state: AtomicU32,
    flags: AtomicU32,
    scope: Scope,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    /// A private spinlock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_scope(Scope::Private)
    }

    /// A spinlock with an explicit sharing scope.
    ///
    /// The lock word is a plain atomic either way; the scope records intent
    /// when the lock is placed in memory mapped by several processes.
    #[must_use]
    pub fn with_scope(scope: Scope) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            flags: AtomicU32::new(0),
            scope,
        }
    }

    /// The configured sharing scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    fn check_live(&self) -> Result<()> {
        if self.flags.load(Ordering::Acquire) & FLAG_DESTROYED != 0 {
            return Err(SyncError::Invalid("spinlock has been destroyed"));
        }
        Ok(())
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> Result<()> {
        self.check_live()?;
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            // Spin on a plain load; the CAS above is retried only once the
            // word reads unlocked, keeping the cache line shared meanwhile.
            while self.state.load(Ordering::Relaxed) == LOCKED {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock without spinning; [`SyncError::Busy`] if held.
    pub fn try_lock(&self) -> Result<()> {
        self.check_live()?;
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(())
        } else {
            Err(SyncError::Busy)
        }
    }

    /// Release the lock. Unlocking an unlocked spinlock is a contract
    /// violation.
    pub fn unlock(&self) -> Result<()> {
        self.check_live()?;
        if self.state.swap(UNLOCKED, Ordering::Release) == UNLOCKED {
            return Err(SyncError::Misuse("unlock of an unlocked spinlock"));
        }
        Ok(())
    }

    /// Tear the lock down. Fails with [`SyncError::Misuse`] while held.
    pub fn destroy(&self) -> Result<()> {
        self.check_live()?;
        if self.state.load(Ordering::Acquire) != UNLOCKED {
            return Err(SyncError::Misuse("destroy of a locked spinlock"));
        }
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
        Ok(())
    }
}
