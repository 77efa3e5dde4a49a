//! Condition variable with a generation-counter futex word.
//!
//! The futex word is a wakeup generation counter. A waiter samples the
//! generation while still holding the mutex, releases the mutex, then
//! futex-waits while the generation is unchanged. Signal and broadcast bump
//! the generation before waking, so a wakeup issued in the window between
//! the unlock and the kernel wait makes the futex wait fail with a value
//! mismatch instead of being lost.
//!
//! A condition variable binds to the first mutex it is waited on with and
//! stays bound while any waiter is present; a concurrent wait naming a
//! different mutex is a contract violation. The binding clears once the
//! last waiter leaves.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use futexkit_sys::{Deadline, Scope, WaitOutcome, futex};

use crate::error::{Result, SyncError};
use crate::mutex::Mutex;

const FLAG_DESTROYED: u32 = 1 << 0;

/// Clock against which relative condition-variable timeouts are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockId {
    /// Monotonic clock, immune to wall-clock steps. The default.
    #[default]
    Monotonic,
    /// Wall clock; a timeout may shift when the clock is stepped.
    Realtime,
}

/// Construction-time attributes, defaulting to a private monotonic condvar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CondAttributes {
    pub scope: Scope,
    pub clock: ClockId,
}

/// A condition variable usable with [`Mutex`].
#[derive(Debug)]
#[repr(C)]
pub struct Cond {
    /// Wakeup generation counter. This is the futex word.
    generation: AtomicU32,
    /// Number of threads currently inside a wait.
    waiters: AtomicU32,
    /// Address of the bound mutex, 0 while unbound.
    bound: AtomicUsize,
    flags: AtomicU32,
    scope: Scope,
    clock: ClockId,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the waiter count on every exit path, including unwinds, and
/// clears the mutex binding when the last waiter leaves.
struct WaiterGuard<'a> {
    cond: &'a Cond,
}

impl<'a> WaiterGuard<'a> {
    fn enter(cond: &'a Cond) -> Self {
        cond.waiters.fetch_add(1, Ordering::AcqRel);
        Self { cond }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.cond.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cond.bound.store(0, Ordering::Release);
        }
    }
}

impl Cond {
    /// A private condition variable on the monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_attributes(CondAttributes::default())
    }

    /// A condition variable with explicit attributes.
    #[must_use]
    pub fn with_attributes(attrs: CondAttributes) -> Self {
        Self {
            generation: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            bound: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            scope: attrs.scope,
            clock: attrs.clock,
        }
    }

    /// The clock used to resolve relative timeouts in [`Cond::wait_timeout`].
    #[must_use]
    pub fn clock(&self) -> ClockId {
        self.clock
    }

    fn check_live(&self) -> Result<()> {
        if self.flags.load(Ordering::Acquire) & FLAG_DESTROYED != 0 {
            return Err(SyncError::Invalid("condition variable has been destroyed"));
        }
        Ok(())
    }

    fn bind(&self, mutex: &Mutex) -> Result<()> {
        let addr = core::ptr::from_ref(mutex) as usize;
        match self
            .bound
            .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == addr => Ok(()),
            Err(_) => Err(SyncError::Misuse(
                "concurrent waits with two different mutexes",
            )),
        }
    }

    /// Block until signaled. The caller must hold `mutex`; it is released
    /// for the duration of the wait and re-acquired before returning.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_inner(mutex, None)
    }

    /// Block until signaled or the absolute `deadline` elapses.
    ///
    /// On timeout the mutex is re-acquired before [`SyncError::Timeout`] is
    /// reported, so the caller always holds the mutex when this returns.
    pub fn wait_deadline(&self, mutex: &Mutex, deadline: &Deadline) -> Result<()> {
        self.wait_inner(mutex, Some(deadline))
    }

    /// Block until signaled or `timeout` elapses on the configured clock.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> Result<()> {
        let deadline = match self.clock {
            ClockId::Monotonic => Deadline::after(timeout),
            ClockId::Realtime => Deadline::at_realtime(SystemTime::now() + timeout),
        };
        self.wait_inner(mutex, Some(&deadline))
    }

    fn wait_inner(&self, mutex: &Mutex, deadline: Option<&Deadline>) -> Result<()> {
        self.check_live()?;
        self.bind(mutex)?;

        let guard = WaiterGuard::enter(self);
        // The generation must be sampled before the mutex is released:
        // any signal issued after the unlock then bumps past our sample.
        let seq = self.generation.load(Ordering::Acquire);
        mutex.release_for_wait()?;

        let mut timed_out = false;
        while self.generation.load(Ordering::Acquire) == seq {
            match futex::wait_until(&self.generation, seq, deadline, self.scope) {
                WaitOutcome::TimedOut => {
                    timed_out = true;
                    break;
                }
                WaitOutcome::Woken | WaitOutcome::Mismatch | WaitOutcome::Interrupted => {}
            }
        }

        drop(guard);
        mutex.relock_after_wait()?;
        if timed_out {
            Err(SyncError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Block while `condition()` is true, re-evaluating after every wakeup.
    ///
    /// The caller must hold `mutex`; the predicate runs with it held.
    pub fn wait_while<F>(&self, mutex: &Mutex, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(mutex)?;
        }
        Ok(())
    }

    /// Wake one waiter.
    ///
    /// Bumping the generation is unconditional: with no waiters present the
    /// bump is harmless and the wake is a no-op in the kernel.
    pub fn signal(&self) -> Result<()> {
        self.check_live()?;
        self.generation.fetch_add(1, Ordering::Release);
        futex::wake(&self.generation, 1, self.scope);
        Ok(())
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> Result<()> {
        self.check_live()?;
        self.generation.fetch_add(1, Ordering::Release);
        futex::wake_all(&self.generation, self.scope);
        Ok(())
    }

    /// Tear the condition variable down. Fails with [`SyncError::Misuse`]
    /// while any thread is waiting on it.
    pub fn destroy(&self) -> Result<()> {
        self.check_live()?;
        if self.waiters.load(Ordering::Acquire) != 0 {
            return Err(SyncError::Misuse("destroy of a waited-on condition variable"));
        }
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
        Ok(())
    }
}
