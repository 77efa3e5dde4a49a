//! Reusable thread barrier.
//!
//! A barrier holds arriving threads until `count` of them have arrived,
//! then releases the whole cohort and resets for the next cycle. Exactly
//! one thread per cycle (the last to arrive) observes
//! [`BarrierWaitResult::Serial`], which callers use to elect a thread for
//! once-per-cycle work.
//!
//! Cycles are told apart by a generation counter: a releasing cohort bumps
//! the generation, and waiters block while the generation they arrived in
//! is still current. A thread from cycle N that sleeps through the start of
//! cycle N+1 therefore cannot be confused with the new arrivals.

use core::sync::atomic::{AtomicU32, Ordering};

use futexkit_sys::Scope;

use crate::cond::{Cond, CondAttributes};
use crate::error::{Result, SyncError};
use crate::mutex::{Mutex, MutexAttributes};

const FLAG_DESTROYED: u32 = 1 << 0;

/// Construction-time attributes, defaulting to a private barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarrierAttributes {
    pub scope: Scope,
}

/// What [`Barrier::wait`] reported for this thread in this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWaitResult {
    /// This thread completed the cohort; one per cycle.
    Serial,
    /// This thread was released by another thread completing the cohort.
    Normal,
}

impl BarrierWaitResult {
    /// True for the one thread per cycle elected for serial work.
    #[must_use]
    pub fn is_serial(self) -> bool {
        self == BarrierWaitResult::Serial
    }
}

/// A reusable barrier for cohorts of a fixed size.
#[derive(Debug)]
#[repr(C)]
pub struct Barrier {
    inner: Mutex,
    cv: Cond,
    threshold: u32,
    /// Threads arrived in the current cycle. Guarded by `inner`.
    arrived: AtomicU32,
    /// Cycle counter. Guarded by `inner`.
    generation: AtomicU32,
    flags: AtomicU32,
}

impl Barrier {
    /// A private barrier releasing cohorts of `count` threads.
    ///
    /// Fails with [`SyncError::Invalid`] for a zero count. A count of one
    /// makes every wait return [`BarrierWaitResult::Serial`] immediately.
    pub fn new(count: u32) -> Result<Self> {
        Self::with_attributes(count, BarrierAttributes::default())
    }

    /// A barrier with explicit attributes.
    pub fn with_attributes(count: u32, attrs: BarrierAttributes) -> Result<Self> {
        if count == 0 {
            return Err(SyncError::Invalid("barrier count must be nonzero"));
        }
        let mutex_attrs = MutexAttributes {
            scope: attrs.scope,
            ..MutexAttributes::default()
        };
        Ok(Self {
            inner: Mutex::with_attributes(mutex_attrs)
                .unwrap_or_else(|_| unreachable!("normal mutex attributes are valid")),
            cv: Cond::with_attributes(CondAttributes {
                scope: attrs.scope,
                ..CondAttributes::default()
            }),
            threshold: count,
            arrived: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            flags: AtomicU32::new(0),
        })
    }

    fn check_live(&self) -> Result<()> {
        if self.flags.load(Ordering::Acquire) & FLAG_DESTROYED != 0 {
            return Err(SyncError::Invalid("barrier has been destroyed"));
        }
        Ok(())
    }

    /// Arrive at the barrier and block until the cohort is complete.
    pub fn wait(&self) -> Result<BarrierWaitResult> {
        self.check_live()?;
        if self.threshold == 1 {
            return Ok(BarrierWaitResult::Serial);
        }

        self.inner.lock()?;
        let cycle = self.generation.load(Ordering::Relaxed);
        let arrived = self.arrived.load(Ordering::Relaxed) + 1;

        if arrived == self.threshold {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.store(cycle.wrapping_add(1), Ordering::Relaxed);
            self.inner.unlock()?;
            self.cv.broadcast()?;
            return Ok(BarrierWaitResult::Serial);
        }

        self.arrived.store(arrived, Ordering::Relaxed);
        let result = self
            .cv
            .wait_while(&self.inner, || {
                self.generation.load(Ordering::Relaxed) == cycle
            });
        self.inner.unlock()?;
        result?;
        Ok(BarrierWaitResult::Normal)
    }

    /// Tear the barrier down. Fails with [`SyncError::Misuse`] while any
    /// thread is waiting in the current cycle.
    pub fn destroy(&self) -> Result<()> {
        self.check_live()?;
        if self.threshold == 1 {
            self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
            return Ok(());
        }
        self.inner.lock()?;
        if self.arrived.load(Ordering::Relaxed) != 0 {
            self.inner.unlock()?;
            return Err(SyncError::Misuse("destroy of a barrier with waiters"));
        }
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
        self.inner.unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    #[test]
    fn zero_count_is_invalid() {
        assert!(matches!(Barrier::new(0), Err(SyncError::Invalid(_))));
    }

    #[test]
    fn count_of_one_returns_serial_immediately() {
        let barrier = Barrier::new(1).unwrap();
        assert_eq!(barrier.wait().unwrap(), BarrierWaitResult::Serial);
        assert_eq!(barrier.wait().unwrap(), BarrierWaitResult::Serial);
    }

    #[test]
    fn cohort_releases_with_one_serial_thread() {
        let barrier = Arc::new(Barrier::new(4).unwrap());
        let serial_count = Arc::new(StdAtomicU32::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let serial_count = Arc::clone(&serial_count);
                std::thread::spawn(move || {
                    if barrier.wait().unwrap().is_serial() {
                        serial_count.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(serial_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_is_reusable_across_cycles() {
        let barrier = Arc::new(Barrier::new(2).unwrap());
        let serial_count = Arc::new(StdAtomicU32::new(0));

        for _ in 0..3 {
            let partner_barrier = Arc::clone(&barrier);
            let partner_serial_count = Arc::clone(&serial_count);
            let partner = std::thread::spawn(move || {
                if partner_barrier.wait().unwrap().is_serial() {
                    partner_serial_count.fetch_add(1, Ordering::SeqCst);
                }
            });
            if barrier.wait().unwrap().is_serial() {
                serial_count.fetch_add(1, Ordering::SeqCst);
            }
            partner.join().unwrap();
        }
        // One serial election per cycle.
        assert_eq!(serial_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn destroyed_barrier_rejects_waits() {
        let barrier = Barrier::new(2).unwrap();
        barrier.destroy().unwrap();
        assert!(matches!(barrier.wait(), Err(SyncError::Invalid(_))));
    }
}
