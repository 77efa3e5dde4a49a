//! One-time initialization.
//!
//! The whole state machine lives in one futex word: not-started,
//! in-progress, done, poisoned. The first caller to win the
//! not-started → in-progress CAS runs the closure; latecomers futex-wait
//! on the word until the winner publishes done and wakes them.
//!
//! If the closure panics, the unwind marks the word poisoned and wakes all
//! waiters; every subsequent call reports [`SyncError::Misuse`] rather
//! than running a second initializer against half-initialized state.
//!
//! Poisoning only covers failures that unwind. A shared-scope once whose
//! initializing process dies outright leaves the word in-progress and
//! latecomers blocked; there is no owner identity here to probe, unlike a
//! robust mutex.

use core::sync::atomic::{AtomicU32, Ordering};

use futexkit_sys::{Scope, futex};

use crate::error::{Result, SyncError};

const NOT_STARTED: u32 = 0;
const IN_PROGRESS: u32 = 1;
const DONE: u32 = 2;
const POISONED: u32 = 3;

/// One-time initialization control.
#[derive(Debug)]
#[repr(C)]
pub struct Once {
    state: AtomicU32,
    scope: Scope,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the terminal state when the initializer finishes — done on a
/// normal return, poisoned if the closure unwound — and wakes all waiters.
struct InitGuard<'a> {
    once: &'a Once,
    completed: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        let terminal = if self.completed { DONE } else { POISONED };
        self.once.state.store(terminal, Ordering::Release);
        futex::wake_all(&self.once.state, self.once.scope);
    }
}

impl Once {
    /// A private once-control in the not-started state.
    #[must_use]
    pub fn new() -> Self {
        Self::with_scope(Scope::Private)
    }

    /// A once-control with an explicit sharing scope.
    #[must_use]
    pub fn with_scope(scope: Scope) -> Self {
        Self {
            state: AtomicU32::new(NOT_STARTED),
            scope,
        }
    }

    /// Whether the initializer has run to completion.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Run `init` exactly once across all callers.
    ///
    /// Returns `Ok(())` both for the thread that ran the initializer and
    /// for every thread that arrived after (or waited for) its completion.
    /// Blocks while another thread is mid-initialization.
    pub fn call_once<F>(&self, init: F) -> Result<()>
    where
        F: FnOnce(),
    {
        loop {
            match self.state.compare_exchange(
                NOT_STARTED,
                IN_PROGRESS,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let mut guard = InitGuard {
                        once: self,
                        completed: false,
                    };
                    init();
                    guard.completed = true;
                    return Ok(());
                }
                Err(DONE) => return Ok(()),
                Err(POISONED) => {
                    return Err(SyncError::Misuse("once initializer panicked"));
                }
                Err(_) => {
                    // In progress elsewhere; park until a terminal state.
                    futex::wait(&self.state, IN_PROGRESS, self.scope);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32 as Counter;

    #[test]
    fn initializer_runs_exactly_once() {
        let once = Once::new();
        let runs = Counter::new(0);
        for _ in 0..5 {
            once.call_once(|| {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(once.is_completed());
    }

    #[test]
    fn concurrent_callers_observe_a_single_run() {
        let once = Arc::new(Once::new());
        let runs = Arc::new(Counter::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let once = Arc::clone(&once);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    once.call_once(|| {
                        // Widen the in-progress window so latecomers park.
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                    // Every caller sees the completed state on return.
                    assert_eq!(runs.load(Ordering::SeqCst), 1);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_initializer_poisons_the_once() {
        let once = Arc::new(Once::new());

        let panicker = Arc::clone(&once);
        let result = std::thread::spawn(move || {
            panicker
                .call_once(|| panic!("initialization failed"))
                .unwrap();
        })
        .join();
        assert!(result.is_err());

        assert!(!once.is_completed());
        assert!(matches!(
            once.call_once(|| unreachable!("must not run after poisoning")),
            Err(SyncError::Misuse(_))
        ));
    }
}
