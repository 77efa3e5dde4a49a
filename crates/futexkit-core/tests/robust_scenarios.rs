//! Robust mutex recovery after owner death.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futexkit_core::{Mutex, MutexAttributes, SyncError};

fn robust_mutex() -> Mutex {
    Mutex::with_attributes(MutexAttributes {
        robust: true,
        ..MutexAttributes::default()
    })
    .unwrap()
}

/// Lock the mutex on a thread that terminates without unlocking.
fn kill_owner(mutex: &Arc<Mutex>) {
    let owner = Arc::clone(mutex);
    std::thread::spawn(move || owner.lock().unwrap())
        .join()
        .unwrap();
}

#[test]
fn blocked_waiters_observe_owner_death() {
    let mutex = Arc::new(robust_mutex());
    let owner_died_reports = Arc::new(AtomicU32::new(0));

    kill_owner(&mutex);

    // Several threads block on the dead-owner mutex; the liveness probe
    // must release every one of them with OwnerDied.
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let reports = Arc::clone(&owner_died_reports);
            std::thread::spawn(move || {
                if mutex.lock() == Err(SyncError::OwnerDied) {
                    reports.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(owner_died_reports.load(Ordering::SeqCst), 3);
}

#[test]
fn recovery_requires_make_consistent() {
    let mutex = Arc::new(robust_mutex());
    kill_owner(&mutex);

    // Every acquisition path keeps failing until the state is repaired.
    assert_eq!(mutex.lock(), Err(SyncError::OwnerDied));
    assert_eq!(mutex.try_lock(), Err(SyncError::OwnerDied));
    assert_eq!(mutex.lock(), Err(SyncError::OwnerDied));

    mutex.make_consistent().unwrap();

    mutex.lock().unwrap();
    assert!(mutex.owner().is_some());
    mutex.unlock().unwrap();
}

#[test]
fn make_consistent_releases_parked_waiters() {
    let mutex = Arc::new(robust_mutex());
    kill_owner(&mutex);
    assert_eq!(mutex.lock(), Err(SyncError::OwnerDied));

    // Waiters arriving after the inconsistent mark fail immediately; once
    // repaired, a fresh waiter acquires normally.
    let remote = Arc::clone(&mutex);
    let pre_repair = std::thread::spawn(move || remote.lock()).join().unwrap();
    assert_eq!(pre_repair, Err(SyncError::OwnerDied));

    mutex.make_consistent().unwrap();

    let remote = Arc::clone(&mutex);
    let post_repair = std::thread::spawn(move || {
        remote.lock()?;
        remote.unlock()
    })
    .join()
    .unwrap();
    assert_eq!(post_repair, Ok(()));
}

#[test]
fn make_consistent_on_healthy_mutex_is_misuse() {
    let mutex = robust_mutex();
    assert!(matches!(
        mutex.make_consistent(),
        Err(SyncError::Misuse(_))
    ));
    let plain = Mutex::new();
    assert!(matches!(plain.make_consistent(), Err(SyncError::Misuse(_))));
}

#[test]
fn non_robust_mutex_ignores_owner_death() {
    let mutex = Arc::new(Mutex::new());
    kill_owner(&mutex);

    // Without robustness the lock simply stays held forever; only a timed
    // attempt can observe that safely.
    let remote = Arc::clone(&mutex);
    let result = std::thread::spawn(move || {
        remote.lock_deadline(&futexkit_core::Deadline::after(Duration::from_millis(
            40,
        )))
    })
    .join()
    .unwrap();
    assert_eq!(result, Err(SyncError::Timeout));
}
