//! Cross-thread mutex scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futexkit_core::{Deadline, Mutex, MutexAttributes, MutexKind, SyncError};

#[test]
fn contended_counter_is_exact() {
    const THREADS: usize = 8;
    const ROUNDS: u64 = 2000;

    let mutex = Arc::new(Mutex::new());
    let counter = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    mutex.lock().unwrap();
                    // Split read-modify-write: only mutual exclusion keeps
                    // this from losing increments.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    mutex.unlock().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), THREADS as u64 * ROUNDS);
}

#[test]
fn try_lock_fails_fast_while_held() {
    let mutex = Arc::new(Mutex::new());
    let release = Arc::new(AtomicBool::new(false));

    let holder = {
        let mutex = Arc::clone(&mutex);
        let release = Arc::clone(&release);
        std::thread::spawn(move || {
            mutex.lock().unwrap();
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            mutex.unlock().unwrap();
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    let started = Instant::now();
    assert_eq!(mutex.try_lock(), Err(SyncError::Busy));
    // Must not have parked in the kernel.
    assert!(started.elapsed() < Duration::from_millis(50));

    release.store(true, Ordering::SeqCst);
    holder.join().unwrap();
    mutex.try_lock().unwrap();
    mutex.unlock().unwrap();
}

#[test]
fn expired_deadline_does_not_poison_later_attempts() {
    let mutex = Arc::new(Mutex::new());
    mutex.lock().unwrap();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        std::thread::spawn(move || {
            let timed_out =
                mutex.lock_deadline(&Deadline::after(Duration::from_millis(20)));
            assert_eq!(timed_out, Err(SyncError::Timeout));
            // The same thread can still take the lock once it is free.
            mutex.lock().unwrap();
            mutex.unlock().unwrap();
        })
    };

    std::thread::sleep(Duration::from_millis(60));
    mutex.unlock().unwrap();
    waiter.join().unwrap();
}

#[test]
fn recursive_mutex_nests_across_call_layers() {
    fn descend(mutex: &Mutex, depth: u32) {
        if depth == 0 {
            return;
        }
        mutex.lock().unwrap();
        descend(mutex, depth - 1);
        mutex.unlock().unwrap();
    }

    let mutex = Arc::new(
        Mutex::with_attributes(MutexAttributes {
            kind: MutexKind::Recursive,
            ..MutexAttributes::default()
        })
        .unwrap(),
    );

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    descend(&mutex, 5);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    // Fully released afterwards.
    mutex.try_lock().unwrap();
    mutex.unlock().unwrap();
}
