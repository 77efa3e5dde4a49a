//! Thread-local storage keys.
//!
//! A process-wide registry hands out up to [`KEYS_MAX`] keys; each thread
//! keeps its own value (a `u64`, zero meaning unset) per key. Keys carry a
//! sequence number matching the registry slot they were minted from, so a
//! key that survives its own deletion is detected as stale rather than
//! silently reading whatever a reused slot now holds.
//!
//! Destructors registered at key creation run when a thread retires its
//! slot table, either through an explicit
//! [`run_thread_exit_destructors`] call or as a fallback when the thread's
//! storage is dropped at exit. A destructor may store fresh values; passes
//! repeat while any value remains, bounded by [`DESTRUCTOR_ITERATIONS`].
//! Deleting a key never runs destructors: outstanding values for the key
//! are simply orphaned, as their sequence number no longer matches.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use crate::error::{Result, SyncError};

/// Process-wide ceiling on simultaneously live keys.
pub const KEYS_MAX: usize = 1024;

/// Upper bound on destructor passes at thread exit.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

type Destructor = Arc<dyn Fn(u64) + Send + Sync>;

/// Handle to a thread-local storage slot.
///
/// Copyable and valid process-wide until deleted; the embedded sequence
/// number invalidates copies that outlive the deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    seq: u32,
}

struct KeySlot {
    in_use: bool,
    /// Bumped on delete so stale [`Key`] copies stop validating.
    seq: u32,
    destructor: Option<Destructor>,
}

static REGISTRY: OnceLock<StdMutex<Vec<KeySlot>>> = OnceLock::new();

fn registry() -> &'static StdMutex<Vec<KeySlot>> {
    REGISTRY.get_or_init(|| StdMutex::new(Vec::new()))
}

fn with_registry<T>(f: impl FnOnce(&mut Vec<KeySlot>) -> T) -> T {
    let mut slots = registry().lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut slots)
}

/// Per-thread value table. The `Drop` impl is the thread-exit fallback for
/// threads that never call [`run_thread_exit_destructors`] themselves.
struct SlotTable {
    /// index → (key sequence at store time, value).
    values: HashMap<u32, (u32, u64)>,
    torn_down: bool,
}

thread_local! {
    static SLOTS: RefCell<SlotTable> = RefCell::new(SlotTable {
        values: HashMap::new(),
        torn_down: false,
    });
}

impl Drop for SlotTable {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // Values a destructor stores from here on cannot reach the
        // thread-local table (it is already being dropped); they are lost.
        for _ in 0..DESTRUCTOR_ITERATIONS {
            let pending: Vec<(u32, u32, u64)> = self
                .values
                .iter()
                .map(|(&index, &(seq, value))| (index, seq, value))
                .collect();
            if pending.is_empty() {
                break;
            }
            let mut ran_any = false;
            for (index, seq, value) in pending {
                self.values.remove(&index);
                if let Some(destructor) = destructor_for(index, seq) {
                    destructor(value);
                    ran_any = true;
                }
            }
            if !ran_any {
                break;
            }
        }
    }
}

fn destructor_for(index: u32, seq: u32) -> Option<Destructor> {
    with_registry(|slots| {
        let slot = slots.get(index as usize)?;
        if slot.in_use && slot.seq == seq {
            slot.destructor.clone()
        } else {
            None
        }
    })
}

fn validate(key: Key) -> Result<()> {
    with_registry(|slots| {
        let live = slots
            .get(key.index as usize)
            .is_some_and(|slot| slot.in_use && slot.seq == key.seq);
        if live {
            Ok(())
        } else {
            Err(SyncError::Invalid("key has been deleted or never existed"))
        }
    })
}

/// Mint a new key, optionally with a per-value destructor.
///
/// Fails with [`SyncError::Exhausted`] once [`KEYS_MAX`] keys are live.
pub fn create_key(destructor: Option<Box<dyn Fn(u64) + Send + Sync>>) -> Result<Key> {
    let destructor = destructor.map(Arc::from);
    with_registry(|slots| {
        if let Some(index) = slots.iter().position(|slot| !slot.in_use) {
            let slot = &mut slots[index];
            slot.in_use = true;
            slot.destructor = destructor;
            return Ok(Key {
                index: index as u32,
                seq: slot.seq,
            });
        }
        if slots.len() >= KEYS_MAX {
            return Err(SyncError::Exhausted("thread-local key table is full"));
        }
        let index = slots.len() as u32;
        slots.push(KeySlot {
            in_use: true,
            seq: 0,
            destructor,
        });
        Ok(Key { index, seq: 0 })
    })
}

/// Retire a key. Runs no destructors; values other threads still hold for
/// this key are orphaned and ignored from now on.
pub fn delete_key(key: Key) -> Result<()> {
    with_registry(|slots| {
        let slot = slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.in_use && slot.seq == key.seq)
            .ok_or(SyncError::Invalid("key has been deleted or never existed"))?;
        slot.in_use = false;
        slot.destructor = None;
        slot.seq = slot.seq.wrapping_add(1);
        Ok(())
    })
}

/// Store the calling thread's value for `key`. Zero clears the slot.
pub fn set(key: Key, value: u64) -> Result<()> {
    validate(key)?;
    SLOTS
        .try_with(|table| {
            let mut table = table.borrow_mut();
            if value == 0 {
                table.values.remove(&key.index);
            } else {
                table.values.insert(key.index, (key.seq, value));
            }
        })
        .map_err(|_| SyncError::Invalid("thread-local storage is gone"))
}

/// The calling thread's value for `key`, zero if never set.
pub fn get(key: Key) -> Result<u64> {
    validate(key)?;
    SLOTS
        .try_with(|table| {
            let table = table.borrow();
            match table.values.get(&key.index) {
                Some(&(seq, value)) if seq == key.seq => value,
                _ => 0,
            }
        })
        .map_err(|_| SyncError::Invalid("thread-local storage is gone"))
}

/// Run the calling thread's key destructors as if the thread were exiting.
///
/// Every nonzero value whose key has a destructor is cleared and passed to
/// it; a destructor may store new values, which are handled in later
/// passes up to [`DESTRUCTOR_ITERATIONS`]. Afterwards the fallback at real
/// thread exit is disarmed.
pub fn run_thread_exit_destructors() {
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let pending = SLOTS.try_with(|table| {
            let mut table = table.borrow_mut();
            let pending: Vec<(u32, u32, u64)> = table
                .values
                .iter()
                .map(|(&index, &(seq, value))| (index, seq, value))
                .collect();
            for (index, _, _) in &pending {
                table.values.remove(index);
            }
            pending
        });
        let pending = match pending {
            Ok(pending) => pending,
            Err(_) => return,
        };
        if pending.is_empty() {
            break;
        }
        // The table borrow is released here: destructors are free to call
        // back into `set`.
        let mut ran_any = false;
        for (index, seq, value) in pending {
            if let Some(destructor) = destructor_for(index, seq) {
                destructor(value);
                ran_any = true;
            }
        }
        if !ran_any {
            break;
        }
    }
    let _ = SLOTS.try_with(|table| table.borrow_mut().torn_down = true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // The registry is process-global; serialize tests that depend on its
    // free-slot layout.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn serialized() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn set_get_roundtrip() {
        let _guard = serialized();
        let key = create_key(None).unwrap();
        assert_eq!(get(key).unwrap(), 0);
        set(key, 42).unwrap();
        assert_eq!(get(key).unwrap(), 42);
        set(key, 0).unwrap();
        assert_eq!(get(key).unwrap(), 0);
        delete_key(key).unwrap();
    }

    #[test]
    fn stale_key_is_rejected_after_delete() {
        let _guard = serialized();
        let key = create_key(None).unwrap();
        delete_key(key).unwrap();
        assert!(matches!(get(key), Err(SyncError::Invalid(_))));
        assert!(matches!(set(key, 1), Err(SyncError::Invalid(_))));
        assert!(matches!(delete_key(key), Err(SyncError::Invalid(_))));
    }

    #[test]
    fn reused_slot_does_not_expose_stale_values() {
        let _guard = serialized();
        let old = create_key(None).unwrap();
        set(old, 7).unwrap();
        delete_key(old).unwrap();

        // Likely reuses the same slot index, with a bumped sequence.
        let new = create_key(None).unwrap();
        assert_eq!(get(new).unwrap(), 0);
        delete_key(new).unwrap();
    }

    #[test]
    fn values_are_per_thread() {
        let _guard = serialized();
        let key = create_key(None).unwrap();
        set(key, 11).unwrap();

        let remote = std::thread::spawn(move || {
            let initial = get(key).unwrap();
            set(key, 22).unwrap();
            (initial, get(key).unwrap())
        })
        .join()
        .unwrap();
        assert_eq!(remote, (0, 22));
        assert_eq!(get(key).unwrap(), 11);
        delete_key(key).unwrap();
    }

    #[test]
    fn destructor_runs_on_explicit_teardown() {
        let _guard = serialized();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let key = create_key(Some(Box::new(move |value| {
            sink.lock().unwrap().push(value);
        })))
        .unwrap();

        std::thread::spawn(move || {
            set(key, 99).unwrap();
            run_thread_exit_destructors();
            // Disarmed: the later implicit drop must not run it again.
        })
        .join()
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![99]);
        delete_key(key).unwrap();
    }

    #[test]
    fn destructor_runs_via_thread_exit_fallback() {
        let _guard = serialized();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let key = create_key(Some(Box::new(move |value| {
            sink.lock().unwrap().push(value);
        })))
        .unwrap();

        std::thread::spawn(move || {
            set(key, 5).unwrap();
            // No explicit teardown: the storage drop runs the destructor.
        })
        .join()
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![5]);
        delete_key(key).unwrap();
    }

    #[test]
    fn delete_key_suppresses_destructors() {
        let _guard = serialized();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let key = create_key(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        std::thread::spawn(move || {
            set(key, 1).unwrap();
            delete_key(key).unwrap();
            run_thread_exit_destructors();
        })
        .join()
        .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restoring_destructor_is_bounded() {
        let _guard = serialized();
        let runs = Arc::new(AtomicUsize::new(0));

        // A destructor that stores a fresh value every time it runs would
        // loop forever without the pass bound.
        let counter = Arc::clone(&runs);
        let key_cell = Arc::new(StdMutex::new(None::<Key>));
        let key_ref = Arc::clone(&key_cell);
        let key = create_key(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(key) = *key_ref.lock().unwrap() {
                let _ = set(key, 1);
            }
        })))
        .unwrap();
        *key_cell.lock().unwrap() = Some(key);

        std::thread::spawn(move || {
            set(key, 1).unwrap();
            run_thread_exit_destructors();
        })
        .join()
        .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), DESTRUCTOR_ITERATIONS);
        delete_key(key).unwrap();
    }

    #[test]
    fn key_table_exhaustion_is_reported() {
        let _guard = serialized();
        let mut created = Vec::new();
        let exhausted = loop {
            match create_key(None) {
                Ok(key) => created.push(key),
                Err(err) => break err,
            }
        };
        assert_eq!(exhausted, SyncError::Exhausted("thread-local key table is full"));
        for key in created {
            delete_key(key).unwrap();
        }
    }
}
