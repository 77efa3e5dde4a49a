//! # futexkit-core
//!
//! Futex-backed synchronization primitives: blocking mutexes (normal,
//! recursive, error-checking, robust), condition variables, a
//! writer-preferring read-write lock, reusable barriers, spinlocks,
//! one-time initialization, and thread-local storage keys.
//!
//! Every blocking primitive compiles down to atomics plus the futex
//! wait/wake pair from [`futexkit_sys`]; uncontended paths never enter the
//! kernel. Primitives constructed with [`Scope::Shared`] are `#[repr(C)]`,
//! keep all state in plain atomic words, and name owners by kernel TID, so
//! they work placed in memory mapped by several processes.
//!
//! Operations return [`error::Result`]; contention, timeouts, owner death,
//! and contract violations are all ordinary [`error::SyncError`] values
//! rather than panics.

pub mod barrier;
pub mod cond;
pub mod error;
pub mod mutex;
pub mod once;
pub mod rwlock;
pub mod spin;
pub mod tls;

pub use barrier::{Barrier, BarrierAttributes, BarrierWaitResult};
pub use cond::{ClockId, Cond, CondAttributes};
pub use error::{Result, SyncError};
pub use mutex::{Mutex, MutexAttributes, MutexKind, Protocol};
pub use once::Once;
pub use rwlock::{RwLock, RwLockAttributes};
pub use spin::SpinLock;
pub use tls::{DESTRUCTOR_ITERATIONS, KEYS_MAX, Key};

pub use futexkit_sys::{Deadline, Scope};
