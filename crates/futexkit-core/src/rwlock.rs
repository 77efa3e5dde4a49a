//! Writer-preferring read-write lock.
//!
//! Built from a [`Mutex`] guarding the bookkeeping plus two condition
//! variables, one per waiter class. Writer preference means a pending
//! writer blocks new readers: readers admit themselves only while no writer
//! is active *and* no writer is queued, so a continuous stream of readers
//! cannot starve a writer. When a writer times out and leaves an empty
//! writer queue, blocked readers are re-admitted with a broadcast.
//!
//! The counters are atomics only for interior mutability; every access
//! happens with the bookkeeping mutex held.

use core::sync::atomic::{AtomicU32, Ordering};

use futexkit_sys::thread_id::NO_THREAD;
use futexkit_sys::{Deadline, Scope, thread_id};

use crate::cond::{Cond, CondAttributes};
use crate::error::{Result, SyncError};
use crate::mutex::{Mutex, MutexAttributes};

const FLAG_DESTROYED: u32 = 1 << 0;

/// Construction-time attributes, defaulting to a private lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RwLockAttributes {
    pub scope: Scope,
}

/// A read-write lock admitting many readers or one writer.
#[derive(Debug)]
#[repr(C)]
pub struct RwLock {
    /// Guards every counter below.
    inner: Mutex,
    /// Readers currently inside the read side.
    active_readers: AtomicU32,
    /// Writers blocked waiting for the lock.
    write_waiters: AtomicU32,
    /// TID of the active writer, `NO_THREAD` when the write side is free.
    writer_tid: AtomicU32,
    flags: AtomicU32,
    readers_cv: Cond,
    writers_cv: Cond,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    /// A private read-write lock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_attributes(RwLockAttributes::default())
    }

    /// A read-write lock with explicit attributes.
    #[must_use]
    pub fn with_attributes(attrs: RwLockAttributes) -> Self {
        let mutex_attrs = MutexAttributes {
            scope: attrs.scope,
            ..MutexAttributes::default()
        };
        let cond_attrs = CondAttributes {
            scope: attrs.scope,
            ..CondAttributes::default()
        };
        Self {
            // Default attributes are always constructible.
            inner: Mutex::with_attributes(mutex_attrs)
                .unwrap_or_else(|_| unreachable!("normal mutex attributes are valid")),
            active_readers: AtomicU32::new(0),
            write_waiters: AtomicU32::new(0),
            writer_tid: AtomicU32::new(NO_THREAD),
            flags: AtomicU32::new(0),
            readers_cv: Cond::with_attributes(cond_attrs),
            writers_cv: Cond::with_attributes(cond_attrs),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.flags.load(Ordering::Acquire) & FLAG_DESTROYED != 0 {
            return Err(SyncError::Invalid("rwlock has been destroyed"));
        }
        Ok(())
    }

    fn wait_step(&self, cv: &Cond, deadline: Option<&Deadline>) -> Result<()> {
        match deadline {
            Some(deadline) => cv.wait_deadline(&self.inner, deadline),
            None => cv.wait(&self.inner),
        }
    }

    /// Acquire the read side, blocking while a writer is active or queued.
    pub fn read_lock(&self) -> Result<()> {
        self.read_lock_inner(None)
    }

    /// Acquire the read side or fail with [`SyncError::Timeout`] at `deadline`.
    pub fn read_lock_deadline(&self, deadline: &Deadline) -> Result<()> {
        self.read_lock_inner(Some(deadline))
    }

    fn read_lock_inner(&self, deadline: Option<&Deadline>) -> Result<()> {
        self.check_live()?;
        let me = thread_id();
        self.inner.lock()?;
        loop {
            if self.writer_tid.load(Ordering::Relaxed) == me {
                self.inner.unlock()?;
                return Err(SyncError::Misuse(
                    "read lock while holding the write side",
                ));
            }
            if self.writer_tid.load(Ordering::Relaxed) == NO_THREAD
                && self.write_waiters.load(Ordering::Relaxed) == 0
            {
                let readers = self.active_readers.load(Ordering::Relaxed);
                self.active_readers.store(readers + 1, Ordering::Relaxed);
                self.inner.unlock()?;
                return Ok(());
            }
            if let Err(err) = self.wait_step(&self.readers_cv, deadline) {
                self.inner.unlock()?;
                return Err(err);
            }
        }
    }

    /// Acquire the read side without blocking; [`SyncError::Busy`] if a
    /// writer is active or queued.
    pub fn try_read_lock(&self) -> Result<()> {
        self.check_live()?;
        self.inner.lock()?;
        let admitted = self.writer_tid.load(Ordering::Relaxed) == NO_THREAD
            && self.write_waiters.load(Ordering::Relaxed) == 0;
        if admitted {
            let readers = self.active_readers.load(Ordering::Relaxed);
            self.active_readers.store(readers + 1, Ordering::Relaxed);
        }
        self.inner.unlock()?;
        if admitted { Ok(()) } else { Err(SyncError::Busy) }
    }

    /// Acquire the write side, blocking until all readers and any earlier
    /// writer have released.
    pub fn write_lock(&self) -> Result<()> {
        self.write_lock_inner(None)
    }

    /// Acquire the write side or fail with [`SyncError::Timeout`] at `deadline`.
    pub fn write_lock_deadline(&self, deadline: &Deadline) -> Result<()> {
        self.write_lock_inner(Some(deadline))
    }

    fn write_lock_inner(&self, deadline: Option<&Deadline>) -> Result<()> {
        self.check_live()?;
        let me = thread_id();
        self.inner.lock()?;
        if self.writer_tid.load(Ordering::Relaxed) == me {
            self.inner.unlock()?;
            return Err(SyncError::Misuse("write lock while already the writer"));
        }
        let waiters = self.write_waiters.load(Ordering::Relaxed);
        self.write_waiters.store(waiters + 1, Ordering::Relaxed);
        loop {
            if self.writer_tid.load(Ordering::Relaxed) == NO_THREAD
                && self.active_readers.load(Ordering::Relaxed) == 0
            {
                let waiters = self.write_waiters.load(Ordering::Relaxed);
                self.write_waiters.store(waiters - 1, Ordering::Relaxed);
                self.writer_tid.store(me, Ordering::Relaxed);
                self.inner.unlock()?;
                return Ok(());
            }
            if let Err(err) = self.wait_step(&self.writers_cv, deadline) {
                let waiters = self.write_waiters.load(Ordering::Relaxed);
                self.write_waiters.store(waiters - 1, Ordering::Relaxed);
                if waiters == 1 {
                    // Last queued writer gave up: readers may flow again.
                    self.readers_cv.broadcast()?;
                }
                self.inner.unlock()?;
                return Err(err);
            }
        }
    }

    /// Acquire the write side without blocking; [`SyncError::Busy`] if any
    /// reader or writer holds the lock.
    pub fn try_write_lock(&self) -> Result<()> {
        self.check_live()?;
        let me = thread_id();
        self.inner.lock()?;
        let admitted = self.writer_tid.load(Ordering::Relaxed) == NO_THREAD
            && self.active_readers.load(Ordering::Relaxed) == 0;
        if admitted {
            self.writer_tid.store(me, Ordering::Relaxed);
        }
        self.inner.unlock()?;
        if admitted { Ok(()) } else { Err(SyncError::Busy) }
    }

    /// Release the lock, whichever side the caller holds.
    ///
    /// A writer release prefers queued writers; the last reader out wakes a
    /// queued writer. Releasing an unheld lock is a contract violation.
    pub fn unlock(&self) -> Result<()> {
        self.check_live()?;
        let me = thread_id();
        self.inner.lock()?;
        if self.writer_tid.load(Ordering::Relaxed) == me {
            self.writer_tid.store(NO_THREAD, Ordering::Relaxed);
            if self.write_waiters.load(Ordering::Relaxed) > 0 {
                self.writers_cv.signal()?;
            } else {
                self.readers_cv.broadcast()?;
            }
        } else {
            let readers = self.active_readers.load(Ordering::Relaxed);
            if readers == 0 {
                self.inner.unlock()?;
                return Err(SyncError::Misuse("unlock of an unheld rwlock"));
            }
            self.active_readers.store(readers - 1, Ordering::Relaxed);
            if readers == 1 && self.write_waiters.load(Ordering::Relaxed) > 0 {
                self.writers_cv.signal()?;
            }
        }
        self.inner.unlock()
    }

    /// Tear the lock down. Fails with [`SyncError::Misuse`] while held or
    /// while writers are queued.
    pub fn destroy(&self) -> Result<()> {
        self.check_live()?;
        self.inner.lock()?;
        let in_use = self.writer_tid.load(Ordering::Relaxed) != NO_THREAD
            || self.active_readers.load(Ordering::Relaxed) != 0
            || self.write_waiters.load(Ordering::Relaxed) != 0;
        if in_use {
            self.inner.unlock()?;
            return Err(SyncError::Misuse("destroy of a held rwlock"));
        }
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
        self.inner.unlock()
    }
}
