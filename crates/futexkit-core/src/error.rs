//! Error taxonomy shared by every primitive.
//!
//! Contention ([`SyncError::Busy`]) and deadline expiry
//! ([`SyncError::Timeout`]) are ordinary results a caller handles in its
//! retry loop. [`SyncError::OwnerDied`] is always reported because the
//! protected data may be inconsistent. The remaining variants mark caller
//! mistakes or resource exhaustion.

use thiserror::Error;

/// Result alias used throughout futexkit-core.
pub type Result<T> = core::result::Result<T, SyncError>;

/// Outcome classification for failed synchronization operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// A try-variant found the primitive held by someone else.
    #[error("primitive is currently held")]
    Busy,

    /// The absolute deadline elapsed before the operation completed.
    #[error("deadline elapsed")]
    Timeout,

    /// Malformed argument or operation on a destroyed primitive.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Contract violation detected in a checking configuration.
    #[error("contract violation: {0}")]
    Misuse(&'static str),

    /// Robust mutex only: the previous owner terminated while holding the
    /// lock. The protected state may be inconsistent; call
    /// `make_consistent` before the mutex can be locked again.
    #[error("previous owner terminated while holding the lock")]
    OwnerDied,

    /// A process-wide resource limit was reached.
    #[error("resource limit reached: {0}")]
    Exhausted(&'static str),
}
