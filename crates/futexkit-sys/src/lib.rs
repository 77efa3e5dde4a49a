//! # futexkit-sys
//!
//! Host collaborator layer for the futexkit synchronization primitives.
//!
//! Everything the primitives need from the kernel lives here: the futex
//! "block while this word equals X" / "wake up to N waiters" calls, a stable
//! thread identity that is meaningful across process boundaries, a liveness
//! probe for robust-mutex owner detection, and absolute-deadline arithmetic
//! over the monotonic and wall clocks.
//!
//! This crate owns the libc boundary; the `futexkit-core` crate above it
//! contains no raw syscalls.

pub mod clock;
pub mod futex;
pub mod thread_id;

pub use clock::Deadline;
pub use futex::{Scope, WaitOutcome, wait, wait_until, wake, wake_all};
pub use thread_id::{thread_alive, thread_id};
