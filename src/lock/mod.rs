//! Distributed mutual exclusion over a shared store.
//!
//! A lock is a single store key written with set-if-absent and guarded by a
//! TTL, so a holder that crashes cannot wedge other processes forever.
//! Blocking acquisition is further bounded by a safety time after which the
//! key is taken over unconditionally: liveness wins over strict exclusion.
//!
//! Critical sections should use the scoped forms ([`DistributedLock::acquire`],
//! [`DistributedLock::with_lock`]) so the key is released on every exit path.

mod distributed;
mod guard;

pub use distributed::{DistributedLock, DEFAULT_POLL_INTERVAL};
pub use guard::LockGuard;
