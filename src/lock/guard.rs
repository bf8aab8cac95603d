//! Scoped ownership of a held lock.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::Store;

/// A held distributed lock.
///
/// Call [`LockGuard::release`] to unlock and observe store errors. A guard
/// dropped without release (early return, panic, cancelled future) deletes
/// the key from a background task on the current tokio runtime; outside a
/// runtime the key is left to expire through its TTL.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    store: Arc<dyn Store>,
    key: String,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(store: Arc<dyn Store>, key: String) -> Self {
        Self {
            store,
            key,
            released: false,
        }
    }

    /// The lock key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unlock now.
    pub async fn release(mut self) -> Result<()> {
        let result = self.store.delete(&self.key).await;
        self.released = true;
        debug!(key = %self.key, "Lock released");
        result.map(|_| ())
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "Lock guard dropped without release, unlocking");
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.delete(&key).await {
                        warn!(key = %key, error = %e, "Background unlock failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "Lock guard dropped outside a runtime, key left to expire");
            }
        }
    }
}
