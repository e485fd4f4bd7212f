//! Keyed in-flight guard.
//!
//! Prevents two logically identical requests (for example two
//! "fetch-or-create conversation with peer X" calls) from being on the wire
//! at once. A key is held by an [`InFlightGuard`]; dropping the guard
//! releases the key on every exit path, including `?` and panics.
//!
//! The lock is owned by whichever controller needs it and cloned into the
//! tasks that share it. It is not a process-wide singleton.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

#[derive(Clone, Default)]
pub struct InFlightLock {
    held: Arc<Mutex<HashMap<String, watch::Sender<()>>>>,
}

/// Outcome of [`InFlightLock::acquire_or_wait`].
pub enum Acquire {
    Acquired(InFlightGuard),
    /// Someone else holds the key. Await [`ReleaseWaiter::released`] to
    /// learn when they are done.
    Busy(ReleaseWaiter),
}

impl InFlightLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<()>>> {
        // The map is always left consistent, so a poisoned lock is still usable.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the key if nobody holds it. `None` means the caller must not
    /// issue the guarded request.
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<InFlightGuard> {
        let key = key.into();
        let mut held = self.map();
        if held.contains_key(&key) {
            return None;
        }
        let (tx, _rx) = watch::channel(());
        held.insert(key.clone(), tx);
        Some(InFlightGuard {
            lock: self.clone(),
            key,
        })
    }

    /// Take the key, or get a handle that resolves once the current holder
    /// releases it.
    pub fn acquire_or_wait(&self, key: impl Into<String>) -> Acquire {
        let key = key.into();
        let mut held = self.map();
        if let Some(tx) = held.get(&key) {
            return Acquire::Busy(ReleaseWaiter { rx: tx.subscribe() });
        }
        let (tx, _rx) = watch::channel(());
        held.insert(key.clone(), tx);
        Acquire::Acquired(InFlightGuard {
            lock: self.clone(),
            key,
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.map().contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.map().len()
    }

    fn release(&self, key: &str) {
        // Dropping the sender wakes every waiter.
        self.map().remove(key);
    }
}

#[must_use = "the key is released as soon as the guard is dropped"]
pub struct InFlightGuard {
    lock: InFlightLock,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard").field("key", &self.key).finish()
    }
}

pub struct ReleaseWaiter {
    rx: watch::Receiver<()>,
}

impl ReleaseWaiter {
    pub async fn released(mut self) {
        // Nothing is ever sent; `changed` errors once the sender is dropped.
        while self.rx.changed().await.is_ok() {}
    }
}
