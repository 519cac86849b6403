//! The UDP NAT table (spec §4.1): single-flight dial coordination keyed by
//! the TUN-side source `ip:port`.

use crate::conn::PacketConn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::Notify;

enum NatSlot {
    Live(Arc<dyn PacketConn>),
    Pending(Arc<Notify>),
}

/// Outcome of [`NatTable::try_create_lock`].
#[derive(Debug, PartialEq, Eq)]
pub enum LockAttempt {
    /// No pending lock existed; caller installed one and must dial, then
    /// call [`NatTable::release_lock`].
    Creator,
    /// A pending lock already existed; caller must await
    /// [`NatTable::wait_for_release`] before retrying the fast path.
    Waiter,
}

/// Lock-free lookups, atomic `try_create_lock` for insertions, plain
/// `delete` for removals — the table itself never holds its lock across a
/// caller's dial or I/O.
#[derive(Default)]
pub struct NatTable {
    entries: Mutex<FxHashMap<Arc<str>, NatSlot>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live outbound conn for `key`, if any, without removing it.
    pub fn get(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        match self.entries.lock().get(key) {
            Some(NatSlot::Live(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    /// Overwrites or inserts a live entry for `key`.
    pub fn set(&self, key: &str, conn: Arc<dyn PacketConn>) {
        self.entries.lock().insert(Arc::from(key), NatSlot::Live(conn));
    }

    /// Removes the live entry for `key`, if present.
    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Atomically installs a pending lock for `key` if none exists yet.
    /// See [`LockAttempt`] for how the caller should proceed.
    pub fn try_create_lock(&self, key: &str) -> LockAttempt {
        let lock_key = lock_key_for(key);
        let mut guard = self.entries.lock();
        if matches!(guard.get(lock_key.as_ref()), Some(NatSlot::Pending(_))) {
            return LockAttempt::Waiter;
        }
        guard.insert(lock_key, NatSlot::Pending(Arc::new(Notify::new())));
        LockAttempt::Creator
    }

    /// Waits for the pending lock on `key` to be released. Returns
    /// immediately if no pending lock exists (it may already have been
    /// released by the time the caller gets here).
    ///
    /// Registers interest in the notification — via `Notified::enable` —
    /// while still holding the table's own lock, so a concurrent
    /// `release_lock` (which needs that same lock to remove the entry)
    /// can never run its `notify_waiters` before we're listening. Without
    /// this, `notify_waiters` only wakes futures that have already been
    /// polled at least once, and the creator can finish releasing and
    /// broadcasting on another worker thread before this task has even
    /// constructed its `Notified` future — a lost wakeup that hangs this
    /// task forever.
    pub async fn wait_for_release(&self, key: &str) {
        let lock_key = lock_key_for(key);
        let guard = self.entries.lock();
        let notify = match guard.get(lock_key.as_ref()) {
            Some(NatSlot::Pending(notify)) => notify.clone(),
            _ => return,
        };
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        notified.await;
    }

    /// Removes the pending lock for `key` and wakes every waiter blocked
    /// on it. Called by the lock's creator before dialing, so waiters
    /// never stall on a slow dial (spec §9).
    pub fn release_lock(&self, key: &str) {
        let lock_key = lock_key_for(key);
        let notify = {
            let mut guard = self.entries.lock();
            match guard.remove(lock_key.as_ref()) {
                Some(NatSlot::Pending(notify)) => Some(notify),
                _ => None,
            }
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    #[cfg(test)]
    fn has_lock(&self, key: &str) -> bool {
        let lock_key = lock_key_for(key);
        matches!(
            self.entries.lock().get(lock_key.as_ref()),
            Some(NatSlot::Pending(_))
        )
    }
}

fn lock_key_for(key: &str) -> Arc<str> {
    Arc::from(format!("{key}-lock"))
}
