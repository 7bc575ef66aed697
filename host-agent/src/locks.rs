//! Process-wide per-key mutual exclusion (spec.md §3 "Lock table", §9).
//!
//! A mapping from string key to an exclusion flag, guarded by a master
//! mutex. `try_lock` is non-blocking: it returns a releasable guard on
//! success or `None` on contention — never an error, never a wait. Used
//! to serialize event handling per `(status, id)` (§4.7) without
//! blocking the dispatcher.
//!
//! Grounded in the general "shared state behind `Arc<Mutex<...>>>`,
//! constructed once and torn down on exit" pattern the teacher uses for
//! its own registries (`examples/clawde-io-apps/daemon/src/session/mod.rs`'s
//! `RwLock<HashMap<...>>`); this table's try/non-blocking semantics come
//! directly from spec.md and from `original_source`'s `locks.Lock(key)`
//! call sites in `events/start_handler.go` / `events/send_to_rancher_handler.go`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A releasable handle on a per-key lock. Dropping it releases the lock.
pub struct LockGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct LockTable {
    table: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire the lock for `key`. Returns `None` immediately
    /// on contention — the caller (an event handler) is expected to treat
    /// that as "another worker already owns this event" and return
    /// without error (spec.md §4.7).
    pub fn try_lock(&self, key: &str) -> Option<LockGuard> {
        let flag = {
            let mut table = self.table.lock().unwrap();
            table.entry(key.to_string()).or_default().clone()
        };

        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LockGuard { flag })
    }
}
