//! Advisory cooldown locks.
//!
//! A lock marks a metric, parameter, or `(file, location)` pair as "already
//! in testing": acquired when a proposal enters safety-gated processing,
//! released explicitly when its effect is confirmed or judged, and expiring
//! naturally after the cooldown otherwise. Failed patches keep their lock —
//! that is what prevents hot-retry loops.
//!
//! Single-node by design: an in-process map behind an `RwLock`, no
//! file-backed read-then-write. Concurrent readers are fine; writes are
//! serialized by the guard.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

/// Composite key for a file+location lock.
pub fn location_key(file: &str, location_value: &str) -> String {
    format!("{}::{}", file, location_value)
}

/// Cooldown lock table keyed by metric/parameter name or composite
/// [`location_key`].
pub struct LockManager {
    cooldown: Duration,
    locks: RwLock<HashMap<String, u64>>,
}

impl LockManager {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Stamp `key` as locked from now.
    pub fn acquire(&self, key: &str) {
        self.acquire_at(key, now_epoch_secs());
    }

    fn acquire_at(&self, key: &str, now: u64) {
        if let Ok(mut guard) = self.locks.write() {
            guard.insert(key.to_string(), now);
            info!(target: "autopatch::locks", key, "lock acquired");
        }
    }

    /// True while the cooldown window for `key` is still open.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locked_at(key, now_epoch_secs())
    }

    fn locked_at(&self, key: &str, now: u64) -> bool {
        let Ok(guard) = self.locks.read() else {
            return false;
        };
        match guard.get(key) {
            Some(stamp) => now.saturating_sub(*stamp) < self.cooldown.as_secs(),
            None => false,
        }
    }

    /// Explicitly clear a lock (confirmation or judgement reached).
    /// Returns whether an entry existed.
    pub fn release(&self, key: &str) -> bool {
        let removed = self
            .locks
            .write()
            .map(|mut g| g.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            info!(target: "autopatch::locks", key, "lock released");
        }
        removed
    }

    /// Snapshot of all entries, expired ones included.
    pub fn active(&self) -> Vec<(String, u64)> {
        self.locks
            .read()
            .map(|g| g.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_window_boundaries() {
        let mgr = LockManager::new(Duration::from_secs(100));
        mgr.acquire_at("WINRATE", 1_000);
        assert!(mgr.locked_at("WINRATE", 1_000));
        assert!(mgr.locked_at("WINRATE", 1_099));
        assert!(!mgr.locked_at("WINRATE", 1_101));
    }

    #[test]
    fn unknown_key_is_unlocked() {
        let mgr = LockManager::new(Duration::from_secs(100));
        assert!(!mgr.is_locked("NOPE"));
    }

    #[test]
    fn release_clears_before_expiry() {
        let mgr = LockManager::new(Duration::from_secs(100));
        mgr.acquire_at("MAX_DRAWDOWN", 1_000);
        assert!(mgr.locked_at("MAX_DRAWDOWN", 1_010));
        assert!(mgr.release("MAX_DRAWDOWN"));
        assert!(!mgr.locked_at("MAX_DRAWDOWN", 1_010));
        assert!(!mgr.release("MAX_DRAWDOWN"));
    }

    #[test]
    fn reacquire_restarts_the_window() {
        let mgr = LockManager::new(Duration::from_secs(100));
        mgr.acquire_at("K", 1_000);
        mgr.acquire_at("K", 1_090);
        assert!(mgr.locked_at("K", 1_150));
        assert!(!mgr.locked_at("K", 1_191));
    }

    #[test]
    fn composite_key_shape() {
        assert_eq!(location_key("logic/entry.py", "42"), "logic/entry.py::42");
    }
}
