use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::Ms;

/// Well above the expected commit time, but bounded so a crashed holder
/// cannot wedge a slot forever.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Lock key for one allocation attempt. Two different keys never contend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub staff_id: Ulid,
    pub date: NaiveDate,
    pub start: Ms,
}

/// Process-wide mutual-exclusion registry with set-if-absent-with-TTL
/// semantics. Injected into the engine so tests can substitute a fake; in
/// a multi-process deployment an external shared store takes this seat.
pub trait SlotLockRegistry: Send + Sync {
    /// Non-blocking set-if-absent. Returns true when the caller now holds
    /// the lock under `token`. An expired holder's entry may be taken over.
    fn try_acquire(&self, key: SlotKey, token: Ulid) -> bool;

    /// Release only while still held under `token` — a claim that outlived
    /// its TTL must not delete a successor's lock.
    fn release(&self, key: &SlotKey, token: Ulid);
}

struct LockEntry {
    token: Ulid,
    deadline: Instant,
}

/// In-memory `SlotLockRegistry` for single-process deployments.
pub struct TtlLockMap {
    entries: DashMap<SlotKey, LockEntry>,
    ttl: Duration,
}

impl TtlLockMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop entries whose TTL has elapsed. Returns how many were reaped.
    /// Purely hygienic: `try_acquire` already treats expired entries as
    /// absent, the sweep just keeps the map from accumulating them.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.deadline > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TtlLockMap {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl SlotLockRegistry for TtlLockMap {
    fn try_acquire(&self, key: SlotKey, token: Ulid) -> bool {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().deadline <= now {
                    occupied.insert(LockEntry {
                        token,
                        deadline: now + self.ttl,
                    });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    token,
                    deadline: now + self.ttl,
                });
                true
            }
        }
    }

    fn release(&self, key: &SlotKey, token: Ulid) {
        self.entries.remove_if(key, |_, e| e.token == token);
    }
}

/// RAII claim on a slot key. Dropping the claim releases the lock — the
/// guaranteed-cleanup path on success, failure, and panic alike.
pub struct SlotClaim {
    registry: Arc<dyn SlotLockRegistry>,
    key: SlotKey,
    token: Ulid,
}

impl SlotClaim {
    pub fn acquire(registry: &Arc<dyn SlotLockRegistry>, key: SlotKey) -> Option<Self> {
        let token = Ulid::new();
        registry.try_acquire(key, token).then(|| Self {
            registry: registry.clone(),
            key,
            token,
        })
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(start: Ms) -> SlotKey {
        SlotKey {
            staff_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            start,
        }
    }

    #[test]
    fn acquire_then_contend() {
        let map = TtlLockMap::default();
        let k = key(1000);
        assert!(map.try_acquire(k, Ulid::new()));
        assert!(!map.try_acquire(k, Ulid::new()));
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let map = TtlLockMap::default();
        assert!(map.try_acquire(key(1000), Ulid::new()));
        assert!(map.try_acquire(key(2000), Ulid::new()));
    }

    #[test]
    fn release_makes_key_available() {
        let map = TtlLockMap::default();
        let k = key(1000);
        let token = Ulid::new();
        assert!(map.try_acquire(k, token));
        map.release(&k, token);
        assert!(map.try_acquire(k, Ulid::new()));
    }

    #[test]
    fn expired_entry_can_be_taken_over() {
        let map = TtlLockMap::new(Duration::from_millis(10));
        let k = key(1000);
        assert!(map.try_acquire(k, Ulid::new()));
        assert!(!map.try_acquire(k, Ulid::new()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(map.try_acquire(k, Ulid::new()));
    }

    #[test]
    fn stale_release_does_not_clobber_successor() {
        let map = TtlLockMap::new(Duration::from_millis(10));
        let k = key(1000);
        let crashed = Ulid::new();
        assert!(map.try_acquire(k, crashed));
        std::thread::sleep(Duration::from_millis(20));

        let successor = Ulid::new();
        assert!(map.try_acquire(k, successor));
        map.release(&k, crashed); // the dead holder wakes up late
        assert!(!map.try_acquire(k, Ulid::new())); // successor still holds it
    }

    #[test]
    fn sweep_reaps_only_expired() {
        let map = TtlLockMap::new(Duration::from_millis(10));
        map.try_acquire(key(1000), Ulid::new());
        map.try_acquire(key(2000), Ulid::new());
        std::thread::sleep(Duration::from_millis(20));
        map.try_acquire(key(3000), Ulid::new()); // fresh

        assert_eq!(map.sweep_expired(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn claim_releases_on_drop() {
        let registry: Arc<dyn SlotLockRegistry> = Arc::new(TtlLockMap::default());
        let k = key(1000);
        {
            let claim = SlotClaim::acquire(&registry, k);
            assert!(claim.is_some());
            assert!(SlotClaim::acquire(&registry, k).is_none());
        }
        assert!(SlotClaim::acquire(&registry, k).is_some());
    }
}
