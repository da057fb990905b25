//! Replica access token cache
//!
//! Parallel writers to the same replica must share the token the server
//! issued to the first opener. Entries are keyed by (absolute path, user)
//! and reference counted; the last close evicts the entry. Callers that
//! need several operations to be atomic (open-or-claim, close-then-finalize)
//! hold the per-key lock from [`ReplicaTokenCacheManager::obtain_lock`]
//! around them. Locks for unrelated keys are independent.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Lock map size below which dead entries are left alone
const PRUNE_FLOOR: usize = 64;

/// Cache key: absolute logical path plus user name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaTokenKey {
    path: String,
    user_name: String,
}

impl ReplicaTokenKey {
    pub fn new(path: impl Into<String>, user_name: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let user_name = user_name.into();
        if !path.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "replica token path must be absolute: '{}'",
                path
            )));
        }
        if user_name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "replica token user name is empty".into(),
            ));
        }
        Ok(Self { path, user_name })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }
}

impl fmt::Display for ReplicaTokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_name, self.path)
    }
}

/// Snapshot of a cached token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTokenEntry {
    pub token: String,
    pub replica_number: i64,
    pub ref_count: u32,
}

/// Lock handle for one key; keeps the key's lock alive while held
pub type ReplicaTokenLock = Arc<AsyncMutex<()>>;

/// Weak per-key locks. Dead entries are swept when the map doubles past
/// the size it had after the previous sweep.
#[derive(Debug)]
struct LockTable {
    locks: HashMap<ReplicaTokenKey, Weak<AsyncMutex<()>>>,
    prune_at: usize,
}

impl Default for LockTable {
    fn default() -> Self {
        Self {
            locks: HashMap::new(),
            prune_at: PRUNE_FLOOR,
        }
    }
}

impl LockTable {
    fn prune_if_grown(&mut self) {
        if self.locks.len() < self.prune_at {
            return;
        }
        self.locks.retain(|_, weak| weak.strong_count() > 0);
        self.prune_at = (self.locks.len() * 2).max(PRUNE_FLOOR);
    }
}

#[derive(Debug, Default)]
pub struct ReplicaTokenCacheManager {
    entries: DashMap<ReplicaTokenKey, ReplicaTokenEntry>,
    locks: Mutex<LockTable>,
}

impl ReplicaTokenCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-key lock. The same lock is returned for a key while any handle
    /// to it is alive; dropped locks are pruned as the table grows.
    pub fn obtain_lock(&self, key: &ReplicaTokenKey) -> ReplicaTokenLock {
        let mut table = self.locks.lock();
        if let Some(lock) = table.locks.get(key).and_then(|weak| weak.upgrade()) {
            return lock;
        }
        table.prune_if_grown();
        let lock = Arc::new(AsyncMutex::new(()));
        table.locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for the key's lock
    pub async fn lock(&self, key: &ReplicaTokenKey) -> OwnedMutexGuard<()> {
        self.obtain_lock(key).lock_owned().await
    }

    /// Wait at most `timeout` for the key's lock
    pub async fn try_lock(
        &self,
        key: &ReplicaTokenKey,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>> {
        let lock = self.obtain_lock(key);
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| Error::LockTimeout(key.to_string()))
    }

    /// Cache a freshly issued token with `ref_count` open references
    pub fn add_replica_token(
        &self,
        key: &ReplicaTokenKey,
        token: impl Into<String>,
        replica_number: i64,
        ref_count: u32,
    ) -> Result<()> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::InvalidArgument("replica token is empty".into()));
        }
        if ref_count == 0 {
            return Err(Error::InvalidArgument(
                "initial reference count must be at least 1".into(),
            ));
        }
        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateReplicaToken(key.to_string())),
            Entry::Vacant(slot) => {
                debug!(key = %key, replica_number, ref_count, "Cached replica token");
                slot.insert(ReplicaTokenEntry {
                    token,
                    replica_number,
                    ref_count,
                });
                Ok(())
            }
        }
    }

    /// Take another reference to a cached token. `None` when the key is
    /// absent or its reference count is saturated.
    pub fn claim_existing_replica_token(&self, key: &ReplicaTokenKey) -> Option<ReplicaTokenEntry> {
        let mut entry = self.entries.get_mut(key)?;
        match entry.ref_count.checked_add(1) {
            Some(count) => {
                entry.ref_count = count;
                Some(entry.value().clone())
            }
            None => {
                warn!(key = %key, "Replica token reference count saturated");
                None
            }
        }
    }

    /// Release one reference. True exactly when this was the last one, in
    /// which case the entry is evicted. Unknown keys return false.
    pub fn close_replica_token(&self, key: &ReplicaTokenKey) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    slot.remove();
                    debug!(key = %key, "Evicted replica token");
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Whether exactly one reference remains
    pub fn is_final_reference(&self, key: &ReplicaTokenKey) -> bool {
        self.entries
            .get(key)
            .map(|e| e.ref_count == 1)
            .unwrap_or(false)
    }

    pub fn get_entry(&self, key: &ReplicaTokenKey) -> Option<ReplicaTokenEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> ReplicaTokenKey {
        ReplicaTokenKey::new(path, "alice").unwrap()
    }

    #[test]
    fn test_key_validation() {
        assert!(ReplicaTokenKey::new("relative/path", "alice").is_err());
        assert!(ReplicaTokenKey::new("/z/home/alice/f", "").is_err());
        let k = key("/z/home/alice/f");
        assert_eq!(k.path(), "/z/home/alice/f");
        assert_eq!(k.user_name(), "alice");
    }

    #[test]
    fn test_claim_and_close_counts() {
        let cache = ReplicaTokenCacheManager::new();
        let k = key("/z/home/alice/data.bin");

        cache.add_replica_token(&k, "tok-1", 0, 1).unwrap();
        assert!(cache.is_final_reference(&k));

        let claimed = cache.claim_existing_replica_token(&k).unwrap();
        assert_eq!(claimed.token, "tok-1");
        assert_eq!(claimed.ref_count, 2);
        cache.claim_existing_replica_token(&k).unwrap();
        assert!(!cache.is_final_reference(&k));

        assert!(!cache.close_replica_token(&k));
        assert!(!cache.close_replica_token(&k));
        assert!(cache.close_replica_token(&k));
        assert!(cache.get_entry(&k).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_close_unknown_key() {
        let cache = ReplicaTokenCacheManager::new();
        assert!(!cache.close_replica_token(&key("/never/added")));
        assert!(cache.claim_existing_replica_token(&key("/never/added")).is_none());
        assert!(!cache.is_final_reference(&key("/never/added")));
    }

    #[test]
    fn test_add_errors() {
        let cache = ReplicaTokenCacheManager::new();
        let k = key("/z/f");
        assert!(matches!(
            cache.add_replica_token(&k, "", 0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.add_replica_token(&k, "tok", 0, 0),
            Err(Error::InvalidArgument(_))
        ));
        cache.add_replica_token(&k, "tok", 2, 1).unwrap();
        assert!(matches!(
            cache.add_replica_token(&k, "other", 0, 1),
            Err(Error::DuplicateReplicaToken(_))
        ));
        assert_eq!(cache.get_entry(&k).unwrap().replica_number, 2);
    }

    #[test]
    fn test_same_lock_for_same_key() {
        let cache = ReplicaTokenCacheManager::new();
        let a = cache.obtain_lock(&key("/z/a"));
        let a2 = cache.obtain_lock(&key("/z/a"));
        let b = cache.obtain_lock(&key("/z/b"));
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_dropped_locks_are_pruned() {
        let cache = ReplicaTokenCacheManager::new();
        let held = cache.obtain_lock(&key("/z/held"));
        for i in 0..PRUNE_FLOOR {
            drop(cache.obtain_lock(&key(&format!("/z/dropped-{}", i))));
        }
        // the sweep ran on the insert that reached the floor
        let table = cache.locks.lock();
        assert!(table.locks.len() < PRUNE_FLOOR);
        assert!(table.locks.contains_key(&key("/z/held")));
        assert_eq!(table.prune_at, PRUNE_FLOOR);
        drop(table);

        // a live lock survives sweeps and is handed out again
        assert!(Arc::ptr_eq(&held, &cache.obtain_lock(&key("/z/held"))));
    }

    #[test]
    fn test_small_table_is_not_swept() {
        let cache = ReplicaTokenCacheManager::new();
        drop(cache.obtain_lock(&key("/z/a")));
        let _b = cache.obtain_lock(&key("/z/b"));
        assert_eq!(cache.locks.lock().locks.len(), 2);

        // a dead entry is replaced, not reused
        let a = cache.obtain_lock(&key("/z/a"));
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_claim_at_saturated_count() {
        let cache = ReplicaTokenCacheManager::new();
        let k = key("/z/busy");
        cache.add_replica_token(&k, "tok", 0, u32::MAX).unwrap();

        assert!(cache.claim_existing_replica_token(&k).is_none());
        assert_eq!(cache.get_entry(&k).unwrap().ref_count, u32::MAX);
        assert!(!cache.close_replica_token(&k));
    }

    #[tokio::test]
    async fn test_try_lock_times_out() {
        let cache = ReplicaTokenCacheManager::new();
        let k = key("/z/contended");
        let _held = cache.lock(&k).await;

        let err = cache
            .try_lock(&k, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        // unrelated keys never contend
        let other = cache
            .try_lock(&key("/z/free"), Duration::from_millis(20))
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_claims() {
        let cache = Arc::new(ReplicaTokenCacheManager::new());
        let k = key("/z/shared");
        cache.add_replica_token(&k, "tok", 0, 1).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let _guard = cache.lock(&k).await;
                cache.claim_existing_replica_token(&k).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.get_entry(&k).unwrap().ref_count, 17);

        let mut last = 0;
        for _ in 0..17 {
            if cache.close_replica_token(&k) {
                last += 1;
            }
        }
        assert_eq!(last, 1);
    }
}
