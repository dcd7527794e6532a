//! Per-key exclusion for cache writers.
//!
//! Two requests resolving to the same [`CacheKey`] must not both encode
//! into the same entry. The first one takes the key's lock and keeps it
//! until its entry is committed or discarded; later ones wait, then find
//! the committed entry and read it as a hit.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::command::CacheKey;

type Table = Arc<Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Clone, Default)]
pub(crate) struct KeyLocks {
    table: Table,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and takes it.
    ///
    /// Dropping the returned future gives up the wait without side effects.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            table: self.table.clone(),
            guard: Some(guard),
        }
    }

    /// True while some request holds `key`.
    pub fn is_held(&self, key: &CacheKey) -> bool {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.get(key).is_some_and(|slot| slot.try_lock().is_err())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive hold on one key, released on drop.
#[derive(Debug)]
pub(crate) struct KeyGuard {
    key: CacheKey,
    table: Table,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        // Nobody else is waiting: the table and this guard held the only handles.
        if let Some(slot) = table.get(&self.key) {
            if Arc::strong_count(slot) <= 1 {
                table.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::resolve, profile::Profile};
    use std::{path::Path, time::Duration};

    fn key(input: &str) -> CacheKey {
        let profile = Profile::new("audio/test", "test", 0, "sh <file>");
        resolve(&profile, Path::new(input)).unwrap().cache_key()
    }

    #[tokio::test]
    async fn second_holder_waits_for_the_first() {
        let locks = KeyLocks::new();
        let k = key("/a");

        let first = locks.lock(&k).await;
        assert!(locks.is_held(&k));

        let pending = tokio::time::timeout(Duration::from_millis(50), locks.lock(&k)).await;
        assert!(pending.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), locks.lock(&k))
            .await
            .unwrap();
        assert!(locks.is_held(&k));
        drop(second);
        assert!(!locks.is_held(&k));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&key("/a")).await;
        let _b = tokio::time::timeout(Duration::from_secs(5), locks.lock(&key("/b")))
            .await
            .unwrap();
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let locks = KeyLocks::new();
        let k = key("/a");
        drop(locks.lock(&k).await);
        assert_eq!(locks.tracked(), 0);
    }
}
