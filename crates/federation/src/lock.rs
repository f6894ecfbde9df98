//! Process-wide per-IRI locks.
//!
//! Every read-then-write of a resource goes through [`LockTable::acquire`]
//! on that resource's IRI. The returned [`IriGuard`] releases on drop, and
//! the table forgets keys nobody holds or waits on. Locks are not
//! re-entrant: acquiring an IRI the caller already holds deadlocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use url::Url;

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Map of IRI string to mutex.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    slots: Slots,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `iri`.
    pub async fn acquire(&self, iri: &Url) -> IriGuard {
        let key = iri.as_str().to_string();
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        IriGuard {
            key,
            guard: Some(guard),
            slots: self.slots.clone(),
        }
    }

    /// Number of IRIs currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one IRI.
#[derive(Debug)]
pub struct IriGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl IriGuard {
    #[must_use]
    pub fn iri(&self) -> &str {
        &self.key
    }
}

impl Drop for IriGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // The map's own reference is the last one once nobody waits.
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn iri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_guard_releases_and_forgets_key() {
        let table = LockTable::new();
        let guard = table.acquire(&iri("https://a.example/inbox")).await;
        assert_eq!(table.len(), 1);
        assert_eq!(guard.iri(), "https://a.example/inbox");
        drop(guard);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_iris_do_not_block() {
        let table = LockTable::new();
        let _a = table.acquire(&iri("https://a.example/1")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            table.acquire(&iri("https://a.example/2")),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_same_iri_is_exclusive() {
        let table = LockTable::new();
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let table = table.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                let _guard = table.acquire(&iri("https://a.example/outbox")).await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(table.is_empty());
    }
}
