//! Per-document mutual exclusion.
//!
//! Refinement, ingestion and pruning of one document never interleave; work
//! on different documents proceeds in parallel. Locks are created lazily and
//! shared by every component that mutates a manifest entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Default)]
pub struct DocumentLocks {
    slots: Arc<Slots>,
}

/// Held for the duration of one document operation. Dropping the last
/// guard for a document with no waiters frees its slot.
pub struct DocumentGuard {
    guard: Option<OwnedMutexGuard<()>>,
    document_id: String,
    slots: Arc<Slots>,
}

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    match slots.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, document_id: &str) -> Arc<AsyncMutex<()>> {
        lock_slots(&self.slots)
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn guard(&self, document_id: &str, guard: OwnedMutexGuard<()>) -> DocumentGuard {
        DocumentGuard {
            guard: Some(guard),
            document_id: document_id.to_string(),
            slots: self.slots.clone(),
        }
    }

    /// Wait for exclusive access to `document_id`.
    pub async fn lock(&self, document_id: &str) -> DocumentGuard {
        let slot = self.slot(document_id);
        let wait_start = Instant::now();
        let guard = slot.lock_owned().await;
        let wait_ms = wait_start.elapsed().as_millis() as u64;
        if wait_ms > 100 {
            tracing::debug!(document_id, wait_ms, "Waited for document lock");
        }
        self.guard(document_id, guard)
    }

    #[cfg(test)]
    fn try_lock(&self, document_id: &str) -> Option<DocumentGuard> {
        let guard = self.slot(document_id).try_lock_owned().ok()?;
        Some(self.guard(document_id, guard))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

/// Drop the slot for `document_id` when the map holds the only reference.
/// Clones are taken under the map lock, so a concurrent `lock` either sees
/// the slot before removal or creates a fresh one.
fn release_idle(slots: &Slots, document_id: &str) {
    let mut map = lock_slots(slots);
    if let Some(slot) = map.get(document_id) {
        if Arc::strong_count(slot) == 1 {
            map.remove(document_id);
        }
    }
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_idle(&self.slots, &self.document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_document_is_exclusive() {
        let locks = DocumentLocks::new();
        let held = locks.lock("a").await;
        assert!(locks.try_lock("a").is_none());
        assert!(locks.try_lock("b").is_some());
        drop(held);
        assert!(locks.try_lock("a").is_some());
    }

    #[tokio::test]
    async fn test_idle_slots_are_released() {
        let locks = DocumentLocks::new();
        for i in 0..50 {
            let _g = locks.lock(&format!("missing-{}", i)).await;
        }
        assert_eq!(locks.len(), 0);

        let held = locks.lock("a").await;
        assert!(locks.try_lock("a").is_none());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_slot_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(DocumentLocks::new());
        let held = locks.lock("a").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("a").await;
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_no_overlap_under_contention() {
        let locks = Arc::new(DocumentLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock("doc").await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
    }
}
