//! Manifest store abstraction.
//!
//! The manifest is the durable mapping from document id to
//! [`ManifestEntry`]. Writes always replace the full entry; there are no
//! partial-field updates. Callers sequence writes for the same id (the
//! orchestrator holds a per-document lock), so last-writer-wins is safe.
//!
//! Removal tombstones rather than deletes: a removed entry disappears from
//! [`get`](ManifestStore::get) and [`list_all`](ManifestStore::list_all) but
//! remains visible through [`history`](ManifestStore::history). Upserting a
//! tombstoned id revives it.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ManifestEntry;

#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Live entry for `id`, or `None` if unknown or tombstoned.
    async fn get(&self, id: &str) -> Result<Option<ManifestEntry>>;

    /// Insert or fully replace the entry keyed by `entry.id`. Idempotent.
    async fn upsert(&self, entry: &ManifestEntry) -> Result<()>;

    /// Tombstone the entry for `id`. Returns `false` if no live entry existed.
    async fn remove(&self, id: &str) -> Result<bool>;

    /// All live entries, ordered by filename.
    async fn list_all(&self) -> Result<Vec<ManifestEntry>>;

    /// Every entry ever recorded, tombstones included, ordered by filename.
    async fn history(&self) -> Result<Vec<ManifestEntry>>;
}
