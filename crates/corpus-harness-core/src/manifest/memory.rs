//! In-memory [`ManifestStore`] for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{DocumentStatus, ManifestEntry};

use super::ManifestStore;

#[derive(Default)]
pub struct InMemoryManifestStore {
    entries: RwLock<HashMap<String, ManifestEntry>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory manifest lock poisoned")
}

fn sorted(mut entries: Vec<ManifestEntry>) -> Vec<ManifestEntry> {
    entries.sort_by(|a, b| a.filename.cmp(&b.filename));
    entries
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn get(&self, id: &str) -> Result<Option<ManifestEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(id).filter(|e| !e.is_tombstoned()).cloned())
    }

    async fn upsert(&self, entry: &ManifestEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get_mut(id) {
            Some(entry) if !entry.is_tombstoned() => {
                let now = Utc::now();
                entry.removed_at = Some(now);
                entry.status = DocumentStatus::Removed;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_all(&self) -> Result<Vec<ManifestEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(sorted(
            entries
                .values()
                .filter(|e| !e.is_tombstoned())
                .cloned()
                .collect(),
        ))
    }

    async fn history(&self) -> Result<Vec<ManifestEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(sorted(entries.values().cloned().collect()))
    }
}
