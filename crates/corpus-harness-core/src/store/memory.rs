//! In-memory [`CorpusStore`] implementation for tests.
//!
//! All chunk sets live in one `HashMap` behind a single `RwLock`, so a
//! replace swaps the whole `Vec` for a document under one write guard and a
//! concurrent reader sees either the old set or the new one.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::Chunk;

use super::{CorpusStore, StoreCounts};

/// In-memory chunk store.
#[derive(Default)]
pub struct InMemoryCorpusStore {
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
}

impl InMemoryCorpusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory corpus store lock poisoned")
}

#[async_trait]
impl CorpusStore for InMemoryCorpusStore {
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut ordered = chunks.to_vec();
        ordered.sort_by_key(|c| c.chunk_index);
        let mut map = self.chunks.write().map_err(poisoned)?;
        if ordered.is_empty() {
            map.remove(document_id);
        } else {
            map.insert(document_id.to_string(), ordered);
        }
        Ok(())
    }

    async fn delete_chunks_for_document(&self, document_id: &str) -> Result<u64> {
        let mut map = self.chunks.write().map_err(poisoned)?;
        Ok(map.remove(document_id).map(|v| v.len() as u64).unwrap_or(0))
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let map = self.chunks.read().map_err(poisoned)?;
        Ok(map.get(document_id).cloned().unwrap_or_default())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let map = self.chunks.read().map_err(poisoned)?;
        let chunks = map.values().map(|v| v.len() as u64).sum();
        let embedded_chunks = map
            .values()
            .flatten()
            .filter(|c| !c.embedding.is_empty())
            .count() as u64;
        Ok(StoreCounts {
            documents: map.len() as u64,
            chunks,
            embedded_chunks,
        })
    }
}
