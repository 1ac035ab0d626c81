//! Corpus store abstraction.
//!
//! The [`CorpusStore`] trait is the read/write contract for chunk + embedding
//! rows. The ingestion pipeline never writes chunks one at a time: a
//! document's chunk set is replaced as a whole, so readers observe either the
//! complete old set or the complete new set.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`replace_chunks`](CorpusStore::replace_chunks) | Atomically supersede a document's chunk set |
//! | [`delete_chunks_for_document`](CorpusStore::delete_chunks_for_document) | Drop every chunk of a document |
//! | [`chunks_for_document`](CorpusStore::chunks_for_document) | Read a document's chunks in ordinal order |
//! | [`counts`](CorpusStore::counts) | Chunk and embedding totals |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Chunk;

/// Totals reported by [`CorpusStore::counts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub documents: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
}

#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Replace all chunks for `document_id` with `chunks`.
    ///
    /// Must be atomic from the caller's perspective: on error the previous
    /// chunk set is still in place.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Delete every chunk belonging to `document_id`. Returns the number of
    /// chunks removed.
    async fn delete_chunks_for_document(&self, document_id: &str) -> Result<u64>;

    /// Chunks for `document_id`, ordered by `chunk_index`.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn counts(&self) -> Result<StoreCounts>;
}
