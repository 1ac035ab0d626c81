//! Ingestion: refined text into chunked, embedded corpus records.
//!
//! Per document: read the refined derivative, split it with the overlapping
//! chunker, embed in batches, then swap the document's whole chunk set in
//! one [`CorpusStore::replace_chunks`] call. Any failure before the swap
//! leaves the previous chunks authoritative.
//!
//! Embedding calls are bounded by a timeout and retried with exponential
//! backoff (`base × 2^(attempt-1)`, exponent capped at 5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};

use corpus_harness_core::chunk::{chunk_text, ChunkingPolicy};
use corpus_harness_core::embedding::EmbeddingProvider;
use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::models::{
    BatchSummary, Chunk, DocumentStatus, ErrorInfo, ErrorKind, ManifestEntry, ProcessingResult,
};
use corpus_harness_core::store::CorpusStore;

use crate::config::{Config, EmbeddingConfig};
use crate::error::{settle, PipelineError, PipelineResult};
use crate::locks::DocumentLocks;

/// Bounded retry for embedding calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Limit on a single embedding call.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            timeout: config.timeout(),
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5);
        self.base_delay * (1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub chunking: ChunkingPolicy,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Documents processed at once by [`IngestionPipeline::ingest_all`].
    pub concurrency: usize,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.policy(),
            batch_size: config.embedding.batch_size,
            retry: RetryPolicy::from_config(&config.embedding),
            concurrency: config.pipeline.concurrency,
        }
    }
}

pub struct IngestionPipeline {
    manifest: Arc<dyn ManifestStore>,
    store: Arc<dyn CorpusStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    locks: Arc<DocumentLocks>,
    settings: IngestSettings,
}

impl IngestionPipeline {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        store: Arc<dyn CorpusStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        locks: Arc<DocumentLocks>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            manifest,
            store,
            embedder,
            locks,
            settings,
        }
    }

    /// Chunk and embed one refined document under its document lock.
    pub async fn ingest_one(&self, document_id: &str) -> PipelineResult<ProcessingResult> {
        if document_id.trim().is_empty() {
            return Err(PipelineError::Input("document id must not be empty".into()));
        }
        if self.manifest.get(document_id).await?.is_none() {
            return Err(PipelineError::Input(format!(
                "unknown document id: '{}'",
                document_id
            )));
        }
        let _guard = self.locks.lock(document_id).await;
        self.ingest_locked(document_id).await
    }

    /// Ingest every live document that has a refined derivative, with at most
    /// `concurrency` in flight. Per-document failures land in the summary.
    pub async fn ingest_all(&self) -> PipelineResult<BatchSummary> {
        let candidates: Vec<ManifestEntry> = self
            .manifest
            .list_all()
            .await?
            .into_iter()
            .filter(|e| e.refined_fingerprint.is_some())
            .collect();
        let total = candidates.len();
        tracing::info!(total, "Ingesting refined documents");

        let results: Vec<ProcessingResult> = stream::iter(candidates.into_iter().map(|entry| {
            async move {
                let outcome = self.ingest_one(&entry.id).await;
                settle(&entry.id, &entry.filename, outcome)
            }
        }))
        .buffer_unordered(self.settings.concurrency.max(1))
        .try_collect()
        .await?;

        let summary = BatchSummary::from_results(total, results, false);
        tracing::info!(
            success = summary.success,
            total = summary.total,
            "Ingestion complete"
        );
        Ok(summary)
    }

    /// Ingest with the caller already holding the document lock.
    #[tracing::instrument(name = "ingest", skip(self))]
    pub(crate) async fn ingest_locked(&self, document_id: &str) -> PipelineResult<ProcessingResult> {
        let started = Instant::now();
        let mut entry = self.manifest.get(document_id).await?.ok_or_else(|| {
            PipelineError::Input(format!("unknown document id: '{}'", document_id))
        })?;

        if let Some(reason) = entry.check_consistency() {
            return self.quarantine(entry, reason).await;
        }
        let Some(refined_fingerprint) = entry.refined_fingerprint.clone() else {
            return Err(PipelineError::Input(format!(
                "document '{}' has not been refined",
                entry.filename
            )));
        };
        if !entry.needs_ingestion() {
            tracing::debug!(document_id, "Chunks are current, nothing to ingest");
            if entry.status != DocumentStatus::Ingested && entry.fingerprint == refined_fingerprint
            {
                let settled = entry
                    .transition(DocumentStatus::Ingesting)
                    .and_then(|_| entry.transition(DocumentStatus::Ingested));
                if let Err(err) = settled {
                    return self.fail(entry, err.into()).await;
                }
                self.manifest.upsert(&entry).await?;
            }
            return Ok(ProcessingResult::from_entry(&entry));
        }

        let Some(path) = entry.refined_file.clone() else {
            return self
                .quarantine(entry, "refined fingerprint recorded without a derivative".into())
                .await;
        };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self
                    .quarantine(entry, format!("refined derivative missing: {}", path))
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(err) = entry.transition(DocumentStatus::Ingesting) {
            return self.fail(entry, err.into()).await;
        }
        self.manifest.upsert(&entry).await?;

        let mut chunks = chunk_text(&entry.id, &text, &self.settings.chunking);
        if let Some(embedder) = &self.embedder {
            if let Err(err) = self.embed_chunks(embedder.as_ref(), &entry.id, &mut chunks).await {
                return self.fail(entry, err).await;
            }
        }

        if let Err(e) = self.store.replace_chunks(&entry.id, &chunks).await {
            entry.mark_error(ErrorInfo::new(ErrorKind::Storage, format!("{:#}", e)));
            if let Err(upsert_err) = self.manifest.upsert(&entry).await {
                tracing::error!(document_id, error = %upsert_err, "Could not record storage failure");
            }
            return Err(PipelineError::Storage(e));
        }

        entry.ingested_fingerprint = Some(refined_fingerprint);
        entry.ingested_at = Some(Utc::now());
        if let Err(err) = entry.transition(DocumentStatus::Ingested) {
            return self.fail(entry, err.into()).await;
        }
        self.manifest.upsert(&entry).await?;

        tracing::info!(
            document_id,
            chunks = chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingested document"
        );
        Ok(ProcessingResult::from_entry(&entry))
    }

    async fn embed_chunks(
        &self,
        embedder: &dyn EmbeddingProvider,
        document_id: &str,
        chunks: &mut [Chunk],
    ) -> PipelineResult<()> {
        for batch in chunks.chunks_mut(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embed_with_retry(embedder, document_id, &texts).await?;

            if vectors.len() != texts.len() {
                return Err(PipelineError::Embedding(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                )));
            }
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                if vector.len() != embedder.dims() {
                    return Err(PipelineError::Embedding(format!(
                        "expected {} dimensions from {}, got {}",
                        embedder.dims(),
                        embedder.model_name(),
                        vector.len()
                    )));
                }
                chunk.embedding = vector;
            }
        }
        Ok(())
    }

    async fn embed_with_retry(
        &self,
        embedder: &dyn EmbeddingProvider,
        document_id: &str,
        texts: &[String],
    ) -> PipelineResult<Vec<Vec<f32>>> {
        let retry = &self.settings.retry;
        let mut attempt = 0u32;
        loop {
            let error = match tokio::time::timeout(retry.timeout, embedder.embed(texts)).await {
                Ok(Ok(vectors)) => return Ok(vectors),
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("timed out after {}ms", retry.timeout.as_millis()),
            };

            if attempt >= retry.max_retries {
                return Err(PipelineError::Embedding(format!(
                    "{} (gave up after {} attempts)",
                    error,
                    attempt + 1
                )));
            }
            attempt += 1;
            let delay = retry.delay_for(attempt);
            tracing::warn!(
                document_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Embedding call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Park an entry whose recorded state contradicts itself. It stays in
    /// `error` until a refine rebuilds it.
    async fn quarantine(
        &self,
        mut entry: ManifestEntry,
        reason: String,
    ) -> PipelineResult<ProcessingResult> {
        tracing::error!(document_id = %entry.id, filename = %entry.filename, reason = %reason, "Quarantining inconsistent document");
        entry.mark_error(ErrorInfo::new(ErrorKind::Consistency, reason));
        self.manifest.upsert(&entry).await?;
        Ok(ProcessingResult::from_entry(&entry))
    }

    async fn fail(
        &self,
        mut entry: ManifestEntry,
        err: PipelineError,
    ) -> PipelineResult<ProcessingResult> {
        tracing::warn!(document_id = %entry.id, error = %err, "Ingestion failed");
        entry.mark_error(err.info());
        self.manifest.upsert(&entry).await?;
        Ok(ProcessingResult::from_entry(&entry))
    }
}
