//! The pipeline orchestrator: the only writer of manifest state.
//!
//! Exposes the operations the CLI (or any other transport) calls:
//!
//! - [`Orchestrator::check_integrity`]: cached drift report.
//! - [`Orchestrator::repair_file`]: refine then ingest one file.
//! - [`Orchestrator::reprocess_all`]: best-effort sweep over every source
//!   file with bounded parallelism and cooperative cancellation.
//! - [`Orchestrator::prune_orphans`]: tombstone entries whose source is gone
//!   and drop their chunks and derivatives.
//! - [`Orchestrator::ingest`] / [`Orchestrator::ingest_all`]: ingestion only.
//!
//! Every mutating operation invalidates the integrity cache before it
//! returns, whether it succeeded or not.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use corpus_harness_core::embedding::EmbeddingProvider;
use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::models::{
    document_id_for, BatchSummary, DocumentStatus, IntegrityReport, ManifestEntry,
    ProcessingResult,
};
use corpus_harness_core::store::CorpusStore;

use crate::config::Config;
use crate::error::{settle, PipelineResult};
use crate::extract::RefinementBackend;
use crate::ingest::{IngestSettings, IngestionPipeline};
use crate::integrity::{IntegrityChecker, ReportCache};
use crate::locks::DocumentLocks;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::refine::Refiner;
use crate::source_fs::{validate_filename, SourceDirectory};

/// External systems the orchestrator drives.
pub struct Collaborators {
    pub manifest: Arc<dyn ManifestStore>,
    pub store: Arc<dyn CorpusStore>,
    pub source: Arc<dyn SourceDirectory>,
    pub backend: Arc<dyn RefinementBackend>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    /// Shared so that several orchestrators over the same stores agree.
    pub cache: Arc<ReportCache>,
}

pub struct Orchestrator {
    manifest: Arc<dyn ManifestStore>,
    store: Arc<dyn CorpusStore>,
    source: Arc<dyn SourceDirectory>,
    locks: Arc<DocumentLocks>,
    refiner: Refiner,
    ingestion: IngestionPipeline,
    checker: IntegrityChecker,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(config: &Config, parts: Collaborators) -> Self {
        let locks = Arc::new(DocumentLocks::new());
        let refiner = Refiner::new(
            parts.manifest.clone(),
            parts.source.clone(),
            parts.backend,
            locks.clone(),
            config.refine.output_dir.clone(),
            config.refine.timeout(),
        );
        let ingestion = IngestionPipeline::new(
            parts.manifest.clone(),
            parts.store.clone(),
            parts.embedder,
            locks.clone(),
            IngestSettings::from_config(config),
        );
        let checker =
            IntegrityChecker::new(parts.manifest.clone(), parts.source.clone(), parts.cache);

        Self {
            manifest: parts.manifest,
            store: parts.store,
            source: parts.source,
            locks,
            refiner,
            ingestion,
            checker,
            concurrency: config.pipeline.concurrency.max(1),
        }
    }

    /// Override the sweep concurrency from `[pipeline] concurrency`.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn check_integrity(&self) -> PipelineResult<Arc<IntegrityReport>> {
        self.checker.check().await
    }

    /// Recompute the report even if a cached one is current.
    pub async fn check_integrity_fresh(&self) -> PipelineResult<Arc<IntegrityReport>> {
        self.checker.check_fresh().await
    }

    /// Refine `filename` and, if that succeeds, ingest it.
    ///
    /// A refinement failure is reported in the result and ingestion is
    /// skipped, leaving the previous derivative and chunks in place.
    #[tracing::instrument(skip(self))]
    pub async fn repair_file(&self, filename: &str) -> PipelineResult<ProcessingResult> {
        validate_filename(filename)?;
        let outcome = {
            let _guard = self.locks.lock(&document_id_for(filename)).await;
            self.refine_and_ingest(filename).await
        };
        self.checker.invalidate_cache();
        outcome
    }

    /// Refine + ingest every source file. Never stops on a per-document
    /// failure; checks `cancel` before starting each document.
    pub async fn reprocess_all(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> PipelineResult<BatchSummary> {
        let outcome = self.sweep(cancel, progress).await;
        self.checker.invalidate_cache();
        outcome
    }

    async fn sweep(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> PipelineResult<BatchSummary> {
        let started = Instant::now();
        let listing = self.source.list()?;
        let present: HashSet<&str> = listing.iter().map(|f| f.filename.as_str()).collect();
        let orphans = self
            .manifest
            .list_all()
            .await?
            .into_iter()
            .filter(|e| !present.contains(e.filename.as_str()))
            .count();
        if orphans > 0 {
            tracing::info!(orphans, "Skipping manifest entries without a source file");
        }

        let total = listing.len();
        tracing::info!(total, concurrency = self.concurrency, "Reprocessing corpus");
        progress.report(ProgressEvent::Started { total });

        let mut outcomes = stream::iter(listing.iter().map(|file| async move {
            if cancel.is_cancelled() {
                return None;
            }
            let filename = file.filename.as_str();
            let document_id = document_id_for(filename);
            let _guard = self.locks.lock(&document_id).await;
            let outcome = self.refine_and_ingest(filename).await;
            Some(settle(&document_id, filename, outcome))
        }))
        .buffer_unordered(self.concurrency);

        let mut results = Vec::with_capacity(total);
        while let Some(outcome) = outcomes.next().await {
            let Some(outcome) = outcome else {
                continue;
            };
            let result = outcome?;
            progress.report(ProgressEvent::Document {
                done: results.len() + 1,
                total,
                result: &result,
            });
            results.push(result);
        }

        let cancelled = results.len() < total;
        let summary = BatchSummary::from_results(total, results, cancelled);
        if cancelled {
            tracing::warn!(
                completed = summary.results.len(),
                skipped = summary.skipped,
                "Reprocessing cancelled"
            );
        }
        tracing::info!(
            success = summary.success,
            total = summary.total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reprocessing complete"
        );
        progress.report(ProgressEvent::Finished { summary: &summary });
        Ok(summary)
    }

    /// Caller holds the document lock.
    async fn refine_and_ingest(&self, filename: &str) -> PipelineResult<ProcessingResult> {
        let refined = self.refiner.refine_locked(filename).await?;
        if !refined.is_success() {
            return Ok(refined);
        }
        let mut ingested = self.ingestion.ingest_locked(&refined.document_id).await?;
        if ingested.refined_file.is_none() {
            ingested.refined_file = refined.refined_file;
        }
        Ok(ingested)
    }

    /// Tombstone every live entry whose source file no longer exists and
    /// delete its chunks and refined derivative.
    pub async fn prune_orphans(&self) -> PipelineResult<BatchSummary> {
        let outcome = self.prune().await;
        self.checker.invalidate_cache();
        outcome
    }

    async fn prune(&self) -> PipelineResult<BatchSummary> {
        let listing = self.source.list()?;
        let present: HashSet<&str> = listing.iter().map(|f| f.filename.as_str()).collect();
        let orphans: Vec<ManifestEntry> = self
            .manifest
            .list_all()
            .await?
            .into_iter()
            .filter(|e| !present.contains(e.filename.as_str()))
            .collect();

        let total = orphans.len();
        let mut results = Vec::with_capacity(total);
        for entry in orphans {
            let _guard = self.locks.lock(&entry.id).await;
            let outcome = self.prune_one(&entry).await;
            results.push(settle(&entry.id, &entry.filename, outcome)?);
        }

        let summary = BatchSummary::from_results(total, results, false);
        tracing::info!(pruned = summary.success, total, "Pruned orphaned documents");
        Ok(summary)
    }

    /// Caller holds the document lock.
    async fn prune_one(&self, entry: &ManifestEntry) -> PipelineResult<ProcessingResult> {
        if self.source.read(&entry.filename)?.is_some() {
            tracing::debug!(document_id = %entry.id, "Source reappeared, not pruning");
            return Ok(ProcessingResult::from_entry(entry));
        }

        let deleted = self.store.delete_chunks_for_document(&entry.id).await?;
        if let Some(path) = &entry.refined_file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(document_id = %entry.id, path = %path, error = %e, "Could not delete refined derivative");
                }
            }
        }
        self.manifest.remove(&entry.id).await?;

        tracing::info!(document_id = %entry.id, filename = %entry.filename, chunks = deleted, "Pruned orphan");
        Ok(ProcessingResult {
            document_id: entry.id.clone(),
            filename: entry.filename.clone(),
            status: DocumentStatus::Removed,
            refined_file: None,
            error: None,
        })
    }

    /// Ingest one already-refined document.
    pub async fn ingest(&self, document_id: &str) -> PipelineResult<ProcessingResult> {
        let outcome = self.ingestion.ingest_one(document_id).await;
        self.checker.invalidate_cache();
        outcome
    }

    /// Ingest every refined document that is behind its derivative.
    pub async fn ingest_all(&self) -> PipelineResult<BatchSummary> {
        let outcome = self.ingestion.ingest_all().await;
        self.checker.invalidate_cache();
        outcome
    }
}
