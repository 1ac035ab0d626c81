//! Drift detection between the source directory, the manifest and the
//! corpus.
//!
//! [`IntegrityChecker::check`] classifies every source file and every live
//! manifest entry into exactly one bucket of an [`IntegrityReport`]:
//!
//! | Bucket               | Condition                                                     |
//! |----------------------|---------------------------------------------------------------|
//! | `missing_refinement` | no entry, or `refined_fingerprint` != current source hash      |
//! | `inconsistent`       | entry fails [`ManifestEntry::check_consistency`]              |
//! | `missing_ingestion`  | refined, but `ingested_fingerprint` != `refined_fingerprint`   |
//! | `orphaned`           | live entry whose source file is gone                          |
//! | `healthy`            | everything else                                               |
//!
//! # Caching
//!
//! Reports are memoized in a [`ReportCache`] keyed by a signature of the
//! source listing (names, sizes, mtimes), so a changed directory is never
//! served a stale report. Mutating operations call
//! [`IntegrityChecker::invalidate_cache`] before returning. At most one
//! computation runs at a time; callers arriving during a computation wait
//! for it and receive the same `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use corpus_harness_core::fingerprint::{fingerprint_bytes, fingerprint_parts};
use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::models::{DocumentRef, IntegrityReport, ManifestEntry, SourceFile};

use crate::error::PipelineResult;
use crate::source_fs::SourceDirectory;

#[derive(Default)]
struct CacheState {
    report: Option<Arc<IntegrityReport>>,
    signature: Option<String>,
    generation: u64,
}

/// Process-wide memo of the last integrity report.
///
/// Every invalidation bumps a generation counter; a computation that started
/// under an older generation is not stored.
#[derive(Default)]
pub struct ReportCache {
    state: Mutex<CacheState>,
}

impl ReportCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The cached report, if one exists for this source signature.
    pub fn get(&self, signature: &str) -> Option<Arc<IntegrityReport>> {
        let state = self.state();
        match (&state.report, &state.signature) {
            (Some(report), Some(sig)) if sig == signature => Some(report.clone()),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Store `report` unless the cache was invalidated after `generation`
    /// was read. Returns whether it was stored.
    pub fn set_if_current(
        &self,
        generation: u64,
        signature: String,
        report: Arc<IntegrityReport>,
    ) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        state.report = Some(report);
        state.signature = Some(signature);
        true
    }

    pub fn invalidate(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.report = None;
        state.signature = None;
    }
}

pub struct IntegrityChecker {
    manifest: Arc<dyn ManifestStore>,
    source: Arc<dyn SourceDirectory>,
    cache: Arc<ReportCache>,
    gate: tokio::sync::Mutex<()>,
}

impl IntegrityChecker {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        source: Arc<dyn SourceDirectory>,
        cache: Arc<ReportCache>,
    ) -> Self {
        Self {
            manifest,
            source,
            cache,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current drift report, served from cache when nothing has changed.
    pub async fn check(&self) -> PipelineResult<Arc<IntegrityReport>> {
        let listing = self.list_sources().await?;
        if let Some(report) = self.cache.get(&listing_signature(&listing)) {
            tracing::debug!("Integrity report served from cache");
            return Ok(report);
        }

        let _gate = self.gate.lock().await;
        let generation = self.cache.generation();
        let listing = self.list_sources().await?;
        let signature = listing_signature(&listing);
        if let Some(report) = self.cache.get(&signature) {
            return Ok(report);
        }

        let report = Arc::new(self.compute(listing).await?);
        if !self.cache.set_if_current(generation, signature, report.clone()) {
            tracing::debug!("Cache invalidated during integrity check; report not stored");
        }
        Ok(report)
    }

    /// Drop the cached report and compute a new one.
    pub async fn check_fresh(&self) -> PipelineResult<Arc<IntegrityReport>> {
        self.invalidate_cache();
        self.check().await
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    async fn list_sources(&self) -> PipelineResult<Vec<SourceFile>> {
        let source = self.source.clone();
        let listing = tokio::task::spawn_blocking(move || source.list())
            .await
            .map_err(anyhow::Error::from)??;
        Ok(listing)
    }

    /// `(filename, fingerprint)` for every listed file that is still readable.
    async fn fingerprint_sources(
        &self,
        listing: Vec<SourceFile>,
    ) -> PipelineResult<Vec<(String, String)>> {
        let source = self.source.clone();
        let scanned = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let mut scanned = Vec::with_capacity(listing.len());
            for file in listing {
                if let Some(bytes) = source.read(&file.filename)? {
                    scanned.push((file.filename, fingerprint_bytes(&bytes)));
                }
            }
            Ok(scanned)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(scanned)
    }

    async fn compute(&self, listing: Vec<SourceFile>) -> PipelineResult<IntegrityReport> {
        let started = Instant::now();
        let scanned = self.fingerprint_sources(listing).await?;
        let entries = self.manifest.list_all().await?;
        let by_filename: HashMap<&str, &ManifestEntry> =
            entries.iter().map(|e| (e.filename.as_str(), e)).collect();

        let mut report = IntegrityReport::empty();
        let mut present: HashSet<&str> = HashSet::new();

        for (filename, fingerprint) in &scanned {
            present.insert(filename.as_str());
            let doc = DocumentRef::for_filename(filename);

            match by_filename.get(filename.as_str()) {
                None => report.missing_refinement.push(doc),
                Some(entry) if entry.needs_refinement(fingerprint) => {
                    report.missing_refinement.push(doc)
                }
                Some(entry) if entry.check_consistency().is_some() => {
                    report.inconsistent.push(doc)
                }
                Some(entry) if entry.needs_ingestion() => report.missing_ingestion.push(doc),
                Some(_) => report.healthy.push(doc),
            }
        }

        for entry in &entries {
            if !present.contains(entry.filename.as_str()) {
                report.orphaned.push(DocumentRef {
                    id: entry.id.clone(),
                    filename: entry.filename.clone(),
                });
            }
        }

        report.sort();
        tracing::info!(
            healthy = report.healthy.len(),
            missing_refinement = report.missing_refinement.len(),
            missing_ingestion = report.missing_ingestion.len(),
            orphaned = report.orphaned.len(),
            inconsistent = report.inconsistent.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Integrity check complete"
        );
        Ok(report)
    }
}

/// Identity of a directory listing: changes when any file is added, removed,
/// resized or touched.
pub fn listing_signature(listing: &[SourceFile]) -> String {
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(listing.len() * 3);
    for file in listing {
        parts.push(file.filename.as_bytes().to_vec());
        parts.push(file.size.to_le_bytes().to_vec());
        parts.push(
            file.modified_at
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes()
                .to_vec(),
        );
    }
    fingerprint_parts(parts.iter().map(|p| p.as_slice()))
}
