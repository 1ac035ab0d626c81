//! Refinement: one raw source file into its normalized text derivative.
//!
//! The source fingerprint is always recomputed from the bytes on disk.
//! Derivatives live at `<output_dir>/<filename>.txt` and are replaced via
//! temp file + rename. A failed conversion records the error on the manifest
//! entry and leaves the previous derivative and fingerprints in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use corpus_harness_core::fingerprint::fingerprint_bytes;
use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::models::{
    document_id_for, DocumentStatus, ErrorKind, ManifestEntry, ProcessingResult,
};

use crate::error::{PipelineError, PipelineResult};
use crate::extract::RefinementBackend;
use crate::locks::DocumentLocks;
use crate::source_fs::{validate_filename, SourceDirectory};

pub struct Refiner {
    manifest: Arc<dyn ManifestStore>,
    source: Arc<dyn SourceDirectory>,
    backend: Arc<dyn RefinementBackend>,
    locks: Arc<DocumentLocks>,
    output_dir: PathBuf,
    timeout: Duration,
}

impl Refiner {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        source: Arc<dyn SourceDirectory>,
        backend: Arc<dyn RefinementBackend>,
        locks: Arc<DocumentLocks>,
        output_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            manifest,
            source,
            backend,
            locks,
            output_dir,
            timeout,
        }
    }

    /// Where the derivative of `filename` is written.
    pub fn derivative_path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(format!("{}.txt", filename))
    }

    /// Refine `filename` under its document lock.
    ///
    /// Conversion failures are reported in the returned result; only invalid
    /// input and storage failures are returned as `Err`.
    pub async fn refine(&self, filename: &str) -> PipelineResult<ProcessingResult> {
        validate_filename(filename)?;
        let _guard = self.locks.lock(&document_id_for(filename)).await;
        self.refine_locked(filename).await
    }

    /// Refine with the caller already holding the document lock.
    #[tracing::instrument(name = "refine", skip(self))]
    pub(crate) async fn refine_locked(&self, filename: &str) -> PipelineResult<ProcessingResult> {
        validate_filename(filename)?;
        let started = Instant::now();

        let bytes = self.source.read(filename)?.ok_or_else(|| {
            PipelineError::Input(format!("source file not found: '{}'", filename))
        })?;
        let fingerprint = fingerprint_bytes(&bytes);
        let size = bytes.len() as u64;
        let document_id = document_id_for(filename);

        let mut entry = match self.manifest.get(&document_id).await? {
            Some(mut existing) => {
                existing.fingerprint = fingerprint.clone();
                existing.size = size;
                existing
            }
            None => {
                tracing::info!(document_id = %document_id, "Discovered new document");
                ManifestEntry::new(filename, &fingerprint, size)
            }
        };

        let derivative = self.derivative_path(filename);
        let quarantined = is_quarantined(&entry);
        if !entry.needs_refinement(&fingerprint)
            && !quarantined
            && entry.status != DocumentStatus::Refining
            && tokio::fs::try_exists(&derivative).await?
        {
            tracing::debug!(document_id = %document_id, "Derivative is current, nothing to refine");
            return Ok(refined_result(&entry));
        }

        if let Err(err) = entry.transition(DocumentStatus::Refining) {
            return self.fail(entry, err.into()).await;
        }
        self.manifest.upsert(&entry).await?;

        let converted =
            match tokio::time::timeout(self.timeout, self.backend.convert(filename, bytes)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    return self.fail(entry, PipelineError::Conversion(e.to_string())).await
                }
                Err(_) => {
                    let err = PipelineError::Conversion(format!(
                        "conversion timed out after {}s",
                        self.timeout.as_secs()
                    ));
                    return self.fail(entry, err).await;
                }
            };

        if let Err(e) = write_atomically(&derivative, converted.as_bytes()).await {
            let err = PipelineError::Storage(e.into());
            entry.mark_error(err.info());
            self.manifest.upsert(&entry).await?;
            return Err(err);
        }

        if quarantined {
            tracing::info!(document_id = %entry.id, "Rebuilt quarantined document; chunks will be re-ingested");
            entry.ingested_fingerprint = None;
            entry.ingested_at = None;
        }
        entry.refined_fingerprint = Some(fingerprint);
        entry.refined_file = Some(derivative.to_string_lossy().into_owned());
        entry.refined_at = Some(Utc::now());
        if let Err(err) = entry.transition(DocumentStatus::Refined) {
            return self.fail(entry, err.into()).await;
        }
        self.manifest.upsert(&entry).await?;

        tracing::info!(
            document_id = %entry.id,
            chars = converted.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Refined document"
        );
        Ok(ProcessingResult::from_entry(&entry))
    }

    async fn fail(
        &self,
        mut entry: ManifestEntry,
        err: PipelineError,
    ) -> PipelineResult<ProcessingResult> {
        tracing::warn!(document_id = %entry.id, error = %err, "Refinement failed");
        entry.mark_error(err.info());
        self.manifest.upsert(&entry).await?;
        Ok(ProcessingResult::from_entry(&entry))
    }
}

/// Entry whose recorded state contradicts itself, or that ingestion already
/// parked for that reason. Only a full rebuild clears it.
fn is_quarantined(entry: &ManifestEntry) -> bool {
    entry.check_consistency().is_some()
        || matches!(&entry.error, Some(err) if err.kind == ErrorKind::Consistency)
}

/// Result of a refine that found the derivative already current. An entry
/// parked in `error` by a later stage still has a good derivative.
fn refined_result(entry: &ManifestEntry) -> ProcessingResult {
    let status = match entry.status {
        DocumentStatus::Ingesting | DocumentStatus::Ingested => entry.status,
        _ => DocumentStatus::Refined,
    };
    ProcessingResult {
        document_id: entry.id.clone(),
        filename: entry.filename.clone(),
        status,
        refined_file: entry.refined_file.clone(),
        error: None,
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractError;
    use async_trait::async_trait;
    use corpus_harness_core::manifest::memory::InMemoryManifestStore;
    use corpus_harness_core::models::SourceFile;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemSource {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemSource {
        fn put(&self, name: &str, body: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(name.to_string(), body.as_bytes().to_vec());
        }
    }

    impl SourceDirectory for MemSource {
        fn list(&self) -> anyhow::Result<Vec<SourceFile>> {
            let files = self.files.lock().unwrap();
            let mut out: Vec<SourceFile> = files
                .iter()
                .map(|(name, body)| SourceFile {
                    filename: name.clone(),
                    size: body.len() as u64,
                    modified_at: Utc::now(),
                })
                .collect();
            out.sort_by(|a, b| a.filename.cmp(&b.filename));
            Ok(out)
        }

        fn read(&self, filename: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.files.lock().unwrap().get(filename).cloned())
        }
    }

    /// Uppercases the input; bodies starting with "corrupt" fail.
    #[derive(Default)]
    struct UpperBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RefinementBackend for UpperBackend {
        async fn convert(&self, _filename: &str, bytes: Vec<u8>) -> Result<String, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = String::from_utf8(bytes)?;
            if text.starts_with("corrupt") {
                return Err(ExtractError::Pdf("bad xref table".into()));
            }
            Ok(text.to_uppercase())
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl RefinementBackend for SlowBackend {
        async fn convert(&self, _filename: &str, _bytes: Vec<u8>) -> Result<String, ExtractError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        manifest: Arc<InMemoryManifestStore>,
        source: Arc<MemSource>,
        backend: Arc<UpperBackend>,
        refiner: Refiner,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let manifest = Arc::new(InMemoryManifestStore::new());
        let source = Arc::new(MemSource::default());
        let backend = Arc::new(UpperBackend::default());
        let refiner = Refiner::new(
            manifest.clone(),
            source.clone(),
            backend.clone(),
            Arc::new(DocumentLocks::new()),
            tmp.path().join("refined"),
            Duration::from_secs(5),
        );
        Fixture {
            _tmp: tmp,
            manifest,
            source,
            backend,
            refiner,
        }
    }

    #[tokio::test]
    async fn test_refine_writes_derivative() {
        let f = fixture();
        f.source.put("notes/a.md", "hello");

        let result = f.refiner.refine("notes/a.md").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.status, DocumentStatus::Refined);

        let path = f.refiner.derivative_path("notes/a.md");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "HELLO");

        let entry = f.manifest.get(&result.document_id).await.unwrap().unwrap();
        assert_eq!(entry.refined_fingerprint, Some(fingerprint_bytes(b"hello")));
        assert_eq!(entry.refined_file.as_deref(), Some(path.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_refine_is_idempotent() {
        let f = fixture();
        f.source.put("a.md", "hello");

        let first = f.refiner.refine("a.md").await.unwrap();
        let before = f.manifest.get(&first.document_id).await.unwrap().unwrap();
        let second = f.refiner.refine("a.md").await.unwrap();
        let after = f.manifest.get(&first.document_id).await.unwrap().unwrap();

        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(before.refined_fingerprint, after.refined_fingerprint);
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn test_missing_derivative_is_rebuilt() {
        let f = fixture();
        f.source.put("a.md", "hello");
        f.refiner.refine("a.md").await.unwrap();
        std::fs::remove_file(f.refiner.derivative_path("a.md")).unwrap();

        f.refiner.refine("a.md").await.unwrap();
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 2);
        assert!(f.refiner.derivative_path("a.md").exists());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_derivative() {
        let f = fixture();
        f.source.put("a.md", "good");
        f.refiner.refine("a.md").await.unwrap();

        f.source.put("a.md", "corrupt now");
        let result = f.refiner.refine("a.md").await.unwrap();
        assert!(!result.is_success());
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Conversion);

        let path = f.refiner.derivative_path("a.md");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "GOOD");
        let entry = f.manifest.get(&result.document_id).await.unwrap().unwrap();
        assert_eq!(entry.status, DocumentStatus::Error);
        assert_eq!(entry.refined_fingerprint, Some(fingerprint_bytes(b"good")));
        assert_eq!(entry.fingerprint, fingerprint_bytes(b"corrupt now"));
    }

    #[tokio::test]
    async fn test_error_heals_on_next_success() {
        let f = fixture();
        f.source.put("a.md", "corrupt");
        let failed = f.refiner.refine("a.md").await.unwrap();
        assert_eq!(failed.status, DocumentStatus::Error);

        f.source.put("a.md", "fixed");
        let ok = f.refiner.refine("a.md").await.unwrap();
        assert_eq!(ok.status, DocumentStatus::Refined);
        assert!(ok.error.is_none());
    }

    #[tokio::test]
    async fn test_input_errors_touch_nothing() {
        let f = fixture();
        assert!(matches!(
            f.refiner.refine("").await,
            Err(PipelineError::Input(_))
        ));
        assert!(matches!(
            f.refiner.refine("missing.md").await,
            Err(PipelineError::Input(_))
        ));
        assert!(f.manifest.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_a_conversion_failure() {
        let tmp = TempDir::new().unwrap();
        let manifest = Arc::new(InMemoryManifestStore::new());
        let source = Arc::new(MemSource::default());
        source.put("slow.pdf", "x");
        let refiner = Refiner::new(
            manifest,
            source,
            Arc::new(SlowBackend),
            Arc::new(DocumentLocks::new()),
            tmp.path().to_path_buf(),
            Duration::from_millis(20),
        );

        let result = refiner.refine("slow.pdf").await.unwrap();
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Conversion);
        assert!(error.message.contains("timed out"));
    }
}
