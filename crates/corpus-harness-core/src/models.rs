//! Core data types for the corpus integrity pipeline.
//!
//! A source file on disk is tracked by exactly one [`ManifestEntry`], keyed
//! by a stable document id derived from its relative filename. The entry
//! carries the fingerprints of the last successful refinement and ingestion
//! plus a [`DocumentStatus`] that moves through a validated state machine.
//!
//! ```text
//! pending ──▶ refining ──▶ refined ──▶ ingesting ──▶ ingested
//!                 │                        │
//!                 └──────▶ error ◀─────────┘
//!                            │
//!                            └──▶ refining | ingesting   (self-healing)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix mixed into the UUIDv5 name so ids never collide with other
/// URL-namespace UUIDs derived from bare paths.
const DOCUMENT_ID_PREFIX: &str = "corpus:";

/// Derive the stable document id for a relative source filename.
///
/// The same filename always maps to the same id, so a file that disappears
/// and later reappears keeps its identity (and its tombstoned history).
///
/// ```rust
/// use corpus_harness_core::models::document_id_for;
///
/// assert_eq!(document_id_for("decks/q3.pptx"), document_id_for("decks/q3.pptx"));
/// assert_ne!(document_id_for("a.pdf"), document_id_for("b.pdf"));
/// ```
pub fn document_id_for(filename: &str) -> String {
    let name = format!("{}{}", DOCUMENT_ID_PREFIX, filename);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// One file found in the source directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the source root, `/`-separated.
    pub filename: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Processing state of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Refining,
    Refined,
    Ingesting,
    Ingested,
    Error,
    /// Tombstoned: the backing source file is gone and the entry was pruned.
    Removed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Refining => "refining",
            DocumentStatus::Refined => "refined",
            DocumentStatus::Ingesting => "ingesting",
            DocumentStatus::Ingested => "ingested",
            DocumentStatus::Error => "error",
            DocumentStatus::Removed => "removed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `error` is never terminal: a later refine or ingest re-enters the
    /// normal flow. Any state may fail into `error` or be tombstoned, and a
    /// tombstoned entry is revived as `pending`. An in-flight status left
    /// behind by an interrupted run may be re-entered.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus as S;
        if matches!(next, S::Error | S::Removed) {
            return true;
        }
        matches!(
            (self, next),
            (S::Pending, S::Refining)
                | (S::Refining, S::Refined)
                | (S::Refining, S::Refining)
                | (S::Refined, S::Ingesting)
                | (S::Refined, S::Refining)
                | (S::Ingesting, S::Ingested)
                | (S::Ingesting, S::Ingesting)
                | (S::Ingesting, S::Refining)
                | (S::Ingested, S::Refining)
                | (S::Ingested, S::Ingesting)
                | (S::Error, S::Refining)
                | (S::Error, S::Ingesting)
                | (S::Removed, S::Pending)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "refining" => Ok(DocumentStatus::Refining),
            "refined" => Ok(DocumentStatus::Refined),
            "ingesting" => Ok(DocumentStatus::Ingesting),
            "ingested" => Ok(DocumentStatus::Ingested),
            "error" => Ok(DocumentStatus::Error),
            "removed" => Ok(DocumentStatus::Removed),
            other => Err(format!("unknown document status: '{}'", other)),
        }
    }
}

/// Structured category of a per-document failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid filename / document id.
    Input,
    /// The refinement backend rejected or failed on the file content.
    Conversion,
    /// The embedding backend failed or timed out after bounded retries.
    Embedding,
    /// A manifest or store invariant was violated; the entry is quarantined.
    Consistency,
    /// A store or the filesystem was unreachable.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Embedding => "embedding",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(ErrorKind::Input),
            "conversion" => Ok(ErrorKind::Conversion),
            "embedding" => Ok(ErrorKind::Embedding),
            "consistency" => Ok(ErrorKind::Consistency),
            "storage" => Ok(ErrorKind::Storage),
            other => Err(format!("unknown error kind: '{}'", other)),
        }
    }
}

/// A failure recorded against one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to} for document {document_id}")]
pub struct InvalidTransition {
    pub document_id: String,
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

/// Durable record of one source document and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub filename: String,
    /// SHA-256 of the source content when it was last observed.
    pub fingerprint: String,
    pub size: u64,
    pub discovered_at: DateTime<Utc>,
    /// Source fingerprint of the last successful refinement.
    pub refined_fingerprint: Option<String>,
    /// Location of the refined derivative.
    pub refined_file: Option<String>,
    pub refined_at: Option<DateTime<Utc>>,
    /// Source fingerprint of the last successful chunk + embed.
    pub ingested_fingerprint: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
    pub status: DocumentStatus,
    pub error: Option<ErrorInfo>,
    pub updated_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl ManifestEntry {
    /// A freshly discovered document that has never been processed.
    pub fn new(filename: &str, fingerprint: &str, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: document_id_for(filename),
            filename: filename.to_string(),
            fingerprint: fingerprint.to_string(),
            size,
            discovered_at: now,
            refined_fingerprint: None,
            refined_file: None,
            refined_at: None,
            ingested_fingerprint: None,
            ingested_at: None,
            status: DocumentStatus::Pending,
            error: None,
            updated_at: now,
            removed_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the status machine forbids.
    pub fn transition(&mut self, next: DocumentStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                document_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next != DocumentStatus::Error {
            self.error = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure. Fingerprints and the refined derivative are left
    /// untouched so the last good state stays authoritative.
    pub fn mark_error(&mut self, error: ErrorInfo) {
        self.status = DocumentStatus::Error;
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    pub fn is_tombstoned(&self) -> bool {
        self.removed_at.is_some()
    }

    /// True when the refined derivative does not match `current_fingerprint`.
    pub fn needs_refinement(&self, current_fingerprint: &str) -> bool {
        self.refined_fingerprint.as_deref() != Some(current_fingerprint)
    }

    /// True when a refined derivative exists that has not been ingested.
    pub fn needs_ingestion(&self) -> bool {
        self.refined_fingerprint.is_some() && self.ingested_fingerprint != self.refined_fingerprint
    }

    /// Detect ingestion running ahead of refinement.
    ///
    /// Returns a description of the violation, or `None` when the entry is
    /// consistent.
    pub fn check_consistency(&self) -> Option<String> {
        let ingested = self.ingested_fingerprint.as_deref()?;
        let Some(refined) = self.refined_fingerprint.as_deref() else {
            return Some(format!(
                "ingested fingerprint {} recorded without any refinement",
                short(ingested)
            ));
        };
        if ingested == refined {
            return None;
        }
        if self.status == DocumentStatus::Ingested {
            return Some(format!(
                "status is ingested but ingested fingerprint {} != refined fingerprint {}",
                short(ingested),
                short(refined)
            ));
        }
        match (self.ingested_at, self.refined_at) {
            (Some(ingested_at), Some(refined_at)) if ingested_at > refined_at => Some(format!(
                "ingested fingerprint {} is newer than refined fingerprint {}",
                short(ingested),
                short(refined)
            )),
            _ => None,
        }
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

/// An ordered slice of a refined document's text.
///
/// `embedding` is empty until the ingestion pipeline fills it in.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// Identifies a document in an [`IntegrityReport`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub filename: String,
}

impl DocumentRef {
    pub fn for_filename(filename: &str) -> Self {
        Self {
            id: document_id_for(filename),
            filename: filename.to_string(),
        }
    }
}

/// Point-in-time drift report between the source directory and the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub generated_at: DateTime<Utc>,
    /// New or changed sources with no derivative for the current content.
    pub missing_refinement: Vec<DocumentRef>,
    /// Refined but not chunked + embedded at the refined fingerprint.
    pub missing_ingestion: Vec<DocumentRef>,
    /// Manifest entries whose source file no longer exists.
    pub orphaned: Vec<DocumentRef>,
    pub healthy: Vec<DocumentRef>,
    /// Entries failing [`ManifestEntry::check_consistency`].
    pub inconsistent: Vec<DocumentRef>,
}

impl IntegrityReport {
    pub fn empty() -> Self {
        Self {
            generated_at: Utc::now(),
            missing_refinement: Vec::new(),
            missing_ingestion: Vec::new(),
            orphaned: Vec::new(),
            healthy: Vec::new(),
            inconsistent: Vec::new(),
        }
    }

    /// No drift of any kind.
    pub fn is_clean(&self) -> bool {
        self.missing_refinement.is_empty()
            && self.missing_ingestion.is_empty()
            && self.orphaned.is_empty()
            && self.inconsistent.is_empty()
    }

    /// Sort every list by filename for stable output.
    pub fn sort(&mut self) {
        for list in [
            &mut self.missing_refinement,
            &mut self.missing_ingestion,
            &mut self.orphaned,
            &mut self.healthy,
            &mut self.inconsistent,
        ] {
            list.sort_by(|a, b| a.filename.cmp(&b.filename));
        }
    }
}

/// Outcome for one attempted document. Bulk operations return exactly one
/// per attempted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub document_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ProcessingResult {
    pub fn from_entry(entry: &ManifestEntry) -> Self {
        Self {
            document_id: entry.id.clone(),
            filename: entry.filename.clone(),
            status: entry.status,
            refined_file: entry.refined_file.clone(),
            error: entry.error.clone(),
        }
    }

    pub fn failed(document_id: &str, filename: &str, error: ErrorInfo) -> Self {
        Self {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            status: DocumentStatus::Error,
            refined_file: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status != DocumentStatus::Error
    }
}

/// Aggregate outcome of a multi-document operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub success: usize,
    pub total: usize,
    pub results: Vec<ProcessingResult>,
    /// The sweep stopped early on a cancellation signal.
    pub cancelled: bool,
    /// Documents never started because of cancellation.
    pub skipped: usize,
}

impl BatchSummary {
    /// Build a summary over `total` candidates; `results` are sorted by filename.
    pub fn from_results(total: usize, mut results: Vec<ProcessingResult>, cancelled: bool) -> Self {
        results.sort_by(|a, b| a.filename.cmp(&b.filename));
        let success = results.iter().filter(|r| r.is_success()).count();
        let skipped = total.saturating_sub(results.len());
        Self {
            success,
            total,
            results,
            cancelled,
            skipped,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProcessingResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refined(entry: &mut ManifestEntry, fp: &str) {
        entry.transition(DocumentStatus::Refining).unwrap();
        entry.refined_fingerprint = Some(fp.to_string());
        entry.refined_at = Some(Utc::now());
        entry.transition(DocumentStatus::Refined).unwrap();
    }

    #[test]
    fn test_document_id_is_stable() {
        let a = document_id_for("reports/2024.pdf");
        let b = document_id_for("reports/2024.pdf");
        assert_eq!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut e = ManifestEntry::new("a.pdf", "fp1", 10);
        refined(&mut e, "fp1");
        e.transition(DocumentStatus::Ingesting).unwrap();
        e.transition(DocumentStatus::Ingested).unwrap();
        assert_eq!(e.status, DocumentStatus::Ingested);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut e = ManifestEntry::new("a.pdf", "fp1", 10);
        let err = e.transition(DocumentStatus::Ingested).unwrap_err();
        assert_eq!(err.from, DocumentStatus::Pending);
        assert_eq!(err.to, DocumentStatus::Ingested);
        assert_eq!(e.status, DocumentStatus::Pending);
    }

    #[test]
    fn test_error_is_not_terminal() {
        let mut e = ManifestEntry::new("a.pdf", "fp1", 10);
        e.transition(DocumentStatus::Refining).unwrap();
        e.mark_error(ErrorInfo::new(ErrorKind::Conversion, "corrupt"));
        assert_eq!(e.status, DocumentStatus::Error);
        e.transition(DocumentStatus::Refining).unwrap();
        assert!(e.error.is_none());
    }

    #[test]
    fn test_interrupted_run_can_resume() {
        assert!(DocumentStatus::Refining.can_transition_to(DocumentStatus::Refining));
        assert!(DocumentStatus::Ingesting.can_transition_to(DocumentStatus::Refining));
        assert!(!DocumentStatus::Refining.can_transition_to(DocumentStatus::Ingested));
    }

    #[test]
    fn test_removed_revives_as_pending() {
        assert!(DocumentStatus::Removed.can_transition_to(DocumentStatus::Pending));
        assert!(!DocumentStatus::Removed.can_transition_to(DocumentStatus::Ingested));
    }

    #[test]
    fn test_consistency_ingested_without_refinement() {
        let mut e = ManifestEntry::new("a.pdf", "fp1", 10);
        e.ingested_fingerprint = Some("fp1".to_string());
        assert!(e.check_consistency().is_some());
    }

    #[test]
    fn test_consistency_stale_ingestion_is_fine() {
        let mut e = ManifestEntry::new("a.pdf", "fp2", 10);
        e.ingested_fingerprint = Some("fp1".to_string());
        e.ingested_at = Some(Utc::now() - chrono::Duration::minutes(5));
        refined(&mut e, "fp2");
        assert!(e.check_consistency().is_none());
        assert!(e.needs_ingestion());
    }

    #[test]
    fn test_consistency_ingestion_ahead_of_refinement() {
        let mut e = ManifestEntry::new("a.pdf", "fp1", 10);
        refined(&mut e, "fp1");
        e.refined_at = Some(Utc::now() - chrono::Duration::minutes(5));
        e.ingested_fingerprint = Some("fp-other".to_string());
        e.ingested_at = Some(Utc::now());
        assert!(e.check_consistency().unwrap().contains("newer"));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Refining,
            DocumentStatus::Refined,
            DocumentStatus::Ingesting,
            DocumentStatus::Ingested,
            DocumentStatus::Error,
            DocumentStatus::Removed,
        ] {
            assert_eq!(s.as_str().parse::<DocumentStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_batch_summary_counts() {
        let ok = ProcessingResult {
            document_id: "1".into(),
            filename: "b".into(),
            status: DocumentStatus::Ingested,
            refined_file: None,
            error: None,
        };
        let bad = ProcessingResult::failed("2", "a", ErrorInfo::new(ErrorKind::Conversion, "x"));
        let summary = BatchSummary::from_results(3, vec![ok, bad], true);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.results[0].filename, "a");
        assert_eq!(summary.failures().count(), 1);
    }
}
