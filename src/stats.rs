//! Corpus statistics.
//!
//! A quick summary of manifest and corpus state: documents per status,
//! tombstones, chunk counts and embedding coverage. Used by `corpus stats`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::store::CorpusStore;

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    /// Live manifest entries.
    pub documents: usize,
    pub by_status: BTreeMap<String, usize>,
    pub tombstoned: usize,
    pub chunks: u64,
    pub embedded_chunks: u64,
    pub last_ingested_at: Option<DateTime<Utc>>,
}

pub async fn collect_stats(
    manifest: &dyn ManifestStore,
    store: &dyn CorpusStore,
) -> Result<CorpusStats> {
    let history = manifest.history().await?;
    let counts = store.counts().await?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    let mut documents = 0;
    let mut tombstoned = 0;
    let mut last_ingested_at = None;
    for entry in &history {
        if entry.is_tombstoned() {
            tombstoned += 1;
            continue;
        }
        documents += 1;
        *by_status.entry(entry.status.to_string()).or_default() += 1;
        last_ingested_at = last_ingested_at.max(entry.ingested_at);
    }

    Ok(CorpusStats {
        documents,
        by_status,
        tombstoned,
        chunks: counts.chunks,
        embedded_chunks: counts.embedded_chunks,
        last_ingested_at,
    })
}

pub fn print_stats(stats: &CorpusStats, db_path: &Path) {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("Corpus Harness: Corpus Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    for (status, count) in &stats.by_status {
        println!("    {:<11} {}", status, count);
    }
    println!("  Tombstoned:  {}", stats.tombstoned);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded_chunks,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded_chunks * 100) / stats.chunks
        } else {
            0
        }
    );
    let last = match stats.last_ingested_at {
        Some(ts) => format_ts_relative(ts.timestamp()),
        None => "never".to_string(),
    };
    println!("  Last ingest: {}", last);
    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering of a Unix timestamp.
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;
    let plural = |n: i64| if n == 1 { "" } else { "s" };

    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
