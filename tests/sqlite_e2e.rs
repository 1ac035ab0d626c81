//! Full pipeline against a real SQLite database, the filesystem source
//! directory and the built-in extractors.

use std::io::{Cursor, Write};
use std::path::Path;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

use corpus_harness::app::App;
use corpus_harness::config::Config;
use corpus_harness::progress::NoProgress;
use corpus_harness::stats::collect_stats;
use corpus_harness_core::chunk::{chunk_text, ChunkingPolicy};
use corpus_harness_core::models::{document_id_for, DocumentStatus, ErrorKind};

fn minimal_docx_with_text(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );

    let mut out = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut out);
        zip.start_file("[Content_Types].xml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(br#"<?xml version="1.0"?><Types/>"#).unwrap();
        zip.start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(document.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    out.into_inner()
}

fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path());
    std::fs::create_dir_all(&config.source.root).unwrap();
    (tmp, config)
}

fn write(root: &Path, name: &str, bytes: &[u8]) {
    let path = root.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn reprocess_check_and_prune_round_trip() {
    let (_tmp, config) = setup();
    let root = config.source.root.clone();
    write(&root, "notes/meeting.md", b"# Meeting\n\nShip the integrity checker.");
    write(
        &root,
        "reports/q3.docx",
        &minimal_docx_with_text(&["Quarterly review", "Revenue grew"]),
    );
    write(&root, "scans/broken.pdf", b"definitely not a pdf");

    let app = App::open(&config).await.unwrap();

    let report = app.orchestrator.check_integrity().await.unwrap();
    assert_eq!(report.missing_refinement.len(), 3);

    let summary = app
        .orchestrator
        .reprocess_all(&CancellationToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.success, 2);
    let failed: Vec<_> = summary.failures().collect();
    assert_eq!(failed[0].filename, "scans/broken.pdf");
    assert_eq!(failed[0].error.as_ref().unwrap().kind, ErrorKind::Conversion);

    let report = app.orchestrator.check_integrity().await.unwrap();
    let healthy: Vec<_> = report.healthy.iter().map(|d| d.filename.as_str()).collect();
    assert_eq!(healthy, vec!["notes/meeting.md", "reports/q3.docx"]);
    assert_eq!(report.missing_refinement.len(), 1);
    assert!(report.inconsistent.is_empty());

    let docx_id = document_id_for("reports/q3.docx");
    let chunks = app.store.chunks_for_document(&docx_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].text.contains("Quarterly review\nRevenue grew"));
    assert!(chunks[0].embedding.is_empty());

    let stats = collect_stats(app.manifest.as_ref(), app.store.as_ref())
        .await
        .unwrap();
    assert_eq!(stats.documents, 3);
    assert_eq!(stats.by_status.get("ingested"), Some(&2));
    assert_eq!(stats.by_status.get("error"), Some(&1));
    assert_eq!(stats.embedded_chunks, 0);

    std::fs::remove_file(root.join("notes/meeting.md")).unwrap();
    let report = app.orchestrator.check_integrity().await.unwrap();
    assert_eq!(report.orphaned.len(), 1);

    let pruned = app.orchestrator.prune_orphans().await.unwrap();
    assert_eq!(pruned.success, 1);
    app.close().await;

    // State survives a reopen.
    let app = App::open(&config).await.unwrap();
    let meeting_id = document_id_for("notes/meeting.md");
    assert!(app.manifest.get(&meeting_id).await.unwrap().is_none());
    assert!(app
        .store
        .chunks_for_document(&meeting_id)
        .await
        .unwrap()
        .is_empty());
    let history = app.manifest.history().await.unwrap();
    let tomb = history.iter().find(|e| e.id == meeting_id).unwrap();
    assert_eq!(tomb.status, DocumentStatus::Removed);
    assert!(tomb.removed_at.is_some());

    let report = app.orchestrator.check_integrity().await.unwrap();
    assert!(report.orphaned.is_empty());
    assert_eq!(report.healthy.len(), 1);
    app.close().await;
}

#[tokio::test]
async fn repair_picks_up_an_edited_file() {
    let (_tmp, config) = setup();
    let root = config.source.root.clone();
    write(&root, "a.txt", b"first draft");

    let app = App::open(&config).await.unwrap();
    let first = app.orchestrator.repair_file("a.txt").await.unwrap();
    assert_eq!(first.status, DocumentStatus::Ingested);
    let derivative = first.refined_file.clone().unwrap();
    assert_eq!(std::fs::read_to_string(&derivative).unwrap(), "first draft");

    write(&root, "a.txt", b"second draft, longer");
    let report = app.orchestrator.check_integrity().await.unwrap();
    assert_eq!(report.missing_refinement.len(), 1);

    let second = app.orchestrator.repair_file("a.txt").await.unwrap();
    assert!(second.is_success());
    assert_eq!(
        std::fs::read_to_string(&derivative).unwrap(),
        "second draft, longer"
    );
    let chunks = app.store.chunks_for_document(&first.document_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "second draft, longer");

    let entry = app.manifest.get(&first.document_id).await.unwrap().unwrap();
    assert_eq!(entry.ingested_fingerprint, entry.refined_fingerprint);
    assert_eq!(entry.refined_fingerprint.as_deref(), Some(entry.fingerprint.as_str()));
    app.close().await;
}

#[tokio::test]
async fn sqlite_replace_is_atomic_for_readers() {
    let (_tmp, config) = setup();
    let app = App::open(&config).await.unwrap();
    let id = document_id_for("big.md");
    let policy = ChunkingPolicy {
        max_tokens: 64,
        overlap_tokens: 8,
    };
    let revision = |rev: usize| {
        let text: String = (0..30)
            .map(|i| format!("Section {} rev-{} {}", i, rev, "words ".repeat(40)))
            .collect::<Vec<_>>()
            .join("\n\n");
        chunk_text(&id, &text, &policy)
    };

    app.store.replace_chunks(&id, &revision(0)).await.unwrap();

    let stop = CancellationToken::new();
    let reader = {
        let store = app.store.clone();
        let stop = stop.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut reads = 0usize;
            while !stop.is_cancelled() {
                let chunks = store.chunks_for_document(&id).await.unwrap();
                assert!(!chunks.is_empty());
                let revs: std::collections::HashSet<&str> = chunks
                    .iter()
                    .flat_map(|c| c.text.split_whitespace())
                    .filter(|w| w.starts_with("rev-"))
                    .collect();
                assert_eq!(revs.len(), 1, "mixed revisions: {:?}", revs);
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    for rev in 1..20 {
        app.store.replace_chunks(&id, &revision(rev)).await.unwrap();
        tokio::task::yield_now().await;
    }
    stop.cancel();
    assert!(reader.await.unwrap() > 0);
    app.close().await;
}
