//! SQLite-backed [`CorpusStore`] and [`ManifestStore`] implementations.
//!
//! Timestamps are stored as Unix milliseconds. Chunk replacement runs the
//! delete and all inserts in one transaction, so under WAL a concurrent
//! reader sees the committed old set until the new set commits.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use corpus_harness_core::embedding::{blob_to_vec, vec_to_blob};
use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::models::{Chunk, DocumentStatus, ErrorInfo, ErrorKind, ManifestEntry};
use corpus_harness_core::store::{CorpusStore, StoreCounts};

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// SQLite implementation of [`CorpusStore`] over the `chunks` table.
#[derive(Clone)]
pub struct SqliteCorpusStore {
    pool: SqlitePool,
}

impl SqliteCorpusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CorpusStore for SqliteCorpusStore {
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            if chunk.document_id != document_id {
                return Err(anyhow!(
                    "chunk {} belongs to {}, not {}",
                    chunk.id,
                    chunk.document_id,
                    document_id
                ));
            }
            let blob = (!chunk.embedding.is_empty()).then(|| vec_to_blob(&chunk.embedding));
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash, embedding, dims) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(blob)
            .bind(chunk.embedding.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks_for_document(&self, document_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, text, hash, embedding FROM chunks \
             WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Chunk> {
                let blob: Option<Vec<u8>> = row.try_get("embedding")?;
                Ok(Chunk {
                    id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    chunk_index: row.try_get("chunk_index")?,
                    text: row.try_get("text")?,
                    hash: row.try_get("hash")?,
                    embedding: blob.map(|b| blob_to_vec(&b)).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT document_id) AS documents, COUNT(*) AS chunks, \
             COUNT(embedding) AS embedded FROM chunks",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            documents: row.try_get::<i64, _>("documents")? as u64,
            chunks: row.try_get::<i64, _>("chunks")? as u64,
            embedded_chunks: row.try_get::<i64, _>("embedded")? as u64,
        })
    }
}

/// SQLite implementation of [`ManifestStore`] over the `manifest` table.
#[derive(Clone)]
pub struct SqliteManifestStore {
    pool: SqlitePool,
}

impl SqliteManifestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const MANIFEST_COLUMNS: &str = "id, filename, fingerprint, size, discovered_at, \
     refined_fingerprint, refined_file, refined_at, ingested_fingerprint, ingested_at, \
     status, error_kind, error_message, updated_at, removed_at";

fn entry_from_row(row: &SqliteRow) -> Result<ManifestEntry> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<DocumentStatus>().map_err(|e| anyhow!(e))?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let error = match error_kind {
        Some(kind) => Some(ErrorInfo::new(
            kind.parse::<ErrorKind>().map_err(|e| anyhow!(e))?,
            error_message.unwrap_or_default(),
        )),
        None => None,
    };

    Ok(ManifestEntry {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        fingerprint: row.try_get("fingerprint")?,
        size: row.try_get::<i64, _>("size")? as u64,
        discovered_at: from_millis(row.try_get("discovered_at")?),
        refined_fingerprint: row.try_get("refined_fingerprint")?,
        refined_file: row.try_get("refined_file")?,
        refined_at: row.try_get::<Option<i64>, _>("refined_at")?.map(from_millis),
        ingested_fingerprint: row.try_get("ingested_fingerprint")?,
        ingested_at: row.try_get::<Option<i64>, _>("ingested_at")?.map(from_millis),
        status,
        error,
        updated_at: from_millis(row.try_get("updated_at")?),
        removed_at: row.try_get::<Option<i64>, _>("removed_at")?.map(from_millis),
    })
}

#[async_trait]
impl ManifestStore for SqliteManifestStore {
    async fn get(&self, id: &str) -> Result<Option<ManifestEntry>> {
        let sql = format!(
            "SELECT {} FROM manifest WHERE id = ? AND removed_at IS NULL",
            MANIFEST_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn upsert(&self, entry: &ManifestEntry) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO manifest ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                fingerprint = excluded.fingerprint,
                size = excluded.size,
                discovered_at = excluded.discovered_at,
                refined_fingerprint = excluded.refined_fingerprint,
                refined_file = excluded.refined_file,
                refined_at = excluded.refined_at,
                ingested_fingerprint = excluded.ingested_fingerprint,
                ingested_at = excluded.ingested_at,
                status = excluded.status,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at,
                removed_at = excluded.removed_at
            "#,
            MANIFEST_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.filename)
            .bind(&entry.fingerprint)
            .bind(entry.size as i64)
            .bind(to_millis(entry.discovered_at))
            .bind(&entry.refined_fingerprint)
            .bind(&entry.refined_file)
            .bind(entry.refined_at.map(to_millis))
            .bind(&entry.ingested_fingerprint)
            .bind(entry.ingested_at.map(to_millis))
            .bind(entry.status.as_str())
            .bind(entry.error.as_ref().map(|e| e.kind.as_str()))
            .bind(entry.error.as_ref().map(|e| e.message.as_str()))
            .bind(to_millis(entry.updated_at))
            .bind(entry.removed_at.map(to_millis))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            "UPDATE manifest SET removed_at = ?, updated_at = ?, status = ? \
             WHERE id = ? AND removed_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(DocumentStatus::Removed.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<ManifestEntry>> {
        let sql = format!(
            "SELECT {} FROM manifest WHERE removed_at IS NULL ORDER BY filename",
            MANIFEST_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn history(&self) -> Result<Vec<ManifestEntry>> {
        let sql = format!("SELECT {} FROM manifest ORDER BY filename", MANIFEST_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use corpus_harness_core::chunk::{chunk_text, ChunkingPolicy};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_with_error() {
        let store = SqliteManifestStore::new(memory_pool().await);
        let mut entry = ManifestEntry::new("decks/q3.pptx", "fp1", 42);
        entry.transition(DocumentStatus::Refining).unwrap();
        entry.mark_error(ErrorInfo::new(ErrorKind::Conversion, "corrupt zip"));
        store.upsert(&entry).await.unwrap();

        let got = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(got.filename, "decks/q3.pptx");
        assert_eq!(got.status, DocumentStatus::Error);
        assert_eq!(got.error, entry.error);
        assert_eq!(got.size, 42);
        assert_eq!(to_millis(got.discovered_at), to_millis(entry.discovered_at));
    }

    #[tokio::test]
    async fn test_manifest_tombstone_hides_entry() {
        let store = SqliteManifestStore::new(memory_pool().await);
        let entry = ManifestEntry::new("a.pdf", "fp1", 1);
        store.upsert(&entry).await.unwrap();
        assert!(store.remove(&entry.id).await.unwrap());

        assert!(store.get(&entry.id).await.unwrap().is_none());
        assert!(store.list_all().await.unwrap().is_empty());
        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DocumentStatus::Removed);
    }

    #[tokio::test]
    async fn test_replace_chunks_supersedes_and_keeps_vectors() {
        let store = SqliteCorpusStore::new(memory_pool().await);
        let policy = ChunkingPolicy {
            max_tokens: 2,
            overlap_tokens: 0,
        };
        let mut v1 = chunk_text("doc", "aaaa\n\nbbbb\n\ncccc", &policy);
        for c in &mut v1 {
            c.embedding = vec![0.25, -1.0];
        }
        store.replace_chunks("doc", &v1).await.unwrap();

        let v2 = chunk_text("doc", "dddd", &policy);
        store.replace_chunks("doc", &v2).await.unwrap();

        let got = store.chunks_for_document("doc").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "dddd");
        assert!(got[0].embedding.is_empty());

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.chunks, 1);
        assert_eq!(counts.embedded_chunks, 0);
    }

    #[tokio::test]
    async fn test_replace_rejects_foreign_chunk_and_rolls_back() {
        let store = SqliteCorpusStore::new(memory_pool().await);
        let policy = ChunkingPolicy::default();
        let original = chunk_text("doc", "original", &policy);
        store.replace_chunks("doc", &original).await.unwrap();

        let foreign = chunk_text("other", "intruder", &policy);
        assert!(store.replace_chunks("doc", &foreign).await.is_err());

        let got = store.chunks_for_document("doc").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "original");
    }
}
