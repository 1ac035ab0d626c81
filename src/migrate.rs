//! Database schema migrations (idempotent).
//!
//! Two tables:
//!
//! - `manifest`: one row per document id ever seen. Tombstoned rows keep
//!   their history with `removed_at` set.
//! - `chunks`: the corpus. Each row is one chunk with its embedding BLOB
//!   (little-endian `f32`s, NULL when embeddings are disabled) and its
//!   dimension count.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Connect to the configured database and apply the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an existing pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manifest (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            size INTEGER NOT NULL,
            discovered_at INTEGER NOT NULL,
            refined_fingerprint TEXT,
            refined_file TEXT,
            refined_at INTEGER,
            ingested_fingerprint TEXT,
            ingested_at INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            error_kind TEXT,
            error_message TEXT,
            updated_at INTEGER NOT NULL,
            removed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB,
            dims INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_manifest_filename ON manifest(filename)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_manifest_status ON manifest(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::Row;

    #[tokio::test]
    async fn test_chunks_schema_and_rerun() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        migrate_pool(&pool).await.unwrap();

        let columns: Vec<String> = sqlx::query("PRAGMA table_info(chunks)")
            .fetch_all(&pool)
            .await
            .unwrap()
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        assert_eq!(
            columns,
            vec!["id", "document_id", "chunk_index", "text", "hash", "embedding", "dims"]
        );
    }
}
