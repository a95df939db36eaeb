//! SQLite store: connection, schema, and the vector BLOB codec.
//!
//! One database file per manager, WAL mode, single-writer. Tables:
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `meta` | Index metadata key/value (provider, model, chunking params) |
//! | `files` | One row per indexed file, keyed by `(path, source)` |
//! | `chunks` | Text segments with line provenance and a JSON embedding backup |
//! | `embedding_cache` | Embedding vectors keyed by provider/model/key/hash |
//! | `chunks_fts` | FTS5 full-text index over chunk text (BM25) |
//! | `chunks_vec` | Packed f32 embedding BLOBs, created lazily once dims are known |
//!
//! `chunks_fts` creation is guarded: when the SQLite build lacks FTS5 the
//! store still opens and keyword search degrades to empty results. The
//! caller records that outcome in its availability flags. `chunks_vec` is
//! not created here at all — it appears on first use via
//! `ensure_vector_table` when the embedding dimensionality is known.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Open handle to one index database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    path: PathBuf,
}

/// What the schema pass managed to create.
#[derive(Debug, Clone, Default)]
pub struct SchemaOutcome {
    pub fts_available: bool,
    pub fts_error: Option<String>,
}

impl Store {
    /// Open (or create) the database at `path` with WAL mode and a busy
    /// timeout, creating parent directories as needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open index database at {}", path.display()))?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create all tables. Idempotent. Returns which optional features
    /// (FTS5) came up.
    pub async fn init_schema(&self) -> Result<SchemaOutcome> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                path TEXT NOT NULL,
                source TEXT NOT NULL,
                hash TEXT NOT NULL,
                mtime INTEGER NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (path, source)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                source TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                hash TEXT NOT NULL,
                model TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_cache (
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                provider_key TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dims INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (provider, model, provider_key, hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path_source ON chunks(path, source)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_updated_at ON embedding_cache(updated_at)",
        )
        .execute(&self.pool)
        .await?;

        let mut outcome = SchemaOutcome::default();
        match self.create_fts_table().await {
            Ok(()) => outcome.fts_available = true,
            Err(e) => outcome.fts_error = Some(e.to_string()),
        }
        Ok(outcome)
    }

    /// Create the FTS5 virtual table unless it already exists.
    ///
    /// Every row stores the model string so indexes built under two
    /// different models can coexist during an upgrade; keyword search
    /// filters by the active model.
    async fn create_fts_table(&self) -> Result<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE chunks_fts USING fts5(
                    text,
                    id UNINDEXED,
                    path UNINDEXED,
                    source UNINDEXED,
                    model UNINDEXED,
                    start_line UNINDEXED,
                    end_line UNINDEXED
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Create the vector table if missing. Called once per open store,
    /// the first time a non-empty embedding's dimensionality is known.
    pub async fn ensure_vector_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks_vec (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn has_vector_table(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_vec'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), vec.len() * 4);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[tokio::test]
    async fn open_creates_db_and_schema() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("index.db");
        let store = Store::open(&db_path).await.unwrap();
        let outcome = store.init_schema().await.unwrap();
        assert!(db_path.exists());
        assert!(outcome.fts_available, "bundled SQLite should carry FTS5");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        store.close().await;
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("idx.db")).await.unwrap();
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn vector_table_is_lazy() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("idx.db")).await.unwrap();
        store.init_schema().await.unwrap();
        assert!(!store.has_vector_table().await.unwrap());
        store.ensure_vector_table().await.unwrap();
        assert!(store.has_vector_table().await.unwrap());
        store.close().await;
    }
}
