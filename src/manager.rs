//! Index manager: the façade that owns the store and coordinates the
//! chunker, embedding manager, and syncer.
//!
//! One manager exists per `(agent, workspace, settings)` triple, held in
//! a process-wide cache ([`MemoryIndexManager::get`]); `close` removes
//! the cache entry before releasing the store.
//!
//! The manager owns the transient feature flags (FTS5 availability,
//! vector-table readiness) and the crash-safe full reindex: the rebuild
//! runs against a temporary store which is swapped in with a three-file
//! rename (`base`, `-wal`, `-shm`) guarded by a backup, so a crash at any
//! point leaves either the old or the new index intact, never a hybrid.

use anyhow::{Context, Result};
use futures::Future;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{expand_user_path, Settings};
use crate::embedder::EmbeddingManager;
use crate::search::{fuse_hybrid, keyword_search, vector_search, SearchResult};
use crate::store::Store;
use crate::syncer::{SyncOptions, SyncReason, SyncReport, Syncer};

/// One-shot vector readiness attempts give up after this long.
const VECTOR_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Hybrid candidate over-fetch is capped here regardless of multiplier.
const CANDIDATE_CAP: usize = 200;
const META_KEY: &str = "index";

/// Metadata describing what the index on disk was built with. Rewritten
/// after each successful full reindex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    #[serde(default)]
    pub vector_dims: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    /// Session key for warm-session scheduling.
    pub session_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub files: i64,
    pub chunks: i64,
    pub dirty: bool,
    pub sessions_dirty: bool,
    pub provider: String,
    pub model: String,
    pub fts_available: bool,
    pub vector_available: bool,
    pub batch_enabled: bool,
    pub fallback_activated: bool,
    pub meta: Option<IndexMeta>,
}

#[derive(Debug, Clone, Default)]
struct FtsFlag {
    available: bool,
    load_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct VectorFlag {
    available: bool,
    dims: Option<usize>,
    load_error: Option<String>,
}

type CacheKey = (String, PathBuf, String);

static INDEX_CACHE: Lazy<Mutex<HashMap<CacheKey, Arc<MemoryIndexManager>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct MemoryIndexManager {
    agent_id: String,
    workspace_dir: PathBuf,
    settings: Settings,
    db_path: PathBuf,
    db: RwLock<Store>,
    embedder: Arc<EmbeddingManager>,
    syncer: once_cell::sync::OnceCell<Arc<Syncer>>,
    fts: StdRwLock<FtsFlag>,
    vector: StdRwLock<VectorFlag>,
    /// Memoized outcome of the one-shot vector-table readiness attempt.
    vector_ready: Mutex<Option<bool>>,
    closed: AtomicBool,
}

impl MemoryIndexManager {
    /// Open a manager directly, bypassing the process cache.
    pub async fn open(
        agent_id: &str,
        workspace_dir: &Path,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let embedder = Arc::new(EmbeddingManager::new(settings.embedding.clone())?);
        Self::open_with_embedder(agent_id, workspace_dir, settings, embedder).await
    }

    /// Open with a pre-built embedding manager (tests inject providers
    /// through this).
    pub async fn open_with_embedder(
        agent_id: &str,
        workspace_dir: &Path,
        settings: Settings,
        embedder: Arc<EmbeddingManager>,
    ) -> Result<Arc<Self>> {
        let db_path = expand_user_path(&settings.store.path);
        let store = Store::open(&db_path).await?;
        let outcome = store.init_schema().await?;

        let manager = Arc::new(Self {
            agent_id: agent_id.to_string(),
            workspace_dir: workspace_dir.to_path_buf(),
            settings,
            db_path,
            db: RwLock::new(store),
            embedder,
            syncer: once_cell::sync::OnceCell::new(),
            fts: StdRwLock::new(FtsFlag {
                available: outcome.fts_available,
                load_error: outcome.fts_error,
            }),
            vector: StdRwLock::new(VectorFlag::default()),
            vector_ready: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // A pre-existing vector table means readiness was reached in a
        // previous process; pick up the dims recorded in meta.
        {
            let store = manager.db_handle().await;
            if store.has_vector_table().await.unwrap_or(false) {
                let dims = manager
                    .read_meta()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|meta| meta.vector_dims);
                *manager.vector.write().expect("vector flag lock") = VectorFlag {
                    available: true,
                    dims,
                    load_error: None,
                };
                *manager.vector_ready.lock().await = Some(true);
            }
        }

        let syncer = Arc::new(Syncer::new(Arc::downgrade(&manager)));
        syncer.clone().start();
        manager
            .syncer
            .set(syncer)
            .map_err(|_| anyhow::anyhow!("syncer already attached"))?;

        info!(
            agent = %manager.agent_id,
            workspace = %manager.workspace_dir.display(),
            db = %manager.db_path.display(),
            "memory index manager opened"
        );
        Ok(manager)
    }

    /// Fetch (or create) the cached manager for this agent, workspace,
    /// and settings fingerprint.
    pub async fn get(
        agent_id: &str,
        workspace_dir: &Path,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let key: CacheKey = (
            agent_id.to_string(),
            workspace_dir.to_path_buf(),
            settings.fingerprint(),
        );
        let mut cache = INDEX_CACHE.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }
        let manager = Self::open(agent_id, workspace_dir, settings).await?;
        cache.insert(key, manager.clone());
        Ok(manager)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn embedder(&self) -> &Arc<EmbeddingManager> {
        &self.embedder
    }

    pub(crate) fn syncer(&self) -> &Arc<Syncer> {
        self.syncer.get().expect("syncer attached at open")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current store handle. During a reindex this is the temporary
    /// store, so all writes land in the rebuild.
    pub async fn db_handle(&self) -> Store {
        self.db.read().await.clone()
    }

    pub fn fts_available(&self) -> bool {
        self.fts.read().expect("fts flag lock").available
    }

    pub fn vector_available(&self) -> bool {
        self.vector.read().expect("vector flag lock").available
    }

    pub fn vector_dims(&self) -> Option<usize> {
        self.vector.read().expect("vector flag lock").dims
    }

    /// Make sure the vector table exists and matches `dims`. One attempt
    /// per open store (memoized), bounded by a 30s timeout. Returns
    /// whether vector writes may proceed.
    pub async fn ensure_vector_ready(&self, dims: usize) -> bool {
        let mut memo = self.vector_ready.lock().await;
        if let Some(ready) = *memo {
            if !ready {
                return false;
            }
            let recorded = self.vector_dims();
            match recorded {
                Some(existing) if existing != dims => {
                    warn!(existing, dims, "embedding dims changed mid-index, skipping vector write");
                    return false;
                }
                Some(_) => return true,
                None => {
                    self.vector.write().expect("vector flag lock").dims = Some(dims);
                    return true;
                }
            }
        }

        let store = self.db_handle().await;
        let attempt = tokio::time::timeout(VECTOR_READY_TIMEOUT, store.ensure_vector_table()).await;
        match attempt {
            Ok(Ok(())) => {
                *self.vector.write().expect("vector flag lock") = VectorFlag {
                    available: true,
                    dims: Some(dims),
                    load_error: None,
                };
                *memo = Some(true);
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "vector table unavailable");
                *self.vector.write().expect("vector flag lock") = VectorFlag {
                    available: false,
                    dims: None,
                    load_error: Some(e.to_string()),
                };
                *memo = Some(false);
                false
            }
            Err(_) => {
                warn!("vector table initialization timed out");
                *self.vector.write().expect("vector flag lock") = VectorFlag {
                    available: false,
                    dims: None,
                    load_error: Some("vector initialization timed out".to_string()),
                };
                *memo = Some(false);
                false
            }
        }
    }

    pub async fn read_meta(&self) -> Result<Option<IndexMeta>> {
        let store = self.db_handle().await;
        read_meta_pool(store.pool()).await
    }

    pub async fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        let store = self.db_handle().await;
        write_meta_pool(store.pool(), meta).await
    }

    /// The meta block describing the currently active configuration.
    pub fn current_meta(&self) -> IndexMeta {
        IndexMeta {
            model: self.embedder.model(),
            provider: self.embedder.provider().id().as_str().to_string(),
            provider_key: self.embedder.provider_key(),
            chunk_tokens: self.settings.chunking.tokens,
            chunk_overlap: self.settings.chunking.overlap,
            vector_dims: self.vector_dims(),
        }
    }

    /// Run one sync pass (see [`Syncer::sync`]). Concurrent calls share
    /// the in-flight pass.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncReport> {
        self.syncer().sync(options).await
    }

    /// Record that a session started; schedules a warm-up sync at most
    /// once per key per process.
    pub fn session_started(&self, session_key: &str) {
        self.syncer().warm_session(session_key);
    }

    /// Hybrid search. Never fails: scan and embedding errors degrade to
    /// an empty contribution from that side.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Vec<SearchResult> {
        let query = query.trim();
        if query.is_empty() || self.is_closed() {
            return Vec::new();
        }

        if let Some(session_key) = &options.session_key {
            self.session_started(session_key);
        }

        let syncer = self.syncer().clone();
        if self.settings.sync.on_search && syncer.is_dirty() {
            let sync_handle = syncer.clone();
            tokio::spawn(async move {
                if let Err(e) = sync_handle
                    .sync(SyncOptions::with_reason(SyncReason::Search))
                    .await
                {
                    debug!(error = %e, "on-search sync failed");
                }
            });
        }

        let max_results = options.max_results.unwrap_or(8).max(1);
        let min_score = options.min_score.unwrap_or(0.0);
        let candidates = ((max_results as f64 * self.settings.hybrid.candidate_multiplier)
            .floor() as usize)
            .max(1)
            .min(CANDIDATE_CAP);

        let store = self.db_handle().await;
        let model = self.embedder.model();
        let sources = self.settings.sources.clone();

        let keyword_side = async {
            if !self.settings.hybrid.enabled || !self.fts_available() {
                return Vec::new();
            }
            match keyword_search(store.pool(), query, candidates, &sources, &model).await {
                Ok(results) => results,
                Err(e) => {
                    debug!(error = %e, "keyword search failed");
                    Vec::new()
                }
            }
        };

        let vector_side = async {
            let embedded = match self.embedder.embed_query(query).await {
                Ok(vector) => vector,
                Err(e) => {
                    debug!(error = %e, "query embedding failed");
                    return Vec::new();
                }
            };
            if embedded.iter().all(|v| *v == 0.0) {
                return Vec::new();
            }
            match vector_search(store.pool(), &embedded, candidates, &sources, &model).await {
                Ok(results) => results,
                Err(e) => {
                    debug!(error = %e, "vector search failed");
                    Vec::new()
                }
            }
        };

        let (keyword_hits, vector_hits) = tokio::join!(keyword_side, vector_side);

        let mut results = if self.settings.hybrid.enabled {
            fuse_hybrid(
                vector_hits,
                keyword_hits,
                self.settings.hybrid.vector_weight,
                self.settings.hybrid.text_weight,
            )
        } else {
            vector_hits
        };

        results.retain(|r| r.score >= min_score);
        results.truncate(max_results);
        results
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let store = self.db_handle().await;
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(store.pool())
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await?;
        let embedder = self.embedder.status();
        let syncer = self.syncer();
        Ok(IndexStatus {
            files,
            chunks,
            dirty: syncer.memory_dirty(),
            sessions_dirty: syncer.sessions_dirty(),
            provider: embedder.provider.as_str().to_string(),
            model: embedder.model,
            fts_available: self.fts_available(),
            vector_available: self.vector_available(),
            batch_enabled: embedder.batch_enabled,
            fallback_activated: embedder.fallback_activated,
            meta: self.read_meta().await?,
        })
    }

    /// Full rebuild into a temporary store, atomically swapped in.
    ///
    /// 1. Open a fresh store at `<db>.tmp-<uuid>` and create its schema.
    /// 2. Seed its embedding cache from the live store.
    /// 3. Redirect `db` at the temp store and run `cb` (the sync passes).
    /// 4. On success write meta, prune the cache, close both stores, and
    ///    swap files under a backup; reopen from the real path.
    /// 5. On failure delete the temp files, restore the prior store and
    ///    flags, and rethrow.
    pub async fn reindex<T, F, Fut>(&self, cb: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let temp_path = PathBuf::from(format!(
            "{}.tmp-{}",
            self.db_path.display(),
            Uuid::new_v4()
        ));
        info!(temp = %temp_path.display(), "starting full reindex");

        let temp = Store::open(&temp_path).await?;
        let temp_outcome = match temp.init_schema().await {
            Ok(outcome) => outcome,
            Err(e) => {
                temp.close().await;
                remove_store_files(&temp_path);
                return Err(e);
            }
        };

        {
            let live = self.db_handle().await;
            if let Err(e) = self
                .embedder
                .seed_embedding_cache(live.pool(), temp.pool())
                .await
            {
                temp.close().await;
                remove_store_files(&temp_path);
                return Err(e).context("failed to seed embedding cache");
            }
        }

        // Redirect all subsequent reads and writes at the rebuild.
        let prior = {
            let mut guard = self.db.write().await;
            std::mem::replace(&mut *guard, temp.clone())
        };
        let prior_fts = self.fts.read().expect("fts flag lock").clone();
        let prior_vector = self.vector.read().expect("vector flag lock").clone();
        let prior_ready = *self.vector_ready.lock().await;

        *self.fts.write().expect("fts flag lock") = FtsFlag {
            available: temp_outcome.fts_available,
            load_error: temp_outcome.fts_error.clone(),
        };
        *self.vector.write().expect("vector flag lock") = VectorFlag::default();
        *self.vector_ready.lock().await = None;

        let result = cb().await;

        match result {
            Ok(value) => {
                let finish = async {
                    write_meta_pool(temp.pool(), &self.current_meta()).await?;
                    self.embedder
                        .prune_embedding_cache_if_needed(temp.pool())
                        .await?;
                    Ok::<(), anyhow::Error>(())
                }
                .await;

                if let Err(e) = finish {
                    self.restore_after_failed_reindex(
                        prior,
                        prior_fts,
                        prior_vector,
                        prior_ready,
                        &temp,
                        &temp_path,
                    )
                    .await;
                    return Err(e);
                }

                prior.close().await;
                temp.close().await;

                if let Err(e) = swap_store_files(&self.db_path, &temp_path) {
                    // The swap helper already restored the backup. Reopen
                    // the original path so the manager stays usable.
                    let reopened = Store::open(&self.db_path).await?;
                    let outcome = reopened.init_schema().await?;
                    *self.db.write().await = reopened;
                    *self.fts.write().expect("fts flag lock") = FtsFlag {
                        available: outcome.fts_available,
                        load_error: outcome.fts_error,
                    };
                    *self.vector.write().expect("vector flag lock") = VectorFlag::default();
                    *self.vector_ready.lock().await = None;
                    return Err(e);
                }

                let reopened = Store::open(&self.db_path).await?;
                let outcome = reopened.init_schema().await?;
                *self.db.write().await = reopened;
                *self.fts.write().expect("fts flag lock") = FtsFlag {
                    available: outcome.fts_available,
                    load_error: outcome.fts_error,
                };
                *self.vector.write().expect("vector flag lock") = VectorFlag::default();
                *self.vector_ready.lock().await = None;

                info!("full reindex complete");
                Ok(value)
            }
            Err(e) => {
                self.restore_after_failed_reindex(
                    prior,
                    prior_fts,
                    prior_vector,
                    prior_ready,
                    &temp,
                    &temp_path,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn restore_after_failed_reindex(
        &self,
        prior: Store,
        prior_fts: FtsFlag,
        prior_vector: VectorFlag,
        prior_ready: Option<bool>,
        temp: &Store,
        temp_path: &Path,
    ) {
        temp.close().await;
        remove_store_files(temp_path);
        *self.db.write().await = prior;
        *self.fts.write().expect("fts flag lock") = prior_fts;
        *self.vector.write().expect("vector flag lock") = prior_vector;
        *self.vector_ready.lock().await = prior_ready;
        warn!("full reindex failed, restored previous store");
    }

    /// Tear down: remove the cache entry, stop triggers, close the
    /// store. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let key: CacheKey = (
            self.agent_id.clone(),
            self.workspace_dir.clone(),
            self.settings.fingerprint(),
        );
        INDEX_CACHE.lock().await.remove(&key);

        if let Some(syncer) = self.syncer.get() {
            syncer.close();
        }
        self.db_handle().await.close().await;
        info!(agent = %self.agent_id, "memory index manager closed");
    }
}

pub async fn read_meta_pool(pool: &SqlitePool) -> Result<Option<IndexMeta>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(META_KEY)
        .fetch_optional(pool)
        .await?;
    match value {
        Some(json) => Ok(serde_json::from_str(&json).ok()),
        None => Ok(None),
    }
}

pub async fn write_meta_pool(pool: &SqlitePool, meta: &IndexMeta) -> Result<()> {
    let json = serde_json::to_string(meta)?;
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(META_KEY)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a store's base file and WAL side files, ignoring absences.
fn remove_store_files(base: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{}", base.display(), suffix));
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Atomically replace the live store files with the temp store files.
///
/// Three steps per suffix (`base`, `-wal`, `-shm`): live → backup,
/// temp → live; on failure the backup is renamed back and the error
/// surfaced; on success the backup is deleted.
fn swap_store_files(live: &Path, temp: &Path) -> Result<()> {
    let backup_base = format!("{}.backup-{}", live.display(), Uuid::new_v4());
    let suffixes = ["", "-wal", "-shm"];
    let mut backed_up: Vec<(PathBuf, PathBuf)> = Vec::new();

    let restore = |backed_up: &[(PathBuf, PathBuf)]| {
        for (live_path, backup_path) in backed_up.iter().rev() {
            let _ = std::fs::rename(backup_path, live_path);
        }
    };

    for suffix in suffixes {
        let live_path = PathBuf::from(format!("{}{}", live.display(), suffix));
        if live_path.exists() {
            let backup_path = PathBuf::from(format!("{backup_base}{suffix}"));
            if let Err(e) = std::fs::rename(&live_path, &backup_path) {
                restore(&backed_up);
                return Err(e).with_context(|| {
                    format!("failed to move {} aside", live_path.display())
                });
            }
            backed_up.push((live_path, backup_path));
        }
    }

    for suffix in suffixes {
        let temp_path = PathBuf::from(format!("{}{}", temp.display(), suffix));
        let live_path = PathBuf::from(format!("{}{}", live.display(), suffix));
        if temp_path.exists() {
            if let Err(e) = std::fs::rename(&temp_path, &live_path) {
                // Undo partially moved temp files, then restore backups.
                for undone in suffixes {
                    let moved = PathBuf::from(format!("{}{}", live.display(), undone));
                    let back = PathBuf::from(format!("{}{}", temp.display(), undone));
                    if undone == suffix {
                        break;
                    }
                    let _ = std::fs::rename(&moved, &back);
                }
                restore(&backed_up);
                return Err(e).with_context(|| {
                    format!("failed to swap in {}", temp_path.display())
                });
            }
        }
    }

    for (_, backup_path) in backed_up {
        let _ = std::fs::remove_file(backup_path);
    }
    Ok(())
}
