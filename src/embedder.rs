//! Embedding manager: caching, batching, retries, and provider fallback.
//!
//! Wraps an [`EmbeddingProvider`] and adds the operational layer the raw
//! providers don't have:
//!
//! - an LRU embedding cache in the store (keyed by provider, model,
//!   provider key, and chunk hash),
//! - greedy sub-batch packing bounded by a byte-estimate token cap,
//! - retry with jittered exponential backoff for transient errors,
//! - per-call timeouts (remote and local providers get different budgets),
//! - remote batch submission with polling, a one-retry timeout policy,
//!   and a mutex-guarded sliding failure counter that disables batch mode
//!   for this manager's lifetime once it trips,
//! - exactly-once fallback to a configured secondary provider.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chunker::{estimate_tokens, hash_text, Chunk};
use crate::config::{EmbeddingSettings, ProviderKind, Source};
use crate::provider::{
    create_provider, provider_key, BatchPoll, BatchRequest, EmbeddingProvider, ProviderError,
};
use crate::store::{blob_to_vec, vec_to_blob};

/// Cumulative token cap for one online sub-batch (same byte-estimate
/// unit as the chunker).
const EMBEDDING_BATCH_MAX_TOKENS: usize = 8_000;
/// Retry schedule: 500ms base, x2 per attempt, capped at 8s, ±20% jitter.
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;
const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_JITTER: f64 = 0.2;
/// Consecutive remote-batch failures before batch mode is disabled for
/// this manager's lifetime.
const BATCH_FAILURE_LIMIT: u32 = 2;
const BATCH_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Per-call budgets. Local inference gets the long budget.
const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const LOCAL_CALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Cache lookups are chunked to bound prepared-statement parameters.
const CACHE_READ_GROUP: usize = 400;
const PROBE_TEXT: &str = "ping";
/// Worker-pool width for per-file indexing when batch mode is off.
const DEFAULT_INDEX_CONCURRENCY: usize = 4;

/// Identifies the file a set of chunks came from, for remote-batch
/// custom-id derivation.
#[derive(Debug, Clone, Copy)]
pub struct FileRef<'a> {
    pub path: &'a str,
    pub hash: &'a str,
}

#[derive(Debug, Clone)]
pub struct EmbedderStatus {
    pub provider: ProviderKind,
    pub model: String,
    pub dims: usize,
    pub batch_enabled: bool,
    pub fallback_activated: bool,
}

struct FallbackState {
    activated: bool,
}

pub struct EmbeddingManager {
    settings: EmbeddingSettings,
    provider: RwLock<Arc<dyn EmbeddingProvider>>,
    key: RwLock<String>,
    fallback: StdMutex<FallbackState>,
    batch_enabled: AtomicBool,
    /// Guards the failure counter and the enabled-flag transition so the
    /// enable→disable edge happens exactly once.
    batch_failures: Mutex<u32>,
}

impl EmbeddingManager {
    pub fn new(settings: EmbeddingSettings) -> Result<Self> {
        let provider = create_provider(&settings, settings.provider)?;
        Ok(Self::with_provider(settings, provider))
    }

    /// Build around an existing provider instance (tests, injection).
    pub fn with_provider(
        settings: EmbeddingSettings,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let key = provider_key(provider.as_ref());
        let batch_enabled = settings.batch.enabled;
        Self {
            settings,
            provider: RwLock::new(provider),
            key: RwLock::new(key),
            fallback: StdMutex::new(FallbackState { activated: false }),
            batch_enabled: AtomicBool::new(batch_enabled),
            batch_failures: Mutex::new(0),
        }
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider.read().expect("provider lock").clone()
    }

    /// Stable non-secret hash of the active provider configuration.
    pub fn provider_key(&self) -> String {
        self.key.read().expect("provider key lock").clone()
    }

    pub fn model(&self) -> String {
        self.provider().model().to_string()
    }

    pub fn max_input_tokens(&self) -> usize {
        self.provider().max_input_tokens()
    }

    /// Worker-pool width for per-file indexing.
    pub fn index_concurrency(&self) -> usize {
        if self.batch_enabled.load(Ordering::SeqCst) {
            self.settings.batch.concurrency
        } else {
            DEFAULT_INDEX_CONCURRENCY
        }
    }

    pub fn status(&self) -> EmbedderStatus {
        let provider = self.provider();
        EmbedderStatus {
            provider: provider.id(),
            model: provider.model().to_string(),
            dims: provider.dims(),
            batch_enabled: self.batch_enabled.load(Ordering::SeqCst),
            fallback_activated: self.fallback.lock().expect("fallback lock").activated,
        }
    }

    fn call_timeout(&self) -> Duration {
        if self.provider().is_local() {
            LOCAL_CALL_TIMEOUT
        } else {
            REMOTE_CALL_TIMEOUT
        }
    }

    /// Embed a single query string, subject to the per-call timeout.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.provider();
        let budget = self.call_timeout();
        let vector = tokio::time::timeout(budget, provider.embed_query(text))
            .await
            .map_err(|_| ProviderError::Timeout(budget.as_secs()))?
            .context("embedding query failed")?;
        Ok(vector)
    }

    /// Embed a one-word probe to check the provider is reachable.
    pub async fn probe_availability(&self) -> Result<()> {
        self.embed_query(PROBE_TEXT).await.map(|_| ())
    }

    /// Embed a file's chunks, returning vectors aligned by index.
    ///
    /// Cache hits are served from the store. Misses go through the remote
    /// batch path when it is enabled and `(file, source)` are provided,
    /// otherwise through online sub-batches. Fresh vectors are written
    /// back to the cache in one transaction.
    pub async fn embed_chunks(
        &self,
        pool: &SqlitePool,
        chunks: &[Chunk],
        file: Option<FileRef<'_>>,
        source: Option<Source>,
    ) -> Result<Vec<Vec<f32>>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let provider = self.provider();
        let key = self.provider_key();
        let provider_name = provider.id().as_str().to_string();
        let model = provider.model().to_string();

        let mut by_hash: HashMap<String, Vec<f32>> = HashMap::new();
        let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();

        // Cache lookup, in bounded groups.
        for group in hashes.chunks(CACHE_READ_GROUP) {
            let placeholders = vec!["?"; group.len()].join(", ");
            let sql = format!(
                "SELECT hash, embedding FROM embedding_cache \
                 WHERE provider = ? AND model = ? AND provider_key = ? AND hash IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql)
                .bind(&provider_name)
                .bind(&model)
                .bind(&key);
            for hash in group {
                query = query.bind(hash);
            }
            for row in query.fetch_all(pool).await? {
                let hash: String = row.get("hash");
                let blob: Vec<u8> = row.get("embedding");
                by_hash.insert(hash, blob_to_vec(&blob));
            }
        }

        let hit_hashes: Vec<String> = by_hash.keys().cloned().collect();

        // Unique misses, in first-seen order.
        let mut misses: Vec<&Chunk> = Vec::new();
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for chunk in chunks {
            if !by_hash.contains_key(&chunk.hash) && seen.insert(chunk.hash.as_str()) {
                misses.push(chunk);
            }
        }

        if !misses.is_empty() {
            let fresh = self
                .embed_misses(provider.as_ref(), &misses, file, source)
                .await?;
            let now = chrono::Utc::now().timestamp();

            // One write transaction: upsert fresh rows, refresh hit rows.
            let mut tx = pool.begin().await?;
            for (chunk, vector) in misses.iter().zip(fresh.iter()) {
                sqlx::query(
                    r#"
                    INSERT INTO embedding_cache
                        (provider, model, provider_key, hash, embedding, dims, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                        embedding = excluded.embedding,
                        dims = excluded.dims,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&provider_name)
                .bind(&model)
                .bind(&key)
                .bind(&chunk.hash)
                .bind(vec_to_blob(vector))
                .bind(vector.len() as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            for group in hit_hashes.chunks(CACHE_READ_GROUP) {
                let placeholders = vec!["?"; group.len()].join(", ");
                let sql = format!(
                    "UPDATE embedding_cache SET updated_at = ? \
                     WHERE provider = ? AND model = ? AND provider_key = ? AND hash IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql)
                    .bind(now)
                    .bind(&provider_name)
                    .bind(&model)
                    .bind(&key);
                for hash in group {
                    query = query.bind(hash);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;

            for (chunk, vector) in misses.iter().zip(fresh.into_iter()) {
                by_hash.insert(chunk.hash.clone(), vector);
            }
        } else if !hit_hashes.is_empty() {
            let now = chrono::Utc::now().timestamp();
            let mut tx = pool.begin().await?;
            for group in hit_hashes.chunks(CACHE_READ_GROUP) {
                let placeholders = vec!["?"; group.len()].join(", ");
                let sql = format!(
                    "UPDATE embedding_cache SET updated_at = ? \
                     WHERE provider = ? AND model = ? AND provider_key = ? AND hash IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql)
                    .bind(now)
                    .bind(&provider_name)
                    .bind(&model)
                    .bind(&key);
                for hash in group {
                    query = query.bind(hash);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;
        }

        Ok(chunks
            .iter()
            .map(|chunk| by_hash.get(&chunk.hash).cloned().unwrap_or_default())
            .collect())
    }

    async fn embed_misses(
        &self,
        provider: &dyn EmbeddingProvider,
        misses: &[&Chunk],
        file: Option<FileRef<'_>>,
        source: Option<Source>,
    ) -> Result<Vec<Vec<f32>>> {
        if let (Some(file), Some(source)) = (file, source) {
            if self.batch_enabled.load(Ordering::SeqCst) && provider.remote_batch().is_some() {
                match self
                    .embed_remote_batch(provider, misses, file, source)
                    .await
                {
                    Ok(vectors) => {
                        *self.batch_failures.lock().await = 0;
                        return Ok(vectors);
                    }
                    Err(e) => {
                        self.record_batch_failure(&e).await;
                        warn!(error = %e, path = file.path, "remote batch failed, falling back to online embedding");
                    }
                }
            }
        }

        let texts: Vec<String> = misses.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in pack_batches(&texts, EMBEDDING_BATCH_MAX_TOKENS) {
            let slice: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let embedded = self
                .embed_batch_with_retry(provider, &slice)
                .await
                .context("embedding batch failed")?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// One remote batch job per file: submit every miss with a stable
    /// custom id, poll until completion, time out per settings. A timed
    /// out job is retried once.
    async fn embed_remote_batch(
        &self,
        provider: &dyn EmbeddingProvider,
        misses: &[&Chunk],
        file: FileRef<'_>,
        source: Source,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let api = provider
            .remote_batch()
            .ok_or_else(|| ProviderError::BatchUnavailable("provider has no batch API".into()))?;

        let requests: Vec<BatchRequest> = misses
            .iter()
            .enumerate()
            .map(|(index, chunk)| BatchRequest {
                custom_id: batch_custom_id(source, file.path, chunk, index),
                text: chunk.text.clone(),
            })
            .collect();

        let timeout = Duration::from_secs(self.settings.batch.timeout_minutes * 60);
        let result = match self.run_batch_job(api, &requests, timeout).await {
            Err(ProviderError::Timeout(secs)) => {
                debug!(path = file.path, "remote batch timed out after {secs}s, retrying once");
                self.run_batch_job(api, &requests, timeout).await
            }
            other => other,
        }?;

        requests
            .iter()
            .map(|request| {
                result.get(&request.custom_id).cloned().ok_or_else(|| {
                    ProviderError::Other(format!(
                        "batch result missing custom_id {}",
                        request.custom_id
                    ))
                })
            })
            .collect()
    }

    async fn run_batch_job(
        &self,
        api: &dyn crate::provider::RemoteBatchApi,
        requests: &[BatchRequest],
        timeout: Duration,
    ) -> Result<HashMap<String, Vec<f32>>, ProviderError> {
        let job_id = api.submit(requests).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(BATCH_POLL_INTERVAL).await;
            match api.poll(&job_id).await? {
                BatchPoll::Pending => continue,
                BatchPoll::Completed(map) => return Ok(map),
                BatchPoll::Failed(reason) => return Err(ProviderError::Other(reason)),
            }
        }
    }

    /// Count a batch failure under the failure lock. A permanent
    /// "not available" disables batch immediately; otherwise the sliding
    /// counter disables it at the limit.
    async fn record_batch_failure(&self, error: &ProviderError) {
        let mut failures = self.batch_failures.lock().await;
        if matches!(error, ProviderError::BatchUnavailable(_)) {
            self.batch_enabled.store(false, Ordering::SeqCst);
            warn!("remote batch not available, disabling batch mode");
            return;
        }
        *failures += 1;
        if *failures >= BATCH_FAILURE_LIMIT && self.batch_enabled.swap(false, Ordering::SeqCst) {
            warn!(
                failures = *failures,
                "remote batch failure limit reached, disabling batch mode"
            );
        }
    }

    /// Call the provider's batch endpoint with retry on transient errors.
    async fn embed_batch_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let budget = if provider.is_local() {
            LOCAL_CALL_TIMEOUT
        } else {
            REMOTE_CALL_TIMEOUT
        };

        let mut attempt = 1u32;
        loop {
            let result = tokio::time::timeout(budget, provider.embed_batch(texts))
                .await
                .map_err(|_| ProviderError::Timeout(budget.as_secs()))
                .and_then(|inner| inner);

            match result {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < RETRY_MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    debug!(error = %e, attempt, "transient embedding error, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Switch to the configured fallback provider. At most once per
    /// manager lifetime; returns whether the switch happened.
    pub fn activate_fallback(&self, reason: &str) -> Result<bool> {
        let fallback_kind = match self.settings.fallback {
            Some(kind) => kind,
            None => return Ok(false),
        };

        let mut state = self.fallback.lock().expect("fallback lock");
        if state.activated {
            return Ok(false);
        }
        if fallback_kind == self.provider().id() {
            return Ok(false);
        }

        let provider = create_provider(&self.settings, fallback_kind)
            .with_context(|| format!("failed to construct fallback provider {fallback_kind}"))?;
        let new_key = provider_key(provider.as_ref());

        warn!(
            from = %self.provider().id(),
            to = %fallback_kind,
            reason,
            "activating embedding provider fallback"
        );

        *self.provider.write().expect("provider lock") = provider;
        *self.key.write().expect("provider key lock") = new_key;
        state.activated = true;
        Ok(true)
    }

    /// Copy another store's embedding cache into `to` (reindex seeding).
    pub async fn seed_embedding_cache(
        &self,
        from: &SqlitePool,
        to: &SqlitePool,
    ) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT provider, model, provider_key, hash, embedding, dims, updated_at \
             FROM embedding_cache",
        )
        .fetch_all(from)
        .await?;

        let mut tx = to.begin().await?;
        let mut copied = 0u64;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO embedding_cache
                    (provider, model, provider_key, hash, embedding, dims, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(row.get::<String, _>("provider"))
            .bind(row.get::<String, _>("model"))
            .bind(row.get::<String, _>("provider_key"))
            .bind(row.get::<String, _>("hash"))
            .bind(row.get::<Vec<u8>, _>("embedding"))
            .bind(row.get::<i64, _>("dims"))
            .bind(row.get::<i64, _>("updated_at"))
            .execute(&mut *tx)
            .await?;
            copied += 1;
        }
        tx.commit().await?;
        Ok(copied)
    }

    /// Evict least-recently-used cache rows past the configured budget.
    pub async fn prune_embedding_cache_if_needed(&self, pool: &SqlitePool) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(pool)
            .await?;
        let max = self.settings.cache.max_entries as i64;
        if count <= max {
            return Ok(0);
        }
        let excess = count - max;
        let result = sqlx::query(
            "DELETE FROM embedding_cache WHERE rowid IN \
             (SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?)",
        )
        .bind(excess)
        .execute(pool)
        .await?;
        debug!(evicted = result.rows_affected(), "pruned embedding cache");
        Ok(result.rows_affected())
    }
}

/// Derive the stable per-chunk custom id for a remote batch request.
fn batch_custom_id(source: Source, path: &str, chunk: &Chunk, index: usize) -> String {
    let digest = hash_text(&format!(
        "{}:{}:{}:{}:{}:{}",
        source, path, chunk.start_line, chunk.end_line, chunk.hash, index
    ));
    digest[..16].to_string()
}

/// Greedily pack text indices into sub-batches bounded by a cumulative
/// token cap. An oversized item forms its own singleton batch.
fn pack_batches(texts: &[String], cap: usize) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for (index, text) in texts.iter().enumerate() {
        let tokens = estimate_tokens(text);
        if tokens > cap {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            batches.push(vec![index]);
            continue;
        }
        if !current.is_empty() && current_tokens + tokens > cap {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(index);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Exponential backoff with ±20% jitter: 500ms, 1s, 2s, ... capped at 8s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1 << (attempt - 1).min(10));
    let capped = exp.min(RETRY_MAX_DELAY_MS) as f64;
    let jitter = rand::thread_rng().gen_range(-RETRY_JITTER..=RETRY_JITTER);
    Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct MockProvider {
        calls: AtomicUsize,
        fail_first: usize,
        kind: ProviderKind,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                kind: ProviderKind::OpenAi,
            }
        }

        fn failing(times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: times,
                kind: ProviderKind::OpenAi,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockProvider {
        fn id(&self) -> ProviderKind {
            self.kind
        }
        fn model(&self) -> &str {
            "mock-model"
        }
        fn dims(&self) -> usize {
            4
        }
        fn base_url(&self) -> &str {
            "mock://provider"
        }
        fn max_input_tokens(&self) -> usize {
            8000
        }

        async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            let mut out = self.embed_batch(&[text.to_string()]).await?;
            Ok(out.pop().unwrap())
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ProviderError::RateLimited("mock rate limit".into()));
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.0, 0.0])
                .collect())
        }
    }

    fn chunk_of(text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            start_line: 1,
            end_line: 1,
            hash: hash_text(text),
        }
    }

    async fn test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("idx.db")).await.unwrap();
        store.init_schema().await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn cache_serves_second_call() {
        let (_tmp, store) = test_store().await;
        let provider = Arc::new(MockProvider::new());
        let manager =
            EmbeddingManager::with_provider(EmbeddingSettings::default(), provider.clone());

        let chunks = vec![chunk_of("alpha"), chunk_of("beta")];
        let first = manager
            .embed_chunks(store.pool(), &chunks, None, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let calls_after_first = provider.calls();
        assert!(calls_after_first >= 1);

        let second = manager
            .embed_chunks(store.pool(), &chunks, None, None)
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(provider.calls(), calls_after_first, "second call must be cache-only");

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 2);
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_errors() {
        let provider = MockProvider::failing(2);
        let manager = EmbeddingManager::with_provider(
            EmbeddingSettings::default(),
            Arc::new(MockProvider::new()),
        );
        let texts = vec!["hello".to_string()];
        let vectors = manager
            .embed_batch_with_retry(&provider, &texts)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        struct BadRequestProvider;
        #[async_trait]
        impl EmbeddingProvider for BadRequestProvider {
            fn id(&self) -> ProviderKind {
                ProviderKind::OpenAi
            }
            fn model(&self) -> &str {
                "mock"
            }
            fn dims(&self) -> usize {
                4
            }
            fn base_url(&self) -> &str {
                ""
            }
            fn max_input_tokens(&self) -> usize {
                8000
            }
            async fn embed_query(&self, _: &str) -> Result<Vec<f32>, ProviderError> {
                Err(ProviderError::BadRequest {
                    status: 400,
                    body: "nope".into(),
                })
            }
            async fn embed_batch(&self, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
                Err(ProviderError::BadRequest {
                    status: 400,
                    body: "nope".into(),
                })
            }
        }

        let manager = EmbeddingManager::with_provider(
            EmbeddingSettings::default(),
            Arc::new(MockProvider::new()),
        );
        let err = manager
            .embed_batch_with_retry(&BadRequestProvider, &["x".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::BadRequest { .. }));
    }

    #[test]
    fn oversized_item_forms_singleton_batch() {
        let cap = 10;
        let texts = vec![
            "aaaa".to_string(),            // 1 token
            "b".repeat(100),               // 25 tokens, over cap
            "cccc".to_string(),            // 1 token
        ];
        let batches = pack_batches(&texts, cap);
        assert_eq!(batches, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn packing_respects_cumulative_cap() {
        let cap = 2;
        let texts = vec![
            "aaaa".to_string(), // 1 token each
            "bbbb".to_string(),
            "cccc".to_string(),
        ];
        let batches = pack_batches(&texts, cap);
        assert_eq!(batches, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 1..=6 {
            let delay = backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(9600));
        }
    }

    #[tokio::test]
    async fn lru_prune_keeps_most_recent() {
        let (_tmp, store) = test_store().await;
        let mut settings = EmbeddingSettings::default();
        settings.cache.max_entries = 3;
        let manager =
            EmbeddingManager::with_provider(settings, Arc::new(MockProvider::new()));

        for (i, ts) in [1i64, 2, 3, 4].iter().enumerate() {
            sqlx::query(
                "INSERT INTO embedding_cache \
                 (provider, model, provider_key, hash, embedding, dims, updated_at) \
                 VALUES ('p', 'm', 'k', ?, X'00000000', 1, ?)",
            )
            .bind(format!("hash-{i}"))
            .bind(ts)
            .execute(store.pool())
            .await
            .unwrap();
        }

        let evicted = manager
            .prune_embedding_cache_if_needed(store.pool())
            .await
            .unwrap();
        assert_eq!(evicted, 1);

        let remaining: Vec<i64> =
            sqlx::query_scalar("SELECT updated_at FROM embedding_cache ORDER BY updated_at")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(remaining, vec![2, 3, 4]);
        store.close().await;
    }

    #[tokio::test]
    async fn fallback_activates_exactly_once() {
        let mut settings = EmbeddingSettings::default();
        settings.fallback = Some(ProviderKind::Local);
        let manager =
            EmbeddingManager::with_provider(settings, Arc::new(MockProvider::new()));
        let key_before = manager.provider_key();

        assert!(manager.activate_fallback("rate limited").unwrap());
        assert_eq!(manager.provider().id(), ProviderKind::Local);
        assert_ne!(manager.provider_key(), key_before);

        // Second activation refuses.
        assert!(!manager.activate_fallback("again").unwrap());
    }

    #[tokio::test]
    async fn fallback_refuses_same_family_and_none() {
        let manager = EmbeddingManager::with_provider(
            EmbeddingSettings::default(),
            Arc::new(MockProvider::new()),
        );
        assert!(!manager.activate_fallback("no fallback configured").unwrap());

        let mut settings = EmbeddingSettings::default();
        settings.fallback = Some(ProviderKind::OpenAi);
        let manager =
            EmbeddingManager::with_provider(settings, Arc::new(MockProvider::new()));
        assert!(!manager.activate_fallback("same family").unwrap());
    }

    #[tokio::test]
    async fn seed_copies_cache_between_stores() {
        let (_tmp_a, a) = test_store().await;
        let (_tmp_b, b) = test_store().await;
        let manager = EmbeddingManager::with_provider(
            EmbeddingSettings::default(),
            Arc::new(MockProvider::new()),
        );

        let chunks = vec![chunk_of("seed me")];
        manager
            .embed_chunks(a.pool(), &chunks, None, None)
            .await
            .unwrap();

        let copied = manager
            .seed_embedding_cache(a.pool(), b.pool())
            .await
            .unwrap();
        assert_eq!(copied, 1);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(b.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
        a.close().await;
        b.close().await;
    }
}
