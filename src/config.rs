//! TOML settings parsing and validation.
//!
//! Settings are grouped per concern (`[store]`, `[chunking]`, `[embedding]`,
//! `[sync]`, `[hybrid]`) with serde defaults so a minimal file — or none at
//! all — yields a working configuration. [`load_settings`] validates ranges
//! and enumerations up front so the rest of the crate can trust the values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which content stream a row belongs to. Stored as its lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Memory,
    Sessions,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Memory => "memory",
            Source::Sessions => "sessions",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding provider families the index can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Voyage,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Voyage => "voyage",
            ProviderKind::Local => "local",
        }
    }

    /// Default model when the settings leave it unset.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "text-embedding-3-small",
            ProviderKind::Gemini => "text-embedding-004",
            ProviderKind::Voyage => "voyage-3-lite",
            ProviderKind::Local => "feature-hash-256",
        }
    }

    /// Default vector dimensionality for the default model.
    pub fn default_dims(&self) -> usize {
        match self {
            ProviderKind::OpenAi => 1536,
            ProviderKind::Gemini => 768,
            ProviderKind::Voyage => 512,
            ProviderKind::Local => 256,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    /// Content streams to index. Defaults to both.
    #[serde(default = "default_sources")]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub hybrid: HybridSettings,
    /// Extra memory files or directories outside the workspace roots.
    /// Directories are scanned for `*.md`; symlinks are ignored.
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    /// Override the session transcripts directory. Defaults to the
    /// agent's state directory.
    #[serde(default)]
    pub transcripts_dir: Option<PathBuf>,
}

fn default_sources() -> Vec<Source> {
    vec![Source::Memory, Source::Sessions]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            sources: default_sources(),
            chunking: ChunkingSettings::default(),
            embedding: EmbeddingSettings::default(),
            sync: SyncSettings::default(),
            hybrid: HybridSettings::default(),
            extra_paths: Vec::new(),
            transcripts_dir: None,
        }
    }
}

impl Settings {
    pub fn source_enabled(&self, source: Source) -> bool {
        self.sources.contains(&source)
    }

    /// Stable fingerprint of the whole settings tree. Used to key the
    /// process-wide manager cache so two callers with identical settings
    /// share one manager.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        hex[..16].to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Path to the SQLite index database. `~` is expanded to the home
    /// directory. WAL side files (`-wal`, `-shm`) live beside it.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("~/.memidx/index.db")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingSettings {
    /// Target chunk size in tokens (estimated as UTF-8 bytes / 4).
    #[serde(default = "default_chunk_tokens")]
    pub tokens: usize,
    /// Overlap between consecutive chunks, in the same unit.
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

fn default_chunk_tokens() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    80
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            tokens: default_chunk_tokens(),
            overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    /// Model name; falls back to the provider family default.
    #[serde(default)]
    pub model: Option<String>,
    /// Vector dimensionality; falls back to the model default.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Override the provider base URL (self-hosted gateways, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Provider to switch to after an unrecoverable embedding failure.
    /// `None` disables fallback.
    #[serde(default)]
    pub fallback: Option<ProviderKind>,
    /// Per-input clip limit in tokens. Chunks longer than this are
    /// truncated before embedding.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

fn default_provider() -> ProviderKind {
    ProviderKind::Local
}
fn default_max_input_tokens() -> usize {
    8000
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: None,
            fallback: None,
            max_input_tokens: default_max_input_tokens(),
            batch: BatchSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl EmbeddingSettings {
    pub fn model_name(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }
}

/// Remote batch-submission settings (providers that offer an async batch
/// API). Off by default; online embedding is always available as the
/// fallback path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Worker-pool width while batch mode is active.
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
    /// Per-batch-job timeout in minutes.
    #[serde(default = "default_batch_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_batch_concurrency() -> usize {
    8
}
fn default_batch_timeout_minutes() -> u64 {
    60
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_batch_concurrency(),
            timeout_minutes: default_batch_timeout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Embedding cache row budget; LRU-evicted past this.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_max_entries() -> usize {
    50_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Watch memory files and mark the index dirty on change.
    #[serde(default = "default_true")]
    pub watch: bool,
    /// Watcher debounce window in milliseconds; also used as the
    /// write-settling threshold.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
    /// Periodic sync interval in minutes; 0 disables the timer.
    #[serde(default)]
    pub interval_minutes: u64,
    /// Schedule a warm-up sync when a session starts (once per session
    /// key per process).
    #[serde(default = "default_true")]
    pub on_session_start: bool,
    /// Fire-and-forget a sync before searching when the index is dirty.
    #[serde(default = "default_true")]
    pub on_search: bool,
    #[serde(default)]
    pub thresholds: DeltaThresholds,
}

fn default_true() -> bool {
    true
}
fn default_watch_debounce_ms() -> u64 {
    1500
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            watch: true,
            watch_debounce_ms: default_watch_debounce_ms(),
            interval_minutes: 0,
            on_session_start: true,
            on_search: true,
            thresholds: DeltaThresholds::default(),
        }
    }
}

/// Session-delta thresholds: a transcript becomes indexable once enough
/// new bytes or new messages have accumulated since its last indexing.
/// A byte threshold of 0 means any pending bytes trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaThresholds {
    #[serde(default = "default_delta_bytes")]
    pub delta_bytes: u64,
    #[serde(default = "default_delta_messages")]
    pub delta_messages: u64,
}

fn default_delta_bytes() -> u64 {
    8192
}
fn default_delta_messages() -> u64 {
    10
}

impl Default for DeltaThresholds {
    fn default() -> Self {
        Self {
            delta_bytes: default_delta_bytes(),
            delta_messages: default_delta_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSettings {
    /// When false, search returns vector results only.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    /// Candidate over-fetch factor applied to `max_results` before the
    /// merge, capped at 200.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: f64,
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_text_weight() -> f64 {
    0.3
}
fn default_candidate_multiplier() -> f64 {
    4.0
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_user_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Load settings from a TOML file and validate them.
///
/// A missing file yields `Settings::default()` so the index works out of
/// the box; a present-but-invalid file is an error.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file: {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&content).with_context(|| "failed to parse settings file")?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.chunking.tokens == 0 {
        anyhow::bail!("chunking.tokens must be > 0");
    }
    if settings.chunking.overlap >= settings.chunking.tokens {
        anyhow::bail!("chunking.overlap must be smaller than chunking.tokens");
    }
    if settings.embedding.max_input_tokens == 0 {
        anyhow::bail!("embedding.max_input_tokens must be > 0");
    }
    if settings.embedding.batch.concurrency == 0 {
        anyhow::bail!("embedding.batch.concurrency must be > 0");
    }
    if settings.embedding.cache.max_entries == 0 {
        anyhow::bail!("embedding.cache.max_entries must be > 0");
    }
    for weight in [settings.hybrid.vector_weight, settings.hybrid.text_weight] {
        if !(0.0..=1.0).contains(&weight) {
            anyhow::bail!("hybrid weights must be in [0.0, 1.0]");
        }
    }
    if settings.hybrid.candidate_multiplier < 1.0 {
        anyhow::bail!("hybrid.candidate_multiplier must be >= 1.0");
    }
    if settings.sources.is_empty() {
        anyhow::bail!("at least one source must be enabled");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        validate(&settings).unwrap();
        assert!(settings.source_enabled(Source::Memory));
        assert!(settings.source_enabled(Source::Sessions));
        assert_eq!(settings.chunking.tokens, 400);
    }

    #[test]
    fn parse_minimal_toml() {
        let settings: Settings = toml::from_str(
            r#"
            [store]
            path = "/tmp/idx.db"

            [embedding]
            provider = "openai"

            [sync.thresholds]
            delta_bytes = 1024
            delta_messages = 5
            "#,
        )
        .unwrap();
        assert_eq!(settings.store.path, PathBuf::from("/tmp/idx.db"));
        assert_eq!(settings.embedding.provider, ProviderKind::OpenAi);
        assert_eq!(settings.embedding.model_name(), "text-embedding-3-small");
        assert_eq!(settings.sync.thresholds.delta_bytes, 1024);
        assert_eq!(settings.sync.thresholds.delta_messages, 5);
    }

    #[test]
    fn rejects_overlap_not_smaller_than_tokens() {
        let mut settings = Settings::default();
        settings.chunking.overlap = settings.chunking.tokens;
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn rejects_out_of_range_weights() {
        let mut settings = Settings::default();
        settings.hybrid.vector_weight = 1.5;
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = Settings::default();
        let b = Settings::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = Settings::default();
        c.chunking.tokens = 512;
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn expand_user_path_keeps_absolute() {
        let p = PathBuf::from("/var/data/idx.db");
        assert_eq!(expand_user_path(&p), p);
    }
}
