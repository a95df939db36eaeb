//! Sync scheduling and execution.
//!
//! The syncer decides *when* an indexing pass happens and *what* it
//! covers. Triggers, each gated on settings:
//!
//! - **memory watcher** — marks the index dirty and schedules a sync
//!   after the watch debounce window,
//! - **session listener** — subscribes to the process-wide transcript
//!   event bus, coalesces notifications for 5 seconds, then applies the
//!   byte/message delta policy per file,
//! - **periodic timer** — fires every `interval_minutes`,
//! - **on-demand** — `sync()` from the manager (search warm-up, session
//!   start, CLI).
//!
//! `sync()` deduplicates: a call while a pass is in flight awaits the
//! same shared future. A pass either runs incrementally against the live
//! store, or — when the stored meta no longer matches the active
//! configuration — inside a crash-safe full reindex driven by the
//! manager. Per-file work runs on a worker pool sized by the embedding
//! manager; file failures are logged and skipped unless they look
//! embedding-related, which aborts the pass (and can trigger provider
//! fallback followed by one forced restart).

use anyhow::{Context, Result};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunker::{chunk_id, chunk_markdown, hash_text, map_lines};
use crate::config::{expand_user_path, Settings, Source};
use crate::embedder::FileRef;
use crate::manager::MemoryIndexManager;
use crate::provider::embedding_related;
use crate::session::{
    render_transcript, resolve_session_transcripts_dir_for_agent, subscribe_session_updates,
};
use crate::store::{vec_to_blob, Store};
use crate::watcher::MemoryFileWatcher;

/// Session notifications are coalesced into one batch per window.
const SESSION_DEBOUNCE: Duration = Duration::from_secs(5);
/// Slab size for counting newlines in grown transcript ranges.
const NEWLINE_SLAB: usize = 64 * 1024;

/// Why a sync was requested. Session passes are never triggered by
/// `SessionStart` or `Watch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Manual,
    Interval,
    Watch,
    SessionDelta,
    SessionStart,
    Search,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncReason::Manual => "manual",
            SyncReason::Interval => "interval",
            SyncReason::Watch => "watch",
            SyncReason::SessionDelta => "session-delta",
            SyncReason::SessionStart => "session-start",
            SyncReason::Search => "search",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
    pub label: String,
}

pub type ProgressFn = Arc<dyn Fn(SyncProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SyncOptions {
    pub reason: Option<SyncReason>,
    pub force: bool,
    pub progress: Option<ProgressFn>,
}

impl SyncOptions {
    pub fn with_reason(reason: SyncReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    fn reason(&self) -> SyncReason {
        self.reason.unwrap_or(SyncReason::Manual)
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub reason: &'static str,
    pub full: bool,
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_indexed: usize,
    pub duration_ms: u64,
}

/// Accumulated new-content state for one transcript between syncs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionDelta {
    pub last_size: u64,
    pub pending_bytes: u64,
    pub pending_messages: u64,
}

type SharedSync = Shared<BoxFuture<'static, Result<SyncReport, Arc<anyhow::Error>>>>;

pub struct Syncer {
    manager: Weak<MemoryIndexManager>,
    settings: Settings,
    workspace_dir: PathBuf,
    transcripts_dir: PathBuf,

    dirty: AtomicBool,
    sessions_dirty: AtomicBool,
    sessions_dirty_files: StdMutex<HashSet<PathBuf>>,
    deltas: StdMutex<HashMap<PathBuf, SessionDelta>>,
    pending_sessions: StdMutex<HashSet<PathBuf>>,
    warm_sessions: StdMutex<HashSet<String>>,

    in_flight: Mutex<Option<SharedSync>>,
    watch_debounce: StdMutex<Option<JoinHandle<()>>>,
    session_debounce: StdMutex<Option<JoinHandle<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    watcher: StdMutex<Option<MemoryFileWatcher>>,
    closed: AtomicBool,
}

impl Syncer {
    pub fn new(manager: Weak<MemoryIndexManager>) -> Self {
        let (settings, workspace_dir, agent_id) = match manager.upgrade() {
            Some(mgr) => (
                mgr.settings().clone(),
                mgr.workspace_dir().to_path_buf(),
                mgr.agent_id().to_string(),
            ),
            None => (Settings::default(), PathBuf::new(), String::new()),
        };
        let transcripts_dir = settings
            .transcripts_dir
            .clone()
            .map(|dir| expand_user_path(&dir))
            .unwrap_or_else(|| resolve_session_transcripts_dir_for_agent(&agent_id));
        Self {
            manager,
            settings,
            workspace_dir,
            transcripts_dir,
            dirty: AtomicBool::new(false),
            sessions_dirty: AtomicBool::new(false),
            sessions_dirty_files: StdMutex::new(HashSet::new()),
            deltas: StdMutex::new(HashMap::new()),
            pending_sessions: StdMutex::new(HashSet::new()),
            warm_sessions: StdMutex::new(HashSet::new()),
            in_flight: Mutex::new(None),
            watch_debounce: StdMutex::new(None),
            session_debounce: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            watcher: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the configured triggers.
    pub fn start(self: Arc<Self>) {
        if self.settings.source_enabled(Source::Memory) && self.settings.sync.watch {
            self.start_watcher();
        }
        if self.settings.source_enabled(Source::Sessions) {
            self.start_session_listener();
        }
        if self.settings.sync.interval_minutes > 0 {
            self.start_interval_timer();
        }
    }

    fn start_watcher(self: &Arc<Self>) {
        let debounce = Duration::from_millis(self.settings.sync.watch_debounce_ms);
        match MemoryFileWatcher::start(self.watch_paths(), debounce) {
            Ok((watcher, mut rx)) => {
                *self.watcher.lock().expect("watcher lock") = Some(watcher);
                let this = self.clone();
                let handle = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if this.is_closed() {
                            break;
                        }
                        debug!(path = %event.path().display(), "memory change detected");
                        this.dirty.store(true, Ordering::SeqCst);
                        this.schedule_watch_sync();
                    }
                });
                self.tasks.lock().expect("tasks lock").push(handle);
            }
            Err(e) => warn!(error = %e, "failed to start memory watcher"),
        }
    }

    fn start_session_listener(self: &Arc<Self>) {
        let mut rx = subscribe_session_updates();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if this.is_closed() {
                            break;
                        }
                        if !event.session_file.starts_with(&this.transcripts_dir) {
                            continue;
                        }
                        this.pending_sessions
                            .lock()
                            .expect("pending sessions lock")
                            .insert(event.session_file);
                        this.schedule_session_debounce();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(handle);
    }

    fn start_interval_timer(self: &Arc<Self>) {
        let period = Duration::from_secs(self.settings.sync.interval_minutes * 60);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if this.is_closed() {
                    break;
                }
                if let Err(e) = this.sync(SyncOptions::with_reason(SyncReason::Interval)).await {
                    warn!(error = %e, "interval sync failed");
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(handle);
    }

    /// At most one pending watch timer; restarted on each event.
    fn schedule_watch_sync(self: &Arc<Self>) {
        let debounce = Duration::from_millis(self.settings.sync.watch_debounce_ms);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if this.is_closed() {
                return;
            }
            if let Err(e) = this.sync(SyncOptions::with_reason(SyncReason::Watch)).await {
                warn!(error = %e, "watch-triggered sync failed");
            }
        });
        let mut slot = self.watch_debounce.lock().expect("watch debounce lock");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// At most one pending session timer; restarted on each event.
    fn schedule_session_debounce(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(SESSION_DEBOUNCE).await;
            if this.is_closed() {
                return;
            }
            this.process_pending_sessions().await;
        });
        let mut slot = self.session_debounce.lock().expect("session debounce lock");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Apply the delta policy to every coalesced session notification,
    /// scheduling a sync when any file crossed its threshold.
    async fn process_pending_sessions(self: &Arc<Self>) {
        let pending: Vec<PathBuf> = {
            let mut guard = self.pending_sessions.lock().expect("pending sessions lock");
            guard.drain().collect()
        };
        if pending.is_empty() {
            return;
        }

        let mut any_triggered = false;
        for path in pending {
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "session file stat failed");
                    continue;
                }
            };

            let prior = self
                .deltas
                .lock()
                .expect("deltas lock")
                .get(&path)
                .copied()
                .unwrap_or_default();

            // Rotation (shrink) counts the whole new file; growth counts
            // only the appended range.
            let (range_start, range_end) = if size < prior.last_size {
                (0, size)
            } else {
                (prior.last_size, size)
            };
            let added_bytes = range_end.saturating_sub(range_start);
            let added_messages = if added_bytes > 0 {
                count_newlines_in_range(&path, range_start, range_end)
                    .await
                    .unwrap_or(0)
            } else {
                0
            };

            let mut delta = prior;
            delta.last_size = size;
            delta.pending_bytes += added_bytes;
            delta.pending_messages += added_messages;

            let thresholds = &self.settings.sync.thresholds;
            let bytes_hit = if thresholds.delta_bytes == 0 {
                delta.pending_bytes > 0
            } else {
                delta.pending_bytes >= thresholds.delta_bytes
            };
            let messages_hit = thresholds.delta_messages > 0
                && delta.pending_messages >= thresholds.delta_messages;

            if bytes_hit || messages_hit {
                delta.pending_bytes = delta.pending_bytes.saturating_sub(thresholds.delta_bytes);
                delta.pending_messages = delta
                    .pending_messages
                    .saturating_sub(thresholds.delta_messages);
                self.sessions_dirty_files
                    .lock()
                    .expect("dirty files lock")
                    .insert(path.clone());
                self.sessions_dirty.store(true, Ordering::SeqCst);
                any_triggered = true;
            }

            self.deltas.lock().expect("deltas lock").insert(path, delta);
        }

        if any_triggered {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this
                    .sync(SyncOptions::with_reason(SyncReason::SessionDelta))
                    .await
                {
                    warn!(error = %e, "session-delta sync failed");
                }
            });
        }
    }

    /// Schedule an eager sync the first time a session key is seen.
    pub fn warm_session(self: &Arc<Self>, session_key: &str) {
        if !self.settings.sync.on_session_start || self.is_closed() {
            return;
        }
        let fresh = self
            .warm_sessions
            .lock()
            .expect("warm sessions lock")
            .insert(session_key.to_string());
        if !fresh {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this
                .sync(SyncOptions::with_reason(SyncReason::SessionStart))
                .await
            {
                warn!(error = %e, "session-start sync failed");
            }
        });
    }

    pub fn memory_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn sessions_dirty(&self) -> bool {
        self.sessions_dirty.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.memory_dirty() || self.sessions_dirty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current delta state for a transcript (status surfaces, tests).
    pub fn session_delta(&self, path: &Path) -> Option<SessionDelta> {
        self.deltas.lock().expect("deltas lock").get(path).copied()
    }

    /// Run a sync, deduplicating concurrent callers onto one in-flight
    /// pass.
    pub async fn sync(self: &Arc<Self>, options: SyncOptions) -> Result<SyncReport> {
        if self.is_closed() {
            anyhow::bail!("syncer is closed");
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.clone() {
                existing
            } else {
                let this = self.clone();
                let future: SharedSync = async move {
                    let result = this.run_sync(options).await.map_err(Arc::new);
                    *this.in_flight.lock().await = None;
                    result
                }
                .boxed()
                .shared();
                *in_flight = Some(future.clone());
                future
            }
        };

        shared.await.map_err(|e| anyhow::anyhow!("{e:#}"))
    }

    /// Decide incremental vs. full, run the passes, and on an
    /// embedding-shaped failure activate provider fallback and restart
    /// once as a forced full reindex.
    async fn run_sync(self: &Arc<Self>, options: SyncOptions) -> Result<SyncReport> {
        let mut force = options.force;
        let mut attempted_fallback = false;

        loop {
            let manager = self
                .manager
                .upgrade()
                .context("index manager dropped")?;

            let result = self.run_once(&manager, &options, force).await;
            match result {
                Ok(report) => return Ok(report),
                Err(e) => {
                    let message = format!("{e:#}");
                    if !attempted_fallback && embedding_related(&message) {
                        match manager.embedder().activate_fallback(&message) {
                            Ok(true) => {
                                attempted_fallback = true;
                                force = true;
                                info!("provider fallback activated, restarting sync as full reindex");
                                continue;
                            }
                            Ok(false) => {}
                            Err(fallback_err) => {
                                warn!(error = %fallback_err, "fallback activation failed");
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn run_once(
        self: &Arc<Self>,
        manager: &Arc<MemoryIndexManager>,
        options: &SyncOptions,
        force: bool,
    ) -> Result<SyncReport> {
        let meta = manager.read_meta().await?;
        let current = manager.current_meta();

        let needs_full = force
            || match &meta {
                None => true,
                Some(meta) => {
                    meta.model != current.model
                        || meta.provider != current.provider
                        || meta.provider_key != current.provider_key
                        || meta.chunk_tokens != current.chunk_tokens
                        || meta.chunk_overlap != current.chunk_overlap
                        || meta.vector_dims.is_none()
                }
            };

        if needs_full {
            manager
                .reindex(|| self.run_passes(manager, options, true, force))
                .await
        } else {
            self.run_passes(manager, options, false, force).await
        }
    }

    /// The actual per-source indexing work, against whatever store the
    /// manager currently points at.
    async fn run_passes(
        &self,
        manager: &Arc<MemoryIndexManager>,
        options: &SyncOptions,
        full: bool,
        force: bool,
    ) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let reason = options.reason();
        let store = manager.db_handle().await;

        let should_memory = self.settings.source_enabled(Source::Memory)
            && (force || full || self.memory_dirty());

        let dirty_files: HashSet<PathBuf> = self
            .sessions_dirty_files
            .lock()
            .expect("dirty files lock")
            .clone();
        let sessions_blocked =
            matches!(reason, SyncReason::SessionStart | SyncReason::Watch);
        let should_sessions = self.settings.source_enabled(Source::Sessions)
            && !sessions_blocked
            && (force
                || full
                || (self.sessions_dirty.load(Ordering::SeqCst) && !dirty_files.is_empty()));

        let memory_entries = if should_memory {
            self.list_memory_files()
        } else {
            Vec::new()
        };
        let all_sessions = if should_sessions {
            self.list_session_files()
        } else {
            Vec::new()
        };
        let session_targets: Vec<PathBuf> = if should_sessions && !full && !dirty_files.is_empty()
        {
            all_sessions
                .iter()
                .filter(|p| dirty_files.contains(*p))
                .cloned()
                .collect()
        } else {
            all_sessions.clone()
        };

        let total = memory_entries.len() + session_targets.len();
        let completed = AtomicUsize::new(0);
        let completed = &completed;
        let report_progress = move |label: &str| {
            if let Some(progress) = &options.progress {
                progress(SyncProgress {
                    completed: completed.load(Ordering::SeqCst),
                    total,
                    label: label.to_string(),
                });
            }
        };
        let report_progress = &report_progress;

        let mut report = SyncReport {
            reason: reason.as_str(),
            full,
            files_scanned: total,
            ..SyncReport::default()
        };

        let width = manager.embedder().index_concurrency().max(1);

        if should_memory {
            let outcomes: Vec<Result<FileOutcome>> =
                futures::stream::iter(memory_entries.iter().cloned().map(|(rel, abs)| {
                    let store = store.clone();
                    async move {
                        let outcome = self
                            .index_memory_file(manager, &store, &rel, &abs, full)
                            .await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        report_progress(&rel);
                        outcome
                    }
                }))
                .buffer_unordered(width)
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    Ok(FileOutcome::Indexed(chunks)) => {
                        report.files_indexed += 1;
                        report.chunks_indexed += chunks;
                    }
                    Ok(FileOutcome::Skipped) => {}
                    Err(e) => {
                        let message = format!("{e:#}");
                        if embedding_related(&message) {
                            return Err(e);
                        }
                        warn!(error = %message, "memory file indexing failed");
                    }
                }
            }

            let active: HashSet<String> =
                memory_entries.iter().map(|(rel, _)| rel.clone()).collect();
            report.files_removed += prune_stale_files(manager, &store, Source::Memory, &active)
                .await
                .context("failed to prune stale memory rows")?;

            self.dirty.store(false, Ordering::SeqCst);
        }

        if should_sessions {
            let outcomes: Vec<Result<FileOutcome>> =
                futures::stream::iter(session_targets.iter().cloned().map(|path| {
                    let store = store.clone();
                    async move {
                        let outcome = self
                            .index_session_file(manager, &store, &path, full)
                            .await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        report_progress(&path.to_string_lossy());
                        outcome
                    }
                }))
                .buffer_unordered(width)
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    Ok(FileOutcome::Indexed(chunks)) => {
                        report.files_indexed += 1;
                        report.chunks_indexed += chunks;
                    }
                    Ok(FileOutcome::Skipped) => {}
                    Err(e) => {
                        let message = format!("{e:#}");
                        if embedding_related(&message) {
                            return Err(e);
                        }
                        warn!(error = %message, "session file indexing failed");
                    }
                }
            }

            {
                let mut dirty = self.sessions_dirty_files.lock().expect("dirty files lock");
                for path in &session_targets {
                    dirty.remove(path);
                }
                if dirty.is_empty() {
                    self.sessions_dirty.store(false, Ordering::SeqCst);
                }
            }

            let active: HashSet<String> = all_sessions
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            report.files_removed += prune_stale_files(manager, &store, Source::Sessions, &active)
                .await
                .context("failed to prune stale session rows")?;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report_progress("done");
        debug!(
            reason = report.reason,
            full = report.full,
            indexed = report.files_indexed,
            removed = report.files_removed,
            chunks = report.chunks_indexed,
            ms = report.duration_ms,
            "sync pass finished"
        );
        Ok(report)
    }

    async fn index_memory_file(
        &self,
        manager: &Arc<MemoryIndexManager>,
        store: &Store,
        rel_path: &str,
        abs_path: &Path,
        full: bool,
    ) -> Result<FileOutcome> {
        let content = tokio::fs::read_to_string(abs_path)
            .await
            .with_context(|| format!("failed to read {}", abs_path.display()))?;
        let hash = hash_text(&content);
        let metadata = tokio::fs::metadata(abs_path).await?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        if !full && stored_hash(store, rel_path, Source::Memory).await? == Some(hash.clone()) {
            return Ok(FileOutcome::Skipped);
        }

        let chunks = index_file(
            manager,
            store,
            Source::Memory,
            rel_path,
            &content,
            None,
            &hash,
            metadata.len(),
            mtime_ms,
        )
        .await?;
        Ok(FileOutcome::Indexed(chunks))
    }

    async fn index_session_file(
        &self,
        manager: &Arc<MemoryIndexManager>,
        store: &Store,
        path: &Path,
        full: bool,
    ) -> Result<FileOutcome> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let hash = hash_text(&raw);
        let size = raw.len() as u64;
        let metadata = tokio::fs::metadata(path).await?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let key = path.to_string_lossy().to_string();

        let outcome = if !full && stored_hash(store, &key, Source::Sessions).await? == Some(hash.clone())
        {
            FileOutcome::Skipped
        } else {
            let rendered = render_transcript(&raw);
            let chunks = index_file(
                manager,
                store,
                Source::Sessions,
                &key,
                &rendered.text,
                Some(&rendered.line_map),
                &hash,
                size,
                mtime_ms,
            )
            .await?;
            FileOutcome::Indexed(chunks)
        };

        // Indexing (or confirming up-to-date content) resets the delta.
        self.deltas.lock().expect("deltas lock").insert(
            path.to_path_buf(),
            SessionDelta {
                last_size: size,
                pending_bytes: 0,
                pending_messages: 0,
            },
        );
        Ok(outcome)
    }

    /// Memory roots: `MEMORY.md`, `memory.md`, the `memory/` tree, and
    /// extra paths. Symlinks are skipped. Paths inside the workspace are
    /// stored relative to it.
    fn list_memory_files(&self) -> Vec<(String, PathBuf)> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<(String, PathBuf)> = Vec::new();

        let mut push = |abs: PathBuf, out: &mut Vec<(String, PathBuf)>| {
            if abs.is_symlink() || !abs.is_file() {
                return;
            }
            let rel = abs
                .strip_prefix(&self.workspace_dir)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| abs.to_string_lossy().to_string());
            if seen.insert(rel.clone()) {
                out.push((rel, abs));
            }
        };

        for name in ["MEMORY.md", "memory.md"] {
            push(self.workspace_dir.join(name), &mut out);
        }
        collect_markdown(&self.workspace_dir.join("memory"), &mut |abs| {
            push(abs, &mut out)
        });
        for extra in &self.settings.extra_paths {
            let extra = expand_user_path(extra);
            if extra.is_dir() {
                collect_markdown(&extra, &mut |abs| push(abs, &mut out));
            } else {
                push(extra, &mut out);
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn list_session_files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.transcripts_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_symlink() || !path.is_file() {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    out.push(path);
                }
            }
        }
        out.sort();
        out
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![
            self.workspace_dir.join("MEMORY.md"),
            self.workspace_dir.join("memory.md"),
            self.workspace_dir.join("memory"),
        ];
        for extra in &self.settings.extra_paths {
            let extra = expand_user_path(extra);
            if !extra.is_symlink() {
                paths.push(extra);
            }
        }
        paths
    }

    /// Stop timers, listeners, and the watcher. Scheduled callbacks that
    /// already fired observe `closed` and return.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.watch_debounce.lock().expect("watch debounce lock").take() {
            handle.abort();
        }
        if let Some(handle) = self
            .session_debounce
            .lock()
            .expect("session debounce lock")
            .take()
        {
            handle.abort();
        }
        for handle in self.tasks.lock().expect("tasks lock").drain(..) {
            handle.abort();
        }
        *self.watcher.lock().expect("watcher lock") = None;
    }
}

enum FileOutcome {
    Indexed(usize),
    Skipped,
}

fn collect_markdown(dir: &Path, push: &mut dyn FnMut(PathBuf)) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_symlink() {
            continue;
        }
        if path.is_dir() {
            collect_markdown(&path, push);
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            push(path);
        }
    }
}

async fn stored_hash(store: &Store, path: &str, source: Source) -> Result<Option<String>> {
    let hash: Option<String> =
        sqlx::query_scalar("SELECT hash FROM files WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source.as_str())
            .fetch_optional(store.pool())
            .await?;
    Ok(hash)
}

/// Chunk, embed, and store one file: existing rows for `(path, source)`
/// are replaced in a single transaction, then the file row is upserted.
#[allow(clippy::too_many_arguments)]
async fn index_file(
    manager: &Arc<MemoryIndexManager>,
    store: &Store,
    source: Source,
    path: &str,
    content: &str,
    line_map: Option<&[usize]>,
    file_hash: &str,
    size: u64,
    mtime_ms: i64,
) -> Result<usize> {
    let embedder = manager.embedder();
    let model = embedder.model();

    let mut chunks = chunk_markdown(
        content,
        &manager.settings().chunking,
        embedder.max_input_tokens(),
    );
    if let Some(line_map) = line_map {
        map_lines(&mut chunks, line_map);
    }

    let vectors = embedder
        .embed_chunks(
            store.pool(),
            &chunks,
            Some(FileRef {
                path,
                hash: file_hash,
            }),
            Some(source),
        )
        .await?;

    let dims = vectors.iter().find(|v| !v.is_empty()).map(|v| v.len());
    let vector_ok = match dims {
        Some(dims) => manager.ensure_vector_ready(dims).await,
        None => false,
    };
    let has_vector_table = vector_ok || store.has_vector_table().await.unwrap_or(false);
    let fts_ok = manager.fts_available();
    let now = chrono::Utc::now().timestamp();

    let mut tx = store.pool().begin().await?;

    if has_vector_table {
        sqlx::query(
            "DELETE FROM chunks_vec WHERE id IN \
             (SELECT id FROM chunks WHERE path = ? AND source = ?)",
        )
        .bind(path)
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;
    }
    if fts_ok {
        sqlx::query(
            "DELETE FROM chunks_fts WHERE id IN \
             (SELECT id FROM chunks WHERE path = ? AND source = ?)",
        )
        .bind(path)
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("DELETE FROM chunks WHERE path = ? AND source = ?")
        .bind(path)
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
        let id = chunk_id(
            source.as_str(),
            path,
            chunk.start_line,
            chunk.end_line,
            &chunk.hash,
            &model,
        );
        sqlx::query(
            r#"
            INSERT INTO chunks
                (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(path)
        .bind(source.as_str())
        .bind(chunk.start_line as i64)
        .bind(chunk.end_line as i64)
        .bind(&chunk.hash)
        .bind(&model)
        .bind(&chunk.text)
        .bind(serde_json::to_string(vector)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if vector_ok && !vector.is_empty() {
            sqlx::query(
                "INSERT INTO chunks_vec (id, embedding) VALUES (?, ?) \
                 ON CONFLICT(id) DO UPDATE SET embedding = excluded.embedding",
            )
            .bind(&id)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        if fts_ok {
            sqlx::query(
                "INSERT INTO chunks_fts \
                 (text, id, path, source, model, start_line, end_line) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.text)
            .bind(&id)
            .bind(path)
            .bind(source.as_str())
            .bind(&model)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO files (path, source, hash, mtime, size)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(path, source) DO UPDATE SET
            hash = excluded.hash,
            mtime = excluded.mtime,
            size = excluded.size
        "#,
    )
    .bind(path)
    .bind(source.as_str())
    .bind(file_hash)
    .bind(mtime_ms)
    .bind(size as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(chunks.len())
}

/// Remove every row belonging to `(source, path)` for paths no longer in
/// the active set.
async fn prune_stale_files(
    manager: &Arc<MemoryIndexManager>,
    store: &Store,
    source: Source,
    active: &HashSet<String>,
) -> Result<usize> {
    let known: Vec<String> = sqlx::query_scalar("SELECT path FROM files WHERE source = ?")
        .bind(source.as_str())
        .fetch_all(store.pool())
        .await?;

    let has_vector_table = store.has_vector_table().await.unwrap_or(false);
    let mut removed = 0usize;
    for path in known {
        if active.contains(&path) {
            continue;
        }
        let mut tx = store.pool().begin().await?;
        if has_vector_table {
            sqlx::query(
                "DELETE FROM chunks_vec WHERE id IN \
                 (SELECT id FROM chunks WHERE path = ? AND source = ?)",
            )
            .bind(&path)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        }
        if manager.fts_available() {
            sqlx::query(
                "DELETE FROM chunks_fts WHERE id IN \
                 (SELECT id FROM chunks WHERE path = ? AND source = ?)",
            )
            .bind(&path)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ? AND source = ?")
            .bind(&path)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE path = ? AND source = ?")
            .bind(&path)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(path = %path, source = source.as_str(), "pruned deleted file");
        removed += 1;
    }
    Ok(removed)
}

/// Count 0x0A bytes in `[start, end)` of a file, reading 64 KiB slabs.
async fn count_newlines_in_range(path: &Path, start: u64, end: u64) -> Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;

    let mut remaining = end.saturating_sub(start);
    let mut buffer = vec![0u8; NEWLINE_SLAB];
    let mut count = 0u64;

    while remaining > 0 {
        let want = remaining.min(NEWLINE_SLAB as u64) as usize;
        let read = file.read(&mut buffer[..want]).await?;
        if read == 0 {
            break;
        }
        count += buffer[..read].iter().filter(|&&b| b == b'\n').count() as u64;
        remaining -= read as u64;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeltaThresholds;
    use tempfile::TempDir;

    /// Settings rooted in a temp dir: local provider, watcher off,
    /// transcripts redirected, memory-only unless asked otherwise.
    fn test_settings(tmp: &TempDir, sources: Vec<Source>) -> Settings {
        let mut settings = Settings::default();
        settings.store.path = tmp.path().join("state").join("index.db");
        settings.sources = sources;
        settings.sync.watch = false;
        settings.sync.on_session_start = false;
        settings.sync.on_search = false;
        settings.transcripts_dir = Some(tmp.path().join("sessions"));
        settings
    }

    async fn open_manager(
        tmp: &TempDir,
        sources: Vec<Source>,
    ) -> Arc<MemoryIndexManager> {
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir_all(workspace.join("memory")).unwrap();
        MemoryIndexManager::open(
            "test-agent",
            &workspace,
            test_settings(tmp, sources),
        )
        .await
        .unwrap()
    }

    async fn chunk_count(manager: &MemoryIndexManager) -> i64 {
        let store = manager.db_handle().await;
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn incremental_memory_update() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(&tmp, vec![Source::Memory]).await;
        let file = manager.workspace_dir().join("memory").join("a.md");
        std::fs::write(&file, "alpha\n").unwrap();

        let report = manager.sync(SyncOptions::forced()).await.unwrap();
        assert!(report.full);
        assert_eq!(report.files_indexed, 1);

        let store = manager.db_handle().await;
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(files, 1);
        assert_eq!(chunk_count(&manager).await, 1);
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_vec")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(vectors, 1);
        let hash_before: String =
            sqlx::query_scalar("SELECT hash FROM files WHERE source = 'memory'")
                .fetch_one(store.pool())
                .await
                .unwrap();

        // Unchanged content: incremental sync skips the file entirely.
        manager.syncer().dirty.store(true, Ordering::SeqCst);
        let unchanged = manager.sync(SyncOptions::default()).await.unwrap();
        assert!(!unchanged.full);
        assert_eq!(unchanged.files_indexed, 0);

        // Changed content: the hash flips and the chunks are rebuilt.
        std::fs::write(&file, "alpha beta\n").unwrap();
        manager.syncer().dirty.store(true, Ordering::SeqCst);
        let changed = manager.sync(SyncOptions::default()).await.unwrap();
        assert!(!changed.full);
        assert_eq!(changed.files_indexed, 1);

        let store = manager.db_handle().await;
        let hash_after: String =
            sqlx::query_scalar("SELECT hash FROM files WHERE source = 'memory'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_ne!(hash_before, hash_after);
        assert_eq!(chunk_count(&manager).await, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn deleted_file_rows_are_pruned() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(&tmp, vec![Source::Memory]).await;
        let memory = manager.workspace_dir().join("memory");
        std::fs::write(memory.join("keep.md"), "keep me\n").unwrap();
        std::fs::write(memory.join("drop.md"), "drop me\n").unwrap();

        manager.sync(SyncOptions::forced()).await.unwrap();
        assert_eq!(chunk_count(&manager).await, 2);

        std::fs::remove_file(memory.join("drop.md")).unwrap();
        manager.syncer().dirty.store(true, Ordering::SeqCst);
        let report = manager.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(report.files_removed, 1);

        let store = manager.db_handle().await;
        for table in ["files", "chunks"] {
            let stale: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE path LIKE '%drop.md%'"
            ))
            .fetch_one(store.pool())
            .await
            .unwrap();
            assert_eq!(stale, 0, "{table} should have no rows for the deleted file");
        }
        let stale_vec: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks_vec WHERE id NOT IN (SELECT id FROM chunks)",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(stale_vec, 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn reindex_with_unchanged_config_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(&tmp, vec![Source::Memory]).await;
        std::fs::write(
            manager.workspace_dir().join("memory").join("a.md"),
            "stable content across rebuilds\n",
        )
        .unwrap();

        manager.sync(SyncOptions::forced()).await.unwrap();
        let store = manager.db_handle().await;
        let ids_before: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks ORDER BY id")
            .fetch_all(store.pool())
            .await
            .unwrap();

        manager.sync(SyncOptions::forced()).await.unwrap();
        let store = manager.db_handle().await;
        let ids_after: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks ORDER BY id")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(ids_before, ids_after);
        manager.close().await;
    }

    #[tokio::test]
    async fn session_delta_thresholds() {
        let tmp = TempDir::new().unwrap();
        let mut settings = test_settings(&tmp, vec![Source::Sessions]);
        settings.sync.thresholds = DeltaThresholds {
            delta_bytes: 1024,
            delta_messages: 5,
        };
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let manager = MemoryIndexManager::open("delta-agent", &workspace, settings)
            .await
            .unwrap();
        let syncer = manager.syncer().clone();

        let sessions_dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&sessions_dir).unwrap();
        let transcript = sessions_dir.join("s1.jsonl");

        // 512 bytes, 4 lines: under both thresholds.
        let line = format!("{}\n", "a".repeat(127));
        std::fs::write(&transcript, line.repeat(4)).unwrap();
        syncer
            .pending_sessions
            .lock()
            .unwrap()
            .insert(transcript.clone());
        syncer.process_pending_sessions().await;

        let delta = syncer.session_delta(&transcript).unwrap();
        assert_eq!(delta.pending_bytes, 512);
        assert_eq!(delta.pending_messages, 4);
        assert!(syncer
            .sessions_dirty_files
            .lock()
            .unwrap()
            .is_empty());

        // 600 more bytes: 1112 total crosses the byte threshold.
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript)
            .unwrap();
        f.write_all("b".repeat(600).as_bytes()).unwrap();
        drop(f);

        syncer
            .pending_sessions
            .lock()
            .unwrap()
            .insert(transcript.clone());
        syncer.process_pending_sessions().await;

        assert!(syncer
            .sessions_dirty_files
            .lock()
            .unwrap()
            .contains(&transcript));
        let delta = syncer.session_delta(&transcript).unwrap();
        assert_eq!(delta.last_size, 1112);
        // Decremented by the triggering threshold, floored at zero.
        assert_eq!(delta.pending_bytes, 1112 - 1024);
        manager.close().await;
    }

    #[tokio::test]
    async fn zero_byte_threshold_triggers_on_any_pending() {
        let tmp = TempDir::new().unwrap();
        let mut settings = test_settings(&tmp, vec![Source::Sessions]);
        settings.sync.thresholds = DeltaThresholds {
            delta_bytes: 0,
            delta_messages: 0,
        };
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let manager = MemoryIndexManager::open("zero-agent", &workspace, settings)
            .await
            .unwrap();
        let syncer = manager.syncer().clone();

        let sessions_dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&sessions_dir).unwrap();
        let transcript = sessions_dir.join("s1.jsonl");
        std::fs::write(&transcript, "x\n").unwrap();

        syncer
            .pending_sessions
            .lock()
            .unwrap()
            .insert(transcript.clone());
        syncer.process_pending_sessions().await;
        assert!(syncer
            .sessions_dirty_files
            .lock()
            .unwrap()
            .contains(&transcript));
        manager.close().await;
    }

    #[tokio::test]
    async fn session_pass_indexes_rendered_transcripts() {
        let tmp = TempDir::new().unwrap();
        let sessions_dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&sessions_dir).unwrap();
        std::fs::write(
            sessions_dir.join("chat.jsonl"),
            concat!(
                r#"{"role":"user","content":"tell me about rust lifetimes"}"#,
                "\n",
                r#"{"role":"assistant","content":"lifetimes describe borrow scopes"}"#,
                "\n",
            ),
        )
        .unwrap();

        let manager = open_manager(&tmp, vec![Source::Sessions]).await;
        let report = manager.sync(SyncOptions::forced()).await.unwrap();
        assert_eq!(report.files_indexed, 1);

        let store = manager.db_handle().await;
        let (start, end): (i64, i64) = sqlx::query_as(
            "SELECT start_line, end_line FROM chunks WHERE source = 'sessions' LIMIT 1",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        // Line provenance points at transcript lines, via the line map.
        assert_eq!(start, 1);
        assert_eq!(end, 2);

        // The delta state was reset by indexing.
        let delta = manager
            .syncer()
            .session_delta(&sessions_dir.join("chat.jsonl"))
            .unwrap();
        assert_eq!(delta.pending_bytes, 0);
        assert!(delta.last_size > 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn concurrent_syncs_share_one_pass() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(&tmp, vec![Source::Memory]).await;
        std::fs::write(
            manager.workspace_dir().join("memory").join("a.md"),
            "concurrent sync content\n",
        )
        .unwrap();

        let (a, b) = tokio::join!(
            manager.sync(SyncOptions::forced()),
            manager.sync(SyncOptions::forced())
        );
        let a = a.unwrap();
        let b = b.unwrap();
        // Both callers observed the same in-flight pass.
        assert_eq!(a, b);
        manager.close().await;
    }

    #[tokio::test]
    async fn newline_counting_is_range_scoped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.jsonl");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();

        assert_eq!(count_newlines_in_range(&path, 0, 14).await.unwrap(), 3);
        // Only the range after "one\n".
        assert_eq!(count_newlines_in_range(&path, 4, 14).await.unwrap(), 2);
        assert_eq!(count_newlines_in_range(&path, 0, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn newline_counting_spans_slabs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big.jsonl");
        let line = format!("{}\n", "x".repeat(1000));
        let content = line.repeat(200); // ~200 KB, crosses slab boundaries
        std::fs::write(&path, &content).unwrap();

        let total = count_newlines_in_range(&path, 0, content.len() as u64)
            .await
            .unwrap();
        assert_eq!(total, 200);
    }
}
