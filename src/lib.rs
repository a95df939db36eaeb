//! # Memory Index
//!
//! **A per-agent, per-workspace semantic + lexical search engine over
//! markdown memory files and session transcripts.**
//!
//! The index ingests two content streams — long-lived memory files and
//! append-only session transcripts — splits them into overlapping
//! chunks, embeds them through a pluggable provider, and serves hybrid
//! queries that fuse cosine-similarity vector search with BM25 keyword
//! search, all backed by a single SQLite file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────────┐
//! │  Triggers    │──▶│   Syncer    │──▶│    SQLite      │
//! │ watch/delta/ │   │ chunk+embed │   │ FTS5 + vectors │
//! │ timer/demand │   └─────────────┘   └──────┬────────┘
//! └──────────────┘                            │
//!                          ┌──────────────────┤
//!                          ▼                  ▼
//!                    ┌──────────┐      ┌──────────┐
//!                    │  search  │      │   CLI    │
//!                    │ (hybrid) │      │ (memidx) │
//!                    └──────────┘      └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A trigger fires: the file watcher saw a memory edit, a session
//!    transcript grew past its delta threshold, the periodic timer
//!    ticked, or a caller asked directly.
//! 2. The **syncer** ([`syncer`]) enumerates the affected files, skips
//!    those whose content hash is unchanged, and replaces the rows of
//!    the rest.
//! 3. The **chunker** ([`chunker`]) splits each file into overlapping
//!    chunks with line-range provenance.
//! 4. The **embedding manager** ([`embedder`]) resolves vectors through
//!    its cache, batching, retry, and fallback layers.
//! 5. The **manager** ([`manager`]) serves hybrid queries and performs
//!    crash-safe full reindexes by swapping a freshly built store file
//!    into place.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML settings parsing, defaults, and validation |
//! | [`store`] | SQLite schema, WAL connection handling, vector BLOB codec |
//! | [`chunker`] | Deterministic overlapping Markdown chunker |
//! | [`session`] | Transcript rendering, event bus, agent directories |
//! | [`provider`] | `EmbeddingProvider` trait and OpenAI/Gemini/Voyage/local backends |
//! | [`embedder`] | Embedding cache, batching, retries, timeouts, fallback |
//! | [`watcher`] | Debounced filesystem watcher for memory roots |
//! | [`syncer`] | Sync scheduling, session deltas, per-file indexing |
//! | [`search`] | FTS5 keyword scan, vector scan, hybrid fusion |
//! | [`manager`] | Façade: search entry point, crash-safe reindex, manager cache |

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod manager;
pub mod provider;
pub mod search;
pub mod session;
pub mod store;
pub mod syncer;
pub mod watcher;

pub use config::{load_settings, Settings, Source};
pub use manager::{IndexStatus, MemoryIndexManager, SearchOptions};
pub use search::SearchResult;
pub use syncer::{SyncOptions, SyncReason, SyncReport};
