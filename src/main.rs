//! # Memory Index CLI (`memidx`)
//!
//! Command-line surface over the index manager. Every command accepts
//! `--config` (TOML settings), `--agent` (agent id), and `--workspace`
//! (workspace root; defaults to the current directory).
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memidx init` | Create the index database and schema |
//! | `memidx sync` | Run one sync pass (`--force` for a full rebuild) |
//! | `memidx search "<query>"` | Hybrid search with ranked results |
//! | `memidx status` | Counts, provider, feature availability |
//! | `memidx reindex` | Forced crash-safe full rebuild |
//! | `memidx watch` | Start all triggers and block until Ctrl-C |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use memory_index::manager::MemoryIndexManager;
use memory_index::syncer::{SyncOptions, SyncProgress};
use memory_index::{load_settings, SearchOptions};

#[derive(Parser)]
#[command(
    name = "memidx",
    about = "Per-agent memory index: hybrid search over markdown memory and session transcripts",
    version
)]
struct Cli {
    /// Path to the settings file (TOML).
    #[arg(long, global = true, default_value = "./memidx.toml")]
    config: PathBuf,

    /// Agent id this index belongs to.
    #[arg(long, global = true, default_value = "default")]
    agent: String,

    /// Workspace root holding MEMORY.md / memory/.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index database and schema. Idempotent.
    Init,

    /// Run one sync pass over the enabled sources.
    Sync {
        /// Rebuild everything via a crash-safe full reindex.
        #[arg(long)]
        force: bool,
    },

    /// Search the index.
    Search {
        /// The query string.
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 8)]
        max_results: usize,

        /// Drop results scoring below this threshold.
        #[arg(long, default_value_t = 0.0)]
        min_score: f64,
    },

    /// Show index counts, provider, and feature availability.
    Status,

    /// Forced full rebuild (equivalent to `sync --force`).
    Reindex,

    /// Start watchers and timers; sync continuously until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("memory_index=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli.config)?;
    let workspace = match cli.workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let manager = MemoryIndexManager::get(&cli.agent, &workspace, settings).await?;

    match cli.command {
        Commands::Init => {
            // Opening the manager created the schema.
            println!("index initialized at {}", manager.db_handle().await.path().display());
        }
        Commands::Sync { force } => {
            run_sync(&manager, force).await?;
        }
        Commands::Reindex => {
            run_sync(&manager, true).await?;
        }
        Commands::Search {
            query,
            max_results,
            min_score,
        } => {
            let results = manager
                .search(
                    &query,
                    &SearchOptions {
                        max_results: Some(max_results),
                        min_score: Some(min_score),
                        session_key: None,
                    },
                )
                .await;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {}:{}-{} ({})",
                    i + 1,
                    result.score,
                    result.path,
                    result.start_line,
                    result.end_line,
                    result.source
                );
                let excerpt: String = result.snippet.chars().take(160).collect();
                println!("    {}", excerpt.replace('\n', " "));
            }
        }
        Commands::Status => {
            let status = manager.status().await?;
            println!("files:     {}", status.files);
            println!("chunks:    {}", status.chunks);
            println!("provider:  {} ({})", status.provider, status.model);
            println!("fts:       {}", if status.fts_available { "available" } else { "unavailable" });
            println!(
                "vectors:   {}",
                if status.vector_available { "available" } else { "unavailable" }
            );
            println!("dirty:     memory={} sessions={}", status.dirty, status.sessions_dirty);
            if let Some(meta) = status.meta {
                println!(
                    "meta:      model={} provider={} dims={:?}",
                    meta.model, meta.provider, meta.vector_dims
                );
            }
        }
        Commands::Watch => {
            println!("watching; Ctrl-C to stop");
            run_sync(&manager, false).await.ok();
            tokio::signal::ctrl_c().await?;
        }
    }

    manager.close().await;
    Ok(())
}

async fn run_sync(manager: &Arc<MemoryIndexManager>, force: bool) -> Result<()> {
    let progress: memory_index::syncer::ProgressFn =
        Arc::new(|update: SyncProgress| {
            eprintln!("sync  {} / {}  {}", update.completed, update.total, update.label);
        });
    let report = manager
        .sync(SyncOptions {
            force,
            progress: Some(progress),
            ..SyncOptions::default()
        })
        .await?;
    println!("sync ({})", report.reason);
    println!("  full reindex: {}", report.full);
    println!("  files scanned: {}", report.files_scanned);
    println!("  files indexed: {}", report.files_indexed);
    println!("  files removed: {}", report.files_removed);
    println!("  chunks written: {}", report.chunks_indexed);
    println!("  took: {}ms", report.duration_ms);
    Ok(())
}
