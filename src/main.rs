//! # kbase CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema setup |
//! | `kb add <id>...` | Ingest files, directories, or URLs |
//! | `kb remove <id>` | Remove a source's rows and record |
//! | `kb reindex <id>` | Re-load and re-embed one source |
//! | `kb rebuild [--full]` | Recompute the vector table from the catalog |
//! | `kb search "<query>"` | Semantic search |
//! | `kb sources` | List cataloged sources |
//! | `kb collections ...` | Manage collections |
//! | `kb unlock` | Force-release a running server's operation lock |
//! | `kb serve` | Start the HTTP server |
//!
//! Logs and progress go to stderr; results go to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use kbase::config::{self, Config};
use kbase::core::catalog::CollectionPatch;
use kbase::core::models::SearchHit;
use kbase::progress::{self, ProgressMode, ProgressSender};
use kbase::{KnowledgeBase, RebuildMode, SearchOptions};

#[derive(Parser)]
#[command(
    name = "kb",
    about = "kbase — a local-first knowledge-base retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Progress output on stderr. `auto` shows human progress on a TTY.
    #[arg(long, global = true, value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest sources: files, directories (expanded with the loader globs), or URLs.
    Add {
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// Remove a source's vectors and catalog record.
    Remove { source: String },

    /// Re-load and re-embed one cataloged source.
    Reindex { source: String },

    /// Recompute the vector table from the catalog.
    ///
    /// Incremental by default: unchanged sources are kept. `--full` drops
    /// the table first (required after changing the embedding model).
    Rebuild {
        #[arg(long)]
        full: bool,
        #[arg(long)]
        json: bool,
    },

    /// Semantic search.
    Search {
        query: String,
        /// Number of results.
        #[arg(short, long)]
        k: Option<usize>,
        /// Restrict to these sources (repeatable).
        #[arg(long)]
        source: Vec<String>,
        /// Restrict to a collection's members.
        #[arg(long, conflicts_with = "source")]
        collection: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// List cataloged sources.
    Sources {
        #[arg(long)]
        json: bool,
    },

    /// Manage collections.
    Collections {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Force-release an operation lock held by a running server.
    Unlock {
        #[arg(long, default_value = "global")]
        lock_id: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum CollectionAction {
    List {
        #[arg(long)]
        json: bool,
    },
    Create {
        name: String,
        /// Member sources (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,
    },
    Rename { id: String, name: String },
    SetFiles { id: String, files: Vec<String> },
    /// Delete a collection and the sources no other collection contains.
    Delete { id: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kbase=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run `f` with a progress sink drained to stderr.
async fn with_progress<T, F, Fut>(mode: ProgressMode, f: F) -> Result<T>
where
    F: FnOnce(ProgressSender) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let (tx, rx) = progress::channel();
    let drain = rx.spawn_drain(mode.reporter());
    let result = f(tx).await;
    let _ = drain.await;
    result
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        let page = hit.page.map(|p| format!(" p.{}", p)).unwrap_or_default();
        println!("{}. [{:.3}] {}{}", i + 1, hit.score, hit.file_name, page);
        println!("    source: {}", hit.source);
        let excerpt: String = hit.content.split_whitespace().collect::<Vec<_>>().join(" ");
        let excerpt: String = excerpt.chars().take(240).collect();
        println!("    {}", excerpt);
        println!();
    }
}

async fn unlock(cfg: &Config, lock_id: &str) -> Result<()> {
    let url = format!("http://{}/lock/release", cfg.server.bind);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "lock_id": lock_id }))
        .send()
        .await
        .with_context(|| {
            format!(
                "no server reachable at {}; locks are held in-process and end with it",
                cfg.server.bind
            )
        })?;
    let body: serde_json::Value = response.json().await?;
    if body["released"].as_bool().unwrap_or(false) {
        println!("Released lock '{}'.", lock_id);
    } else {
        println!("Lock '{}' was not held.", lock_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mode = match cli.progress {
        ProgressArg::Auto => ProgressMode::default_for_tty(),
        ProgressArg::Off => ProgressMode::Off,
        ProgressArg::Human => ProgressMode::Human,
        ProgressArg::Json => ProgressMode::Json,
    };
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = kbase::db::connect(&cfg).await?;
            kbase::migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Unlock { lock_id } => unlock(&cfg, &lock_id).await?,
        Commands::Serve => {
            let kb = Arc::new(KnowledgeBase::open(cfg).await?);
            kbase::server::run_server(kb).await?;
        }
        command => {
            let kb = KnowledgeBase::open(cfg).await?;
            run(&kb, command, mode).await?;
        }
    }

    Ok(())
}

async fn run(kb: &KnowledgeBase, command: Commands, mode: ProgressMode) -> Result<()> {
    match command {
        Commands::Add { sources, json } => {
            let report = with_progress(mode, |tx| async move {
                kb.ingest_sources(&sources, &tx).await
            })
            .await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Indexed {} chunks.", report.count);
                for e in &report.errors {
                    println!("  failed: {} ({}): {}", e.source, e.kind.as_str(), e.message);
                }
            }
            report.into_result()?;
        }
        Commands::Remove { source } => {
            kb.remove_source(&source).await?;
            println!("Removed {}.", source);
        }
        Commands::Reindex { source } => {
            with_progress(mode, |tx| async move { kb.reindex_source(&source, &tx).await })
                .await?;
            println!("Reindexed.");
        }
        Commands::Rebuild { full, json } => {
            let rebuild_mode = if full {
                RebuildMode::Full
            } else {
                RebuildMode::Incremental
            };
            let report =
                with_progress(mode, |tx| async move { kb.rebuild(rebuild_mode, &tx).await })
                    .await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Rebuild complete: {} updated, {} kept, {} dropped, {} failed.",
                    report.updated.len(),
                    report.kept.len(),
                    report.dropped.len(),
                    report.failed.len()
                );
                for e in &report.failed {
                    println!("  failed: {} ({}): {}", e.source, e.kind.as_str(), e.message);
                }
            }
        }
        Commands::Search {
            query,
            k,
            source,
            collection,
            json,
        } => {
            let hits = match collection {
                Some(id) => kb.search_collection(&query, &id, k).await?,
                None => {
                    let sources = (!source.is_empty()).then_some(source);
                    kb.search(&query, SearchOptions { k, sources }).await?
                }
            };
            if json {
                print_json(&serde_json::json!({ "results": hits }))?;
            } else {
                print_hits(&hits);
            }
        }
        Commands::Sources { json } => {
            let doc = kb.snapshot().await?;
            if json {
                print_json(&doc.files)?;
            } else if doc.files.is_empty() {
                println!("No sources.");
            } else {
                println!("{:<6} {:<8} {:<30} SOURCE", "CHUNKS", "KIND", "NAME");
                for r in &doc.files {
                    let kind = match r.kind {
                        kbase::core::models::SourceKind::File => "file",
                        kbase::core::models::SourceKind::Url => "url",
                    };
                    println!("{:<6} {:<8} {:<30} {}", r.chunk_count, kind, r.name, r.id);
                }
            }
        }
        Commands::Collections { action } => match action {
            CollectionAction::List { json } => {
                let doc = kb.snapshot().await?;
                if json {
                    print_json(&doc.collections)?;
                } else if doc.collections.is_empty() {
                    println!("No collections.");
                } else {
                    for c in &doc.collections {
                        println!("{}  {} ({} files)", c.id, c.name, c.files.len());
                    }
                }
            }
            CollectionAction::Create { name, files } => {
                let doc = kb.create_collection(&name, &files).await?;
                if let Some(c) = doc.collections.last() {
                    println!("Created collection {} ({} files).", c.id, c.files.len());
                }
            }
            CollectionAction::Rename { id, name } => {
                kb.update_collection(
                    &id,
                    CollectionPatch {
                        name: Some(name),
                        files: None,
                    },
                )
                .await?;
                println!("Renamed {}.", id);
            }
            CollectionAction::SetFiles { id, files } => {
                kb.update_collection(
                    &id,
                    CollectionPatch {
                        name: None,
                        files: Some(files),
                    },
                )
                .await?;
                println!("Updated {}.", id);
            }
            CollectionAction::Delete { id } => {
                let target = id.clone();
                with_progress(mode, |tx| async move {
                    kb.delete_collection(&target, &tx).await
                })
                .await?;
                println!("Deleted {}.", id);
            }
        },
        Commands::Init | Commands::Unlock { .. } | Commands::Serve => {}
    }
    Ok(())
}
