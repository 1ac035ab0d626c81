//! # Corpus Harness CLI (`corpus`)
//!
//! ## Usage
//!
//! ```bash
//! corpus --config ./config/corpus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus init` | Create the SQLite database and run schema migrations |
//! | `corpus check` | Report drift between sources, derivatives and the corpus |
//! | `corpus repair <file>` | Refine and ingest one source file |
//! | `corpus ingest <id>` / `--all` | Chunk + embed refined documents |
//! | `corpus reprocess` | Refine + ingest every source file |
//! | `corpus prune` | Remove documents whose source file is gone |
//! | `corpus stats` | Document, chunk and embedding counts |
//!
//! Logs go to stderr (`RUST_LOG` or `--log-level`); results go to stdout,
//! as JSON with `--json`.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use corpus_harness::app::App;
use corpus_harness::config;
use corpus_harness::migrate;
use corpus_harness::progress::ProgressMode;
use corpus_harness::stats;
use corpus_harness_core::models::{BatchSummary, DocumentRef, IntegrityReport, ProcessingResult};

/// Corpus Harness: keeps a retrieval corpus consistent with its source
/// documents.
#[derive(Parser)]
#[command(
    name = "corpus",
    about = "Corpus Harness: drift detection, refinement and ingestion for a retrieval corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations. Idempotent.
    Init,

    /// Report which documents need refinement or ingestion, which are
    /// orphaned, and which are healthy.
    Check {
        #[arg(long)]
        json: bool,
        /// Ignore any cached report.
        #[arg(long)]
        fresh: bool,
    },

    /// Refine one source file and, on success, ingest it.
    Repair {
        /// Path relative to the source root.
        filename: String,
        #[arg(long)]
        json: bool,
    },

    /// Chunk and embed refined documents.
    Ingest {
        /// Document id to ingest.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        document_id: Option<String>,
        /// Ingest every document that is behind its derivative.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },

    /// Refine + ingest every source file. Ctrl-C stops starting new
    /// documents and lets in-flight ones finish.
    Reprocess {
        /// Documents processed at once (default: `[pipeline] concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,
        /// Progress on stderr. Default: human when stderr is a TTY, else off.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
        #[arg(long)]
        json: bool,
    },

    /// Tombstone documents whose source file is gone and delete their
    /// chunks and derivatives.
    Prune {
        #[arg(long)]
        json: bool,
    },

    /// Show corpus statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.refine.output_dir)?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Check { json, fresh } => {
            let app = App::open(&cfg).await?;
            let report = if fresh {
                app.orchestrator.check_integrity_fresh().await?
            } else {
                app.orchestrator.check_integrity().await?
            };
            if json {
                print_json(report.as_ref())?;
            } else {
                print_report(&report);
            }
            app.close().await;
        }
        Commands::Repair { filename, json } => {
            let app = App::open(&cfg).await?;
            let result = app.orchestrator.repair_file(&filename).await?;
            app.close().await;
            if json {
                print_json(&result)?;
            } else {
                print_result(&result);
            }
            if !result.is_success() {
                bail!("repair of '{}' failed", filename);
            }
        }
        Commands::Ingest {
            document_id,
            all,
            json,
        } => {
            let app = App::open(&cfg).await?;
            if all {
                let summary = app.orchestrator.ingest_all().await?;
                emit_summary(&summary, json)?;
            } else if let Some(id) = document_id {
                let result = app.orchestrator.ingest(&id).await?;
                if json {
                    print_json(&result)?;
                } else {
                    print_result(&result);
                }
            }
            app.close().await;
        }
        Commands::Reprocess {
            concurrency,
            progress,
            json,
        } => {
            let app = App::open(&cfg).await?;
            let cancel = CancellationToken::new();
            spawn_interrupt_watcher(cancel.clone());

            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            let orchestrator = match concurrency {
                Some(n) => app.orchestrator.with_concurrency(n),
                None => app.orchestrator,
            };
            let summary = orchestrator
                .reprocess_all(&cancel, reporter.as_ref())
                .await?;
            app.pool.close().await;
            emit_summary(&summary, json)?;
        }
        Commands::Prune { json } => {
            let app = App::open(&cfg).await?;
            let summary = app.orchestrator.prune_orphans().await?;
            app.close().await;
            emit_summary(&summary, json)?;
        }
        Commands::Stats { json } => {
            let app = App::open(&cfg).await?;
            let corpus = stats::collect_stats(app.manifest.as_ref(), app.store.as_ref()).await?;
            app.close().await;
            if json {
                print_json(&corpus)?;
            } else {
                stats::print_stats(&corpus, &cfg.db.path);
            }
        }
    }

    Ok(())
}

fn spawn_interrupt_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing in-flight documents");
            cancel.cancel();
        }
    });
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &IntegrityReport) {
    fn section(title: &str, docs: &[DocumentRef]) {
        println!("{} ({})", title, docs.len());
        for doc in docs {
            println!("  {}  {}", doc.id, doc.filename);
        }
    }

    println!("Integrity report ({})", report.generated_at.to_rfc3339());
    println!();
    section("Missing refinement", &report.missing_refinement);
    section("Missing ingestion", &report.missing_ingestion);
    section("Orphaned", &report.orphaned);
    section("Inconsistent", &report.inconsistent);
    println!("Healthy ({})", report.healthy.len());
    println!();
    if report.is_clean() {
        println!("Corpus is up to date.");
    }
}

fn print_result(result: &ProcessingResult) {
    match &result.error {
        None => println!("{}  {}  {}", result.status, result.document_id, result.filename),
        Some(err) => println!(
            "{}  {}  {}\n  {}: {}",
            result.status, result.document_id, result.filename, err.kind, err.message
        ),
    }
}

fn emit_summary(summary: &BatchSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    for result in summary.failures() {
        print_result(result);
    }
    print!("{} / {} succeeded", summary.success, summary.total);
    if summary.cancelled {
        print!(" (cancelled, {} not started)", summary.skipped);
    }
    println!();
    Ok(())
}
