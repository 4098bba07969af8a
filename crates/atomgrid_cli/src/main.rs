//! Command-line front end over a SQLite-backed engine.
//!
//! # Responsibility
//! - Parse arguments and map subcommands onto `atomgrid_core::Engine`.
//! - Print line-oriented `key=value` output.
//!
//! Embeddings come from the deterministic feature-hashing embedder so that
//! ingest and search agree without an external model.

use atomgrid_core::repo::AtomStore;
use atomgrid_core::{
    core_version, default_log_level, init_logging, CancellationToken, ContentHash, Engine,
    EngineConfig, FeatureHashEmbedder, SourceMetadata, TenantId,
};
use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "atomgrid")]
#[command(version)]
#[command(about = "Content atomization and spatial semantic search")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, default_value = "atomgrid.db")]
    db: PathBuf,

    /// Engine configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Absolute directory for rolling log files; logging is off when omitted
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files, then embed and index new atoms
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "default")]
        tenant: String,
        /// Sample size for the first basis bootstrap
        #[arg(long, default_value_t = 256)]
        sample: usize,
    },
    /// Search atoms semantically similar to a text
    Search {
        text: String,
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Show one atom by content hash
    Get {
        hash: String,
        #[arg(long, default_value = "default")]
        tenant: String,
    },
    /// Retry parked embeddings and embed every atom still waiting
    Drain,
    /// Build the next landmark basis from stored embeddings
    Bootstrap {
        #[arg(long, default_value_t = 256)]
        sample: usize,
    },
    /// Print version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("status=error error={err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult {
    if let Some(log_dir) = &cli.log_dir {
        let level = cli
            .log_level
            .clone()
            .unwrap_or_else(|| default_log_level().as_str().to_string());
        init_logging(&level, log_dir)?;
    }

    if let Commands::Version = cli.command {
        println!("atomgrid_core version={}", core_version());
        println!("atomgrid_core ping={}", atomgrid_core::ping());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    let embedder = Arc::new(FeatureHashEmbedder::new(config.embedding_dim));
    let engine = Engine::open_sqlite(&cli.db, config)?;

    match cli.command {
        Commands::Ingest {
            files,
            tenant,
            sample,
        } => ingest(&engine, embedder, &files, &TenantId::new(tenant)?, sample),
        Commands::Search {
            text,
            tenant,
            top_k,
        } => {
            let query = embedder.embed_text(&text);
            let outcome = engine.search_detailed(&query, top_k, &TenantId::new(tenant)?)?;
            println!(
                "basis_version={} candidates={} radius={:.4} retries={}",
                outcome.basis_version, outcome.candidates, outcome.radius, outcome.retries
            );
            for (rank, hit) in outcome.hits.iter().enumerate() {
                let hash = engine
                    .atom_store()
                    .get_by_id(hit.atom_id)?
                    .map(|record| record.content_hash.short())
                    .unwrap_or_default();
                println!(
                    "rank={} atom_id={} score={:.6} hash={hash}",
                    rank + 1,
                    hit.atom_id,
                    hit.score
                );
            }
            Ok(())
        }
        Commands::Get { hash, tenant } => {
            let hash = ContentHash::from_hex(hash.trim())?;
            let record = engine.get_atom(&hash, &TenantId::new(tenant)?)?;
            println!("atom_id={}", record.id);
            println!("hash={}", record.content_hash);
            println!("tenant={}", record.tenant_id);
            println!("modality={}", record.modality.as_str());
            println!("subtype={}", record.subtype);
            println!("reference_count={}", record.reference_count);
            println!("overflow={}", record.overflow);
            println!("value_bytes={}", record.atomic_value.len());
            println!("payload_bytes={}", record.canonical_payload().len());
            println!("created_at={}", record.created_at);
            Ok(())
        }
        Commands::Drain => {
            let requeued = engine.requeue_failed();
            let drained = engine.drain_embeddings(embedder, &CancellationToken::new())?;
            println!(
                "requeued={requeued} embedded={} deferred={} failed={} remaining={}",
                drained.embedded,
                drained.deferred,
                drained.failed,
                engine.queue().len()
            );
            Ok(())
        }
        Commands::Bootstrap { sample } => {
            let version = engine.bootstrap_from_store(sample)?;
            println!("basis_version={version}");
            Ok(())
        }
        Commands::Version => Ok(()),
    }
}

fn ingest(
    engine: &Engine,
    embedder: Arc<FeatureHashEmbedder>,
    files: &[PathBuf],
    tenant: &TenantId,
    sample: usize,
) -> CliResult {
    for path in files {
        let content = std::fs::read(path)?;
        let source = SourceMetadata::named(path.to_string_lossy());
        let report = engine.ingest_content(&content, &source, tenant)?;
        println!(
            "file={} root_atom_id={} root_hash={} created={} deduplicated={} relations={} queued={} warnings={}",
            path.display(),
            report.root_atom_id,
            report.root_hash,
            report.atoms_created,
            report.atoms_deduplicated,
            report.relations_linked,
            report.embeddings_queued,
            report.warnings.len()
        );
        for warning in &report.warnings {
            println!("warning={warning}");
        }
    }

    let drained = engine.drain_embeddings(embedder, &CancellationToken::new())?;
    println!(
        "embedded={} deferred={} failed={}",
        drained.embedded, drained.deferred, drained.failed
    );
    if engine.basis_version().is_none() && drained.embedded > 0 {
        let version = engine.bootstrap_from_store(sample)?;
        println!("basis_version={version}");
    }
    Ok(())
}
