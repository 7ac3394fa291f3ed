//! ctx-inspect
//!
//! Loads a ledger dump into an in-memory ledger, builds the context graph
//! it describes, resolves every node and prints the resulting tree.

use anyhow::{Context, Result};
use clap::Parser;
use ledger_context::config::FrameworkConfig;
use ledger_context::context::ContextEnv;
use ledger_context::inspect::LedgerDump;
use ledger_context::metrics::ContextMetrics;
use ledger_context::observability::init_logging;
use ledger_context::tree::{describe_all, to_tree_string};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve and print a ledger context graph", long_about = None)]
struct Args {
    /// Ledger dump (JSON) with accounts and graph shape
    dump: PathBuf,

    /// Path to configuration file
    #[arg(short, long, env = "LEDGER_CTX_CONFIG")]
    config: Option<PathBuf>,

    /// Bypass cached reads
    #[arg(long)]
    no_cache: bool,

    /// Print node descriptions as JSON instead of a tree
    #[arg(long)]
    json: bool,

    /// Print prometheus metrics after resolution
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = FrameworkConfig::from_file_with_env(args.config.as_ref())
        .context("Failed to load configuration")?;
    init_logging(&config.logging)?;
    info!(dump = %args.dump.display(), "Starting ctx-inspect {}", env!("CARGO_PKG_VERSION"));

    let contents = tokio::fs::read_to_string(&args.dump)
        .await
        .with_context(|| format!("Failed to read {}", args.dump.display()))?;
    let dump = LedgerDump::from_json(&contents)?;
    let ledger = Arc::new(dump.seed_ledger()?);
    debug!(accounts = dump.accounts.len(), "ledger seeded");

    let metrics = Arc::new(ContextMetrics::new()?);
    let env = ContextEnv::from_config(&config, ledger.clone())
        .with_writer(ledger.clone())
        .with_metrics(metrics.clone())
        .shared();
    let root = dump.build_graph(env.clone())?;

    root.clone()
        .resolve_account_tree(args.no_cache)
        .await
        .context("Failed to resolve context graph")?;
    info!(fetches = ledger.total_fetches(), "graph resolved");

    if args.json {
        let described = describe_all(root.as_ref());
        println!("{}", serde_json::to_string_pretty(&described)?);
    } else {
        print!("{}", to_tree_string(root.as_ref()));
    }

    if args.metrics {
        metrics.observe_cache(&env.cache().stats());
        print!("{}", metrics.gather_text()?);
    }
    Ok(())
}
