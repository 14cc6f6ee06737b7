use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indexer::tables::{self, TableWriteOptions};
use indexer::{AggregatorConfig, Corpus, CorpusAggregator};
use mathcore::notation::notation_to_markup;
use mathcore::{ElementStore, ElementStorePool, FrequencyExtractor, FrequencyTable, HttpElementStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build and maintain formula frequency tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Base URL of the element stores' REST interface
    #[arg(long)]
    store_url: Option<String>,
    /// Clients kept open per collection
    #[arg(long, default_value_t = 2)]
    clients_per_collection: usize,
    /// Per-query timeout in seconds
    #[arg(long, default_value_t = 120)]
    query_timeout_secs: u64,
    /// Longest wait for a free client in seconds
    #[arg(long, default_value_t = 600)]
    acquire_timeout_secs: u64,
    /// Minimum term frequency reported per document
    #[arg(long, default_value_t = 1)]
    min_term_frequency: u32,
}

#[derive(Args)]
struct RunArgs {
    /// Documents processed concurrently (defaults to the number of cores)
    #[arg(long)]
    parallelism: Option<usize>,
    /// Show a progress bar
    #[arg(long, default_value_t = false)]
    progress: bool,
    /// Documents not started within this many seconds are counted as failed
    #[arg(long)]
    batch_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every document of the dataset into per-document artifacts
    Extract {
        /// Dataset directory: one sub-directory per collection
        #[arg(long)]
        dataset: PathBuf,
        /// Artifact directory (existing artifacts are skipped)
        #[arg(long)]
        artifacts: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Build a frequency table from the dataset and/or existing artifacts
    Build {
        /// Dataset directory; defaults to the documents found under --artifacts
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Output table directory
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 4)]
        shards: usize,
        #[arg(long, default_value_t = 10_000)]
        queue_capacity: usize,
        /// Expected number of distinct expressions
        #[arg(long, default_value_t = 1 << 16)]
        expected_expressions: usize,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Add one table to another
    Merge {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        incoming: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 4)]
        shards: usize,
    },
    /// Print table statistics as JSON
    Stats {
        #[arg(long)]
        table: PathBuf,
        /// Number of top expressions
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only expressions of this depth
        #[arg(long)]
        depth: Option<u16>,
        /// Include the markup of each top expression
        #[arg(long, default_value_t = false)]
        markup: bool,
    },
    /// Print the markup of an expression given in notation
    Render { notation: String },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Extract { dataset, artifacts, store, run } => {
            let corpus = Corpus::discover(&dataset)?;
            let config = aggregator_config(&run, Some(artifacts), store.min_term_frequency);
            let extractor = connect(&store, &corpus)?.context("--store-url is required for extraction")?;
            let aggregator = CorpusAggregator::new(config, Some(extractor))?;
            let summary = aggregator.extract(&corpus.interleave())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Build { dataset, artifacts, output, shards, queue_capacity, expected_expressions, store, run } => {
            let corpus = match (&dataset, &artifacts) {
                (Some(dataset), _) => Corpus::discover(dataset)?,
                (None, Some(artifacts)) => Corpus::discover_artifacts(artifacts)?,
                (None, None) => bail!("either --dataset or --artifacts is required"),
            };
            let config = AggregatorConfig {
                shards,
                queue_capacity,
                expected_expressions,
                ..aggregator_config(&run, artifacts, store.min_term_frequency)
            };
            let extractor = connect(&store, &corpus)?;
            let aggregator = CorpusAggregator::new(config, extractor)?;
            let summary = aggregator.build(&corpus.interleave(), &output)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Merge { base, incoming, output, shards } => {
            let options = TableWriteOptions { shards, queue_capacity: 10_000, show_progress: false };
            let meta = tables::merge_tables(&base, &incoming, &output, &options)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(())
        }
        Commands::Stats { table, limit, depth, markup } => {
            let table = load_table(&table)?;
            let report = tables::stats(&table, limit, depth, markup);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Render { notation } => {
            println!("{}", notation_to_markup(&notation)?);
            Ok(())
        }
    }
}

fn aggregator_config(run: &RunArgs, artifacts: Option<PathBuf>, min_term_frequency: u32) -> AggregatorConfig {
    let defaults = AggregatorConfig::default();
    AggregatorConfig {
        parallelism: run.parallelism.unwrap_or(defaults.parallelism),
        artifacts,
        min_term_frequency,
        show_progress: run.progress,
        batch_timeout: run.batch_timeout_secs.map(Duration::from_secs),
        ..defaults
    }
}

fn connect(store: &StoreArgs, corpus: &Corpus) -> Result<Option<FrequencyExtractor>> {
    let Some(base_url) = store.store_url.clone() else { return Ok(None) };
    let timeout = Duration::from_secs(store.query_timeout_secs);
    let connector = move |collection: &str| -> mathcore::Result<Box<dyn ElementStore>> {
        Ok(Box::new(HttpElementStore::connect(&base_url, collection, timeout)?))
    };
    let pool = ElementStorePool::new(
        corpus.collections(),
        store.clients_per_collection,
        Duration::from_secs(store.acquire_timeout_secs),
        &connector,
    )?;
    Ok(Some(FrequencyExtractor::new(Arc::new(pool), store.min_term_frequency)))
}

fn load_table(dir: &Path) -> Result<FrequencyTable> {
    FrequencyTable::load_dir(dir).with_context(|| format!("loading table {}", dir.display()))
}
