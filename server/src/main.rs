use anyhow::{bail, Result};
use axum::Router;
use clap::Parser;
use mathcore::{
    ElementStore, ElementStorePool, FrequencyExtractor, HttpElementStore, InverseDocumentFrequency, MergeFunction,
    ScoreBounds, TermFrequency, WeightingConfig,
};
use server::shortlist::{ElasticShortlist, FixedShortlist, ShortlistProvider};
use server::{build_app, AppConfig, SearchSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// Frequency table directory (shards and meta.json)
    #[arg(long, default_value = "./tables")]
    tables: PathBuf,
    /// Base URL of the element stores' REST interface
    #[arg(long)]
    store_url: String,
    /// Comma-separated element-store collections
    #[arg(long, value_delimiter = ',', required = true)]
    collections: Vec<String>,
    #[arg(long, default_value_t = 2)]
    clients_per_collection: usize,
    #[arg(long, default_value_t = 120)]
    query_timeout_secs: u64,
    #[arg(long, default_value_t = 600)]
    acquire_timeout_secs: u64,
    #[arg(long, default_value_t = 1)]
    min_term_frequency: u32,
    /// Elasticsearch URL used to shortlist documents
    #[arg(long, conflicts_with = "shortlist_file")]
    es_url: Option<String>,
    /// File of `collection document_id` lines returned for every query
    #[arg(long)]
    shortlist_file: Option<PathBuf>,
    /// Default shortlist index
    #[arg(long, default_value = "arxiv")]
    index: String,
    /// Default number of shortlisted documents
    #[arg(long, default_value_t = 10)]
    hits: usize,
    /// Default minimum number of documents an expression must appear in
    #[arg(long, default_value_t = 1)]
    min_hits: usize,
    #[arg(long, default_value_t = 1)]
    min_df: u64,
    #[arg(long, default_value_t = u64::MAX)]
    max_df: u64,
    #[arg(long, default_value_t = 1)]
    min_depth: u16,
    #[arg(long, default_value = "RELATIVE")]
    tf: TermFrequency,
    #[arg(long, default_value = "IDF")]
    idf: InverseDocumentFrequency,
    #[arg(long, default_value = "MAX")]
    merge: MergeFunction,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    // blocking store clients must be created outside the async runtime
    let timeout = Duration::from_secs(args.query_timeout_secs);
    let base_url = args.store_url.clone();
    let connector = move |collection: &str| -> mathcore::Result<Box<dyn ElementStore>> {
        Ok(Box::new(HttpElementStore::connect(&base_url, collection, timeout)?))
    };
    let pool = Arc::new(ElementStorePool::new(
        &args.collections,
        args.clients_per_collection,
        Duration::from_secs(args.acquire_timeout_secs),
        &connector,
    )?);

    let shortlist: Arc<dyn ShortlistProvider> = match (&args.es_url, &args.shortlist_file) {
        (Some(url), None) => Arc::new(ElasticShortlist::new(url, timeout)?),
        (None, Some(file)) => Arc::new(FixedShortlist::from_file(file)?),
        _ => bail!("either --es-url or --shortlist-file is required"),
    };

    let settings = SearchSettings {
        index: args.index.clone(),
        hits: args.hits,
        min_hits: args.min_hits,
        weighting: WeightingConfig { tf: args.tf, idf: args.idf, ..WeightingConfig::default() },
        bounds: ScoreBounds { min_doc_freq: args.min_df, max_doc_freq: args.max_df, min_depth: args.min_depth },
        merge: args.merge,
        ..SearchSettings::default()
    };
    let config = AppConfig {
        tables_dir: args.tables.clone(),
        extractor: FrequencyExtractor::new(pool.clone(), args.min_term_frequency),
        shortlist,
        settings,
        admin_token: std::env::var("ADMIN_TOKEN").ok(),
    };
    let app: Router = build_app(config)?;
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "server listening");
        axum::serve(listener, app).await?;
        anyhow::Ok(())
    })?;
    drop(runtime);
    pool.close();
    Ok(())
}
