pub mod shortlist;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use mathcore::notation::notation_to_markup;
use mathcore::persist::TableMeta;
use mathcore::table::DepthStats;
use mathcore::{
    merge, Document, ExtractionOutcome, ExtractionScope, FrequencyExtractor, FrequencyTable, InverseDocumentFrequency,
    MathElement, MergeFunction, ScoreBounds, ScoredElement, ScoringEngine, TableHandle, TermFrequency, WeightingConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shortlist::ShortlistProvider;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Defaults applied when a request leaves a parameter out.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub index: String,
    /// Documents requested from the shortlist provider.
    pub hits: usize,
    /// Minimum number of shortlisted documents an expression must appear in.
    pub min_hits: usize,
    pub weighting: WeightingConfig,
    pub bounds: ScoreBounds,
    pub merge: MergeFunction,
    pub max_results: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index: "arxiv".into(),
            hits: 10,
            min_hits: 1,
            weighting: WeightingConfig::default(),
            bounds: ScoreBounds::default(),
            merge: MergeFunction::Max,
            max_results: 1000,
        }
    }
}

pub struct AppConfig {
    pub tables_dir: PathBuf,
    pub extractor: FrequencyExtractor,
    pub shortlist: Arc<dyn ShortlistProvider>,
    pub settings: SearchSettings,
    pub admin_token: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub tables_dir: PathBuf,
    pub table: TableHandle,
    pub extractor: FrequencyExtractor,
    pub shortlist: Arc<dyn ShortlistProvider>,
    pub settings: Arc<SearchSettings>,
    pub admin_token: Option<String>,
    reload_lock: Arc<Mutex<()>>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

pub fn build_app(config: AppConfig) -> Result<Router> {
    let started = Instant::now();
    let table = FrequencyTable::load_dir(&config.tables_dir)
        .with_context(|| format!("loading frequency table from {}", config.tables_dir.display()))?;
    info!(
        expressions = table.len(),
        total_docs = table.total_docs(),
        elapsed_s = started.elapsed().as_secs_f64(),
        "frequency table loaded"
    );
    config.settings.weighting.validate()?;

    let state = AppState {
        tables_dir: config.tables_dir,
        table: TableHandle::new(table),
        extractor: config.extractor,
        shortlist: config.shortlist,
        settings: Arc::new(config.settings),
        admin_token: config.admin_token,
        reload_lock: Arc::new(Mutex::new(())),
    };

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_handler))
        .route("/collection/:name", get(collection_handler))
        .route("/expression", get(expression_handler))
        .route("/stats", get(stats_handler))
        .route("/admin/reload", post(reload_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());
    Ok(app)
}

fn default_k() -> usize {
    10
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
    pub index: Option<String>,
    pub hits: Option<usize>,
    pub min_hits: Option<usize>,
    pub tf: Option<String>,
    pub idf: Option<String>,
    pub merge: Option<String>,
    /// Regex over whole expressions; matching results are flagged.
    pub expect: Option<String>,
    /// Render each result as markup too.
    #[serde(default)]
    pub markup: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RankedHit {
    pub rank: usize,
    pub expression: String,
    pub depth: u16,
    pub score: f64,
    pub total_frequency: u64,
    pub doc_frequency: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markup: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub index: String,
    pub took_s: f64,
    pub documents: usize,
    pub extracted: usize,
    pub empty: usize,
    pub failed: usize,
    pub total_hits: usize,
    pub results: Vec<RankedHit>,
    /// Ranks (1-based, over all results) of the expressions matching `expect`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_ranks: Option<Vec<usize>>,
}

fn engine_for(settings: &SearchSettings, tf: Option<&str>, idf: Option<&str>) -> Result<ScoringEngine, ApiError> {
    let mut weighting = settings.weighting;
    if let Some(tf) = tf {
        weighting.tf = tf.parse::<TermFrequency>().map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    }
    if let Some(idf) = idf {
        weighting.idf = idf.parse::<InverseDocumentFrequency>().map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    }
    ScoringEngine::new(weighting, settings.bounds).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

fn expectation(expect: Option<&str>) -> Result<Option<regex::Regex>, ApiError> {
    match expect.filter(|e| !e.is_empty()) {
        None => Ok(None),
        Some(pattern) => regex::Regex::new(&format!("^(?:{pattern})$"))
            .map(Some)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid expect pattern: {e}"))),
    }
}

fn rank(
    engine: ScoringEngine,
    documents: &[Document],
    table: &FrequencyTable,
    total_docs: u64,
    function: MergeFunction,
    min_hits: usize,
) -> Vec<ScoredElement> {
    let per_document = documents.iter().map(|doc| engine.score(doc, table, total_docs));
    merge::merge(merge::collect(per_document), function, min_hits)
}

fn to_hits(
    ranked: Vec<ScoredElement>,
    k: usize,
    expect: Option<&regex::Regex>,
    with_markup: bool,
) -> (Vec<RankedHit>, Option<Vec<usize>>) {
    let expected_ranks = expect.map(|re| {
        ranked
            .iter()
            .enumerate()
            .filter(|(_, e)| re.is_match(&e.expression))
            .map(|(i, _)| i + 1)
            .collect::<Vec<_>>()
    });
    let hits = ranked
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(i, e)| RankedHit {
            rank: i + 1,
            expected: expect.map(|re| re.is_match(&e.expression)),
            markup: if with_markup { notation_to_markup(&e.expression).ok() } else { None },
            expression: e.expression,
            depth: e.depth,
            score: e.score,
            total_frequency: e.total_frequency,
            doc_frequency: e.doc_frequency,
        })
        .collect();
    (hits, expected_ranks)
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let start = Instant::now();
    let settings = state.settings.clone();
    let engine = engine_for(&settings, params.tf.as_deref(), params.idf.as_deref())?;
    let function = match params.merge.as_deref() {
        Some(m) => m.parse::<MergeFunction>().map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?,
        None => settings.merge,
    };
    let expect = expectation(params.expect.as_deref())?;
    let index = params.index.clone().unwrap_or_else(|| settings.index.clone());
    let k = params.k.clamp(1, settings.max_results);
    let min_hits = params.min_hits.unwrap_or(settings.min_hits).max(1);

    let shortlisted = state
        .shortlist
        .shortlist(&params.q, &index, params.hits.unwrap_or(settings.hits))
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))?;
    let table = state.table.current();
    let total_docs = match state.shortlist.document_count(&index).await {
        Ok(Some(n)) => n,
        Ok(None) => table.total_docs(),
        Err(e) => {
            warn!(index = %index, error = %e, "document count unavailable, using table size");
            table.total_docs()
        }
    };

    let documents_requested = shortlisted.len();
    let mut tasks = Vec::with_capacity(shortlisted.len());
    for hit in shortlisted {
        if !state.extractor.pool().contains(&hit.collection) {
            warn!(collection = %hit.collection, document = %hit.document_id, "unknown collection, skipping hit");
            continue;
        }
        let extractor = state.extractor.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            extractor.extract(&hit.collection, ExtractionScope::Document(hit.document_id.clone()))
        }));
    }

    let (mut documents, mut empty, mut failed) = (Vec::with_capacity(tasks.len()), 0, 0);
    for task in tasks {
        let (doc, outcome) = task.await.map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        match outcome {
            ExtractionOutcome::Extracted(_) => documents.push(doc),
            ExtractionOutcome::NoMath => empty += 1,
            ExtractionOutcome::Failed => failed += 1,
        }
    }
    if failed > 0 && documents.is_empty() && empty == 0 {
        return Err(api_error(StatusCode::BAD_GATEWAY, format!("extraction failed for all {failed} documents")));
    }

    let extracted = documents.len();
    let ranked = tokio::task::spawn_blocking(move || rank(engine, &documents, &table, total_docs, function, min_hits))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let total_hits = ranked.len();
    let (results, expected_ranks) = to_hits(ranked, k, expect.as_ref(), params.markup);

    let took_s = start.elapsed().as_secs_f64();
    info!(query = %params.q, index = %index, documents = documents_requested, extracted, empty, failed, total_hits, took_s, "search");
    Ok(Json(SearchResponse {
        query: params.q,
        index,
        took_s,
        documents: documents_requested,
        extracted,
        empty,
        failed,
        total_hits,
        results,
        expected_ranks,
    }))
}

#[derive(Deserialize)]
pub struct CollectionParams {
    /// Comma-separated document ids left out of the collection.
    pub exclude: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    pub tf: Option<String>,
    pub idf: Option<String>,
    #[serde(default)]
    pub markup: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CollectionResponse {
    pub collection: String,
    pub excluded: usize,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<RankedHit>,
}

/// Ranks a whole collection as one document.
pub async fn collection_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<CollectionParams>,
) -> Result<Json<CollectionResponse>, ApiError> {
    let start = Instant::now();
    if !state.extractor.pool().contains(&name) {
        return Err(api_error(StatusCode::NOT_FOUND, format!("unknown collection {name}")));
    }
    let engine = engine_for(&state.settings, params.tf.as_deref(), params.idf.as_deref())?;
    let excluded: HashSet<String> = params
        .exclude
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    let excluded_count = excluded.len();
    let scope = if excluded.is_empty() { ExtractionScope::Collection } else { ExtractionScope::CollectionExcept(excluded) };

    let extractor = state.extractor.clone();
    let collection = name.clone();
    let document = tokio::task::spawn_blocking(move || extractor.try_extract(&collection, scope))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))?;

    let table = state.table.current();
    let k = params.k.clamp(1, state.settings.max_results);
    let ranked = tokio::task::spawn_blocking(move || {
        let total_docs = table.total_docs();
        rank(engine, std::slice::from_ref(&document), &table, total_docs, MergeFunction::Max, 1)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let total_hits = ranked.len();
    let (results, _) = to_hits(ranked, k, None, params.markup);
    Ok(Json(CollectionResponse { collection: name, excluded: excluded_count, took_s: start.elapsed().as_secs_f64(), total_hits, results }))
}

#[derive(Deserialize)]
pub struct ExpressionParams {
    pub e: String,
}

#[derive(Debug, Serialize)]
pub struct ExpressionResponse {
    #[serde(flatten)]
    pub element: MathElement,
    pub idf: f64,
    pub markup: Option<String>,
}

pub async fn expression_handler(
    State(state): State<AppState>,
    Query(params): Query<ExpressionParams>,
) -> Result<Json<ExpressionResponse>, ApiError> {
    let table = state.table.current();
    let Some(element) = table.lookup(&params.e) else {
        return Err(api_error(StatusCode::NOT_FOUND, format!("{} is not in the table", params.e)));
    };
    let idf = state.settings.weighting.idf.calculate(element.doc_frequency, table.total_docs());
    let markup = notation_to_markup(&element.expression).ok();
    Ok(Json(ExpressionResponse { element: element.clone(), idf, markup }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_docs: u64,
    pub expressions: usize,
    pub total_occurrences: u64,
    pub average_document_length: f64,
    pub depths: Vec<DepthStats>,
    pub meta: Option<TableMeta>,
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let table = state.table.current();
    Json(StatsResponse {
        total_docs: table.total_docs(),
        expressions: table.len(),
        total_occurrences: table.total_occurrences(),
        average_document_length: table.average_document_length(),
        depths: table.depth_summary(),
        meta: table.meta().cloned(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub expressions: usize,
    pub total_docs: u64,
    pub previous_expressions: usize,
    pub took_s: f64,
}

/// Loads the shards again and swaps them in. Searches already running keep
/// the table they started with; a failed load keeps the current table.
async fn reload_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<ReloadResponse>, ApiError> {
    authorize(&state, &headers)?;
    let start = Instant::now();
    let (dir, handle, lock) = (state.tables_dir.clone(), state.table.clone(), state.reload_lock.clone());
    let (previous, current) = tokio::task::spawn_blocking(move || -> mathcore::Result<_> {
        let _guard = lock.lock();
        let table = FrequencyTable::load_dir(&dir)?;
        let previous = handle.swap(table);
        Ok((previous, handle.current()))
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
    .map_err(|e| {
        warn!(error = %e, "reload failed, keeping current table");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })?;
    info!(expressions = current.len(), previous = previous.len(), total_docs = current.total_docs(), "table reloaded");
    Ok(Json(ReloadResponse {
        expressions: current.len(),
        total_docs: current.total_docs(),
        previous_expressions: previous.len(),
        took_s: start.elapsed().as_secs_f64(),
    }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(api_error(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set")),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}
