use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ShortlistError {
    #[error("shortlist request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected shortlist response: {0}")]
    Response(String),
    #[error("cannot read shortlist file: {0}")]
    Io(#[from] std::io::Error),
}

/// A document proposed for a query. Only `document_id` and `collection`
/// are used for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortlistHit {
    pub document_id: String,
    pub collection: String,
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ShortlistHit {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self { document_id: document_id.into(), collection: collection.into(), relevance: 0.0, url: None }
    }
}

#[async_trait]
pub trait ShortlistProvider: Send + Sync {
    /// Up to `size` documents for `query` in `index`, best first.
    async fn shortlist(&self, query: &str, index: &str, size: usize) -> Result<Vec<ShortlistHit>, ShortlistError>;

    /// Number of documents behind `index`, if the provider knows it.
    async fn document_count(&self, index: &str) -> Result<Option<u64>, ShortlistError>;
}

/// Full-text search over an Elasticsearch-compatible REST endpoint.
///
/// Documents are expected to carry `title` (the document id), `database`
/// (the element-store collection) and optionally `arxiv` (a URL).
pub struct ElasticShortlist {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SearchBody {
    hits: HitsBody,
}

#[derive(Deserialize)]
struct HitsBody {
    hits: Vec<HitBody>,
}

#[derive(Deserialize)]
struct HitBody {
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: SourceBody,
}

#[derive(Deserialize, Default)]
struct SourceBody {
    title: Option<serde_json::Value>,
    database: Option<String>,
    arxiv: Option<String>,
}

#[derive(Deserialize)]
struct CountBody {
    count: u64,
}

impl ElasticShortlist {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ShortlistError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    fn search_body(query: &str, size: usize) -> serde_json::Value {
        // at least half of the words must match; only documents with math
        json!({
            "size": size,
            "_source": { "includes": ["title", "database", "arxiv"], "excludes": ["content"] },
            "query": {
                "bool": {
                    "must": [
                        { "match": { "content": { "query": query, "minimum_should_match": "50%" } } },
                        { "exists": { "field": "database" } }
                    ],
                    "must_not": [ { "exists": { "field": "isempty" } } ],
                    "should": [ { "match_phrase": { "content": { "query": query, "slop": 10 } } } ]
                }
            }
        })
    }
}

#[async_trait]
impl ShortlistProvider for ElasticShortlist {
    async fn shortlist(&self, query: &str, index: &str, size: usize) -> Result<Vec<ShortlistHit>, ShortlistError> {
        let url = format!("{}/{}/_search", self.base_url, index);
        let body: SearchBody = self
            .client
            .post(&url)
            .json(&Self::search_body(query, size))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut hits = Vec::with_capacity(body.hits.hits.len());
        for hit in body.hits.hits {
            let document_id = match hit.source.title {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => return Err(ShortlistError::Response("hit without title".into())),
            };
            let Some(collection) = hit.source.database.filter(|d| !d.is_empty()) else {
                debug!(document = %document_id, "hit has no math");
                continue;
            };
            hits.push(ShortlistHit { document_id, collection, relevance: hit.score.unwrap_or(0.0), url: hit.source.arxiv });
        }
        info!(index, hits = hits.len(), "shortlist retrieved");
        Ok(hits)
    }

    async fn document_count(&self, index: &str) -> Result<Option<u64>, ShortlistError> {
        let url = format!("{}/{}/_count", self.base_url, index);
        let body: CountBody = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(Some(body.count))
    }
}

/// A fixed list of documents returned for every query.
#[derive(Debug, Clone, Default)]
pub struct FixedShortlist {
    hits: Vec<ShortlistHit>,
}

impl FixedShortlist {
    pub fn new(hits: Vec<ShortlistHit>) -> Self {
        Self { hits }
    }

    /// One `collection document_id` pair per line. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn from_file(path: &Path) -> Result<Self, ShortlistError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ShortlistError> {
        let mut hits = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(collection), Some(document_id), None) => hits.push(ShortlistHit::new(collection, document_id)),
                _ => return Err(ShortlistError::Response(format!("line {}: expected `collection document_id`", i + 1))),
            }
        }
        Ok(Self { hits })
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[async_trait]
impl ShortlistProvider for FixedShortlist {
    async fn shortlist(&self, _query: &str, _index: &str, size: usize) -> Result<Vec<ShortlistHit>, ShortlistError> {
        Ok(self.hits.iter().take(size).cloned().collect())
    }

    async fn document_count(&self, _index: &str) -> Result<Option<u64>, ShortlistError> {
        Ok(None)
    }
}
