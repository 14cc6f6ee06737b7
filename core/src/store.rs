//! Element-store clients.
//!
//! An element store holds the harvested markup of one collection and answers
//! extraction queries with a stream of `<element freq="F" depth="D">EXPR</element>`
//! fragments. Stores are black boxes; only the query text and the fragment
//! shape are fixed.

use crate::element::Triple;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionScope {
    Document(String),
    Collection,
    CollectionExcept(HashSet<String>),
}

impl fmt::Display for ExtractionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionScope::Document(id) => write!(f, "document {id}"),
            ExtractionScope::Collection => f.write_str("whole collection"),
            ExtractionScope::CollectionExcept(ids) => write!(f, "collection without {} documents", ids.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionQuery {
    pub collection: String,
    pub scope: ExtractionScope,
    /// Expressions occurring fewer times in the scope are not reported.
    pub min_term_frequency: u32,
}

const NAMESPACES: &str = "declare namespace mws = \"http://search.mathweb.org/ns\";\n\
declare default element namespace \"http://www.w3.org/1998/Math/MathML\";\n\n";

const TERM_EXTRACTOR: &str = r#"declare function local:content($n as element()) as xs:string {
  let $t := normalize-space(string($n))
  return if ($t = "&#x2062;") then "ivt" else if ($t = "&#x2061;") then "fap" else $t
};

declare function local:notation($n as element()) as xs:string {
  if ($n/*)
  then concat(local-name($n), "(", string-join(for $c in $n/* return local:notation($c), ","), ")")
  else concat(local-name($n), ":", local:content($n))
};

declare function local:height($n as element()) as xs:integer {
  if ($n/*) then 1 + max(for $c in $n/* return local:height($c)) else 1
};

declare function local:extractTerms($docs, $minTermFreq as xs:integer) {
  for $e in $docs//*:math//*[not(self::*:annotation or self::*:annotation-xml or self::*:semantics)]
  let $key := local:notation($e)
  group by $key
  let $freq := count($e)
  where $freq >= $minTermFreq
  return <element freq="{$freq}" depth="{local:height($e[1])}">{$key}</element>
};
"#;

impl ExtractionQuery {
    pub fn new(collection: impl Into<String>, scope: ExtractionScope, min_term_frequency: u32) -> Self {
        Self { collection: collection.into(), scope, min_term_frequency }
    }

    pub fn document(collection: impl Into<String>, document_id: impl Into<String>, min_term_frequency: u32) -> Self {
        Self::new(collection, ExtractionScope::Document(document_id.into()), min_term_frequency)
    }

    pub fn describe(&self) -> String {
        format!("{} in {}", self.scope, self.collection)
    }

    /// Renders the query in the store's query language.
    pub fn to_xquery(&self) -> String {
        let selector = match &self.scope {
            ExtractionScope::Document(id) => format!("[@data-doc-id={}]", xquery_string(id)),
            ExtractionScope::Collection => String::new(),
            ExtractionScope::CollectionExcept(ids) => {
                let mut ids: Vec<&String> = ids.iter().collect();
                ids.sort();
                let list: Vec<String> = ids.into_iter().map(|id| xquery_string(id)).collect();
                format!("[not(@data-doc-id = ({}))]", list.join(", "))
            }
        };
        format!(
            "{NAMESPACES}declare variable $dataCollection := {};\ndeclare variable $minTermFreq := {};\n\n{TERM_EXTRACTOR}\n\
             declare variable $docs := /mws:harvest[@data-collection=$dataCollection]{selector};\n\
             local:extractTerms($docs, $minTermFreq)",
            xquery_string(&self.collection),
            self.min_term_frequency,
        )
    }
}

fn xquery_string(value: &str) -> String {
    format!("\"{}\"", value.replace('&', "&amp;").replace('"', "\"\""))
}

/// A connection to one element store.
pub trait ElementStore: Send {
    fn execute(&mut self, query: &ExtractionQuery) -> Result<String>;
}

/// Client for a store that accepts queries over its REST interface
/// (`POST {base_url}/rest/{collection}`).
pub struct HttpElementStore {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpElementStore {
    pub fn connect(base_url: &str, collection: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build store client: {e}")))?;
        let endpoint = format!("{}/rest/{}", base_url.trim_end_matches('/'), collection);
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ElementStore for HttpElementStore {
    fn execute(&mut self, query: &ExtractionQuery) -> Result<String> {
        let body = format!(
            "<query xmlns=\"http://basex.org/rest\"><text><![CDATA[{}]]></text></query>",
            query.to_xquery()
        );
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .map_err(|e| request_error(query, e, started))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(Error::extraction(query.describe(), format!("store returned {status}: {text}")));
        }
        let text = response.text().map_err(|e| request_error(query, e, started))?;
        debug!(endpoint = %self.endpoint, elapsed_ms = started.elapsed().as_millis() as u64, bytes = text.len(), "store answered");
        Ok(text)
    }
}

fn request_error(query: &ExtractionQuery, e: reqwest::Error, started: Instant) -> Error {
    if e.is_timeout() {
        Error::Timeout { operation: format!("query for {}", query.describe()), elapsed: started.elapsed() }
    } else {
        Error::extraction(query.describe(), e)
    }
}

/// In-process store over precomputed triples, answering with the same
/// fragment format as a real store.
#[derive(Debug, Clone, Default)]
pub struct MemoryElementStore {
    documents: HashMap<String, Vec<Triple>>,
    failing: HashSet<String>,
    latency: Option<Duration>,
}

impl MemoryElementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, document_id: impl Into<String>, triples: Vec<Triple>) -> Self {
        self.documents.insert(document_id.into(), triples);
        self
    }

    /// Queries touching this document fail.
    pub fn with_failing_document(mut self, document_id: impl Into<String>) -> Self {
        self.failing.insert(document_id.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn in_scope(&self, scope: &ExtractionScope) -> Vec<&str> {
        let mut ids: Vec<&str> = match scope {
            ExtractionScope::Document(id) => {
                self.documents.get_key_value(id).map(|(k, _)| k.as_str()).into_iter().collect()
            }
            ExtractionScope::Collection => self.documents.keys().map(String::as_str).collect(),
            ExtractionScope::CollectionExcept(excluded) => self
                .documents
                .keys()
                .filter(|id| !excluded.contains(*id))
                .map(String::as_str)
                .collect(),
        };
        ids.sort_unstable();
        ids
    }
}

impl ElementStore for MemoryElementStore {
    fn execute(&mut self, query: &ExtractionQuery) -> Result<String> {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        if let ExtractionScope::Document(id) = &query.scope {
            if self.failing.contains(id) {
                return Err(Error::extraction(query.describe(), "store unavailable"));
            }
        }

        let mut counts: Vec<(&str, u16, u64)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for id in self.in_scope(&query.scope) {
            for t in &self.documents[id] {
                match index.get(t.expression.as_str()) {
                    Some(&i) => counts[i].2 += t.term_frequency as u64,
                    None => {
                        index.insert(&t.expression, counts.len());
                        counts.push((&t.expression, t.depth, t.term_frequency as u64));
                    }
                }
            }
        }

        let mut out = String::new();
        for (expression, depth, freq) in counts {
            if freq < query.min_term_frequency as u64 {
                continue;
            }
            out.push_str(&format!(
                "<element freq=\"{freq}\" depth=\"{depth}\">{}</element>\n",
                quick_xml::escape::escape(expression)
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryElementStore {
        MemoryElementStore::new()
            .with_document("d1", vec![Triple::new("mi:x", 1, 2), Triple::new("mo:<", 1, 1)])
            .with_document("d2", vec![Triple::new("mi:x", 1, 1)])
    }

    #[test]
    fn memory_store_answers_per_document() {
        let out = store().execute(&ExtractionQuery::document("c", "d1", 1)).unwrap();
        assert_eq!(out, "<element freq=\"2\" depth=\"1\">mi:x</element>\n<element freq=\"1\" depth=\"1\">mo:&lt;</element>\n");
        assert!(store().execute(&ExtractionQuery::document("c", "nope", 1)).unwrap().is_empty());
    }

    #[test]
    fn memory_store_sums_over_collection_and_filters() {
        let mut s = store();
        let out = s.execute(&ExtractionQuery::new("c", ExtractionScope::Collection, 2)).unwrap();
        assert_eq!(out, "<element freq=\"3\" depth=\"1\">mi:x</element>\n");

        let except = ExtractionScope::CollectionExcept(["d1".to_string()].into_iter().collect());
        let out = s.execute(&ExtractionQuery::new("c", except, 1)).unwrap();
        assert_eq!(out, "<element freq=\"1\" depth=\"1\">mi:x</element>\n");
    }

    #[test]
    fn failing_document_errors() {
        let mut s = store().with_failing_document("d2");
        let err = s.execute(&ExtractionQuery::document("c", "d2", 1)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn xquery_selects_scope() {
        let q = ExtractionQuery::document("arxiv", "a\"b", 3).to_xquery();
        assert!(q.contains("declare variable $dataCollection := \"arxiv\";"));
        assert!(q.contains("declare variable $minTermFreq := 3;"));
        assert!(q.contains("[@data-doc-id=\"a\"\"b\"]"));

        let except = ExtractionScope::CollectionExcept(["y".to_string(), "x".to_string()].into_iter().collect());
        let q = ExtractionQuery::new("zb", except, 1).to_xquery();
        assert!(q.contains("[not(@data-doc-id = (\"x\", \"y\"))]"));
    }

    #[test]
    fn http_endpoint_is_derived_from_base_url() {
        let s = HttpElementStore::connect("http://localhost:8984/", "arxiv", Duration::from_secs(1)).unwrap();
        assert_eq!(s.endpoint(), "http://localhost:8984/rest/arxiv");
    }
}
