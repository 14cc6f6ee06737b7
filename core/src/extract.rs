use crate::element::{Depth, Document, Triple};
use crate::error::Result;
use crate::pool::ElementStorePool;
use crate::store::{ExtractionQuery, ExtractionScope};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

lazy_static! {
    static ref ELEMENT: Regex =
        Regex::new(r#"(?s)<element\b[^>]*?\bfreq="(\d+)"[^>]*?\bdepth="(\d+)"[^>]*>(.*?)</element>"#).expect("valid regex");
}

/// How an extraction ended. Only used for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Extracted(usize),
    NoMath,
    Failed,
}

/// Parses a store response into triples. Fragments with out-of-range numbers
/// are skipped.
pub fn parse_response(collection: &str, document_id: &str, response: &str) -> Document {
    let mut document = Document::new(collection, document_id);
    for cap in ELEMENT.captures_iter(response) {
        let (Ok(term_frequency), Ok(depth)) = (cap[1].parse::<u32>(), cap[2].parse::<Depth>()) else {
            warn!(collection, document_id, fragment = &cap[0], "skipping fragment with out-of-range numbers");
            continue;
        };
        let raw = cap[3].trim();
        let expression = match quick_xml::escape::unescape(raw) {
            Ok(text) => text.into_owned(),
            Err(e) => {
                warn!(collection, document_id, error = %e, "skipping fragment with broken entity");
                continue;
            }
        };
        if expression.is_empty() {
            continue;
        }
        document.push(Triple { expression, depth, term_frequency });
    }
    document
}

/// Runs extraction queries through the client pool.
#[derive(Clone)]
pub struct FrequencyExtractor {
    pool: Arc<ElementStorePool>,
    min_term_frequency: u32,
}

impl FrequencyExtractor {
    pub fn new(pool: Arc<ElementStorePool>, min_term_frequency: u32) -> Self {
        Self { pool, min_term_frequency }
    }

    pub fn pool(&self) -> &ElementStorePool {
        &self.pool
    }

    pub fn min_term_frequency(&self) -> u32 {
        self.min_term_frequency
    }

    pub fn try_extract(&self, collection: &str, scope: ExtractionScope) -> Result<Document> {
        let document_id = match &scope {
            ExtractionScope::Document(id) => id.clone(),
            _ => collection.to_string(),
        };
        let query = ExtractionQuery::new(collection, scope, self.min_term_frequency);
        let response = {
            let mut client = self.pool.acquire(collection)?;
            client.execute(&query)?
        };
        Ok(parse_response(collection, &document_id, &response))
    }

    /// Like [`try_extract`](Self::try_extract) but never fails: errors are
    /// logged and yield an empty document.
    pub fn extract(&self, collection: &str, scope: ExtractionScope) -> (Document, ExtractionOutcome) {
        let label = scope.to_string();
        let document_id = match &scope {
            ExtractionScope::Document(id) => id.clone(),
            _ => collection.to_string(),
        };
        let started = Instant::now();
        match self.try_extract(collection, scope) {
            Ok(document) if document.is_empty() => {
                warn!(collection, scope = %label, "no math found");
                (document, ExtractionOutcome::NoMath)
            }
            Ok(document) => {
                info!(
                    collection,
                    scope = %label,
                    expressions = document.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "extracted"
                );
                let n = document.len();
                (document, ExtractionOutcome::Extracted(n))
            }
            Err(e) => {
                warn!(collection, scope = %label, error = %e, "extraction failed");
                (Document::new(collection, document_id), ExtractionOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{ElementStore, MemoryElementStore};
    use std::time::Duration;

    #[test]
    fn parses_fragments() {
        let response = "<element freq=\"3\" depth=\"2\">mrow(mi:a,mo:&lt;,mi:b)</element>\n\
                        <element freq=\"1\" depth=\"1\">mi:a</element><element freq=\"99999999999\" depth=\"1\">mi:z</element>";
        let doc = parse_response("c", "d", response);
        assert_eq!(doc.triples, vec![Triple::new("mrow(mi:a,mo:<,mi:b)", 2, 3), Triple::new("mi:a", 1, 1)]);
    }

    #[test]
    fn empty_response_is_empty_document() {
        assert!(parse_response("c", "d", "").is_empty());
        assert!(parse_response("c", "d", "<results/>").is_empty());
    }

    fn extractor(store: MemoryElementStore) -> FrequencyExtractor {
        let connect = move |_: &str| -> Result<Box<dyn ElementStore>> { Ok(Box::new(store.clone())) };
        let pool = ElementStorePool::new(["c"], 1, Duration::from_millis(50), &connect).unwrap();
        FrequencyExtractor::new(Arc::new(pool), 1)
    }

    #[test]
    fn outcomes_are_classified_and_client_released() {
        let store = MemoryElementStore::new()
            .with_document("full", vec![Triple::new("mi:x", 1, 2)])
            .with_document("blank", vec![])
            .with_failing_document("broken");
        let ex = extractor(store);

        let (doc, outcome) = ex.extract("c", ExtractionScope::Document("full".into()));
        assert_eq!((doc.len(), outcome), (1, ExtractionOutcome::Extracted(1)));
        let (_, outcome) = ex.extract("c", ExtractionScope::Document("blank".into()));
        assert_eq!(outcome, ExtractionOutcome::NoMath);
        let (doc, outcome) = ex.extract("c", ExtractionScope::Document("broken".into()));
        assert_eq!(outcome, ExtractionOutcome::Failed);
        assert_eq!(doc.document_id, "broken");
        assert!(doc.is_empty());

        assert_eq!(ex.pool().idle("c"), Some(1));
        assert!(matches!(
            ex.try_extract("unknown", ExtractionScope::Collection).unwrap_err(),
            Error::Configuration(_)
        ));
    }
}
