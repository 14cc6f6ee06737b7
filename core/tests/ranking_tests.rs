use mathcore::element::Triple;
use mathcore::merge::{self, MergeFunction};
use mathcore::{
    ElementStore, ElementStorePool, ExtractionScope, FrequencyExtractor, FrequencyTable, InverseDocumentFrequency,
    MathElement, MemoryElementStore, ScoreBounds, ScoringEngine, TermFrequency, WeightingConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn extractor() -> FrequencyExtractor {
    let store = MemoryElementStore::new()
        .with_document("A", vec![Triple::new("X", 1, 2), Triple::new("mi:y", 1, 1)])
        .with_document("B", vec![Triple::new("X", 1, 1)])
        .with_document("C", vec![Triple::new("mi:y", 1, 3)]);
    let connect = move |_: &str| -> mathcore::Result<Box<dyn ElementStore>> { Ok(Box::new(store.clone())) };
    let pool = ElementStorePool::new(["arxiv"], 2, Duration::from_secs(1), &connect).unwrap();
    FrequencyExtractor::new(Arc::new(pool), 1)
}

fn table() -> FrequencyTable {
    FrequencyTable::from_elements(vec![MathElement::new("X", 1, 3, 2), MathElement::new("mi:y", 1, 4, 2)], 3)
}

#[test]
fn scores_extracted_document() {
    let ex = extractor();
    let engine = ScoringEngine::new(
        WeightingConfig::new(TermFrequency::Raw, InverseDocumentFrequency::Idf),
        ScoreBounds { min_doc_freq: 1, max_doc_freq: 10, min_depth: 1 },
    )
    .unwrap();
    let (doc, _) = ex.extract("arxiv", ExtractionScope::Document("A".into()));
    let scored = engine.score(&doc, &table(), 3);
    assert!((scored["X"].score - 0.811).abs() < 1e-3);
    assert!((scored["mi:y"].score - 1.5f64.ln()).abs() < 1e-12);
}

#[test]
fn ranks_across_documents() {
    let ex = extractor();
    let engine = ScoringEngine::new(
        WeightingConfig::new(TermFrequency::Raw, InverseDocumentFrequency::Idf),
        ScoreBounds::default(),
    )
    .unwrap();
    let t = table();
    let per_document = ["A", "B", "C"].iter().map(|id| {
        let (doc, _) = ex.extract("arxiv", ExtractionScope::Document(id.to_string()));
        engine.score(&doc, &t, t.total_docs())
    });
    let ranked = merge::merge(merge::collect(per_document), MergeFunction::Max, 2);
    let names: Vec<&str> = ranked.iter().map(|e| e.expression.as_str()).collect();
    assert_eq!(names, vec!["mi:y", "X"]);
    assert_eq!((ranked[0].total_frequency, ranked[0].doc_frequency), (4, 2));
    assert_eq!((ranked[1].total_frequency, ranked[1].doc_frequency), (3, 2));
}

#[test]
fn loaded_table_respects_frequency_invariants() {
    let t = table();
    for e in t.iter() {
        assert!(e.total_frequency >= e.doc_frequency);
        assert!(e.doc_frequency <= t.total_docs());
    }
}
