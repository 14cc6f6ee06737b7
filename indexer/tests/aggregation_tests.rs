use indexer::{AggregatorConfig, Corpus, CorpusAggregator, WorkItem};
use mathcore::persist::{read_artifact, ArtifactPaths};
use mathcore::{
    ElementStore, ElementStorePool, ExtractionScope, FrequencyExtractor, FrequencyTable, InverseDocumentFrequency, MathElement,
    MemoryElementStore, ScoreBounds, ScoringEngine, TermFrequency, Triple, WeightingConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn corpus_store() -> MemoryElementStore {
    MemoryElementStore::new()
        .with_document("A", vec![Triple::new("X", 1, 2), Triple::new("mi:y", 1, 1)])
        .with_document("B", vec![Triple::new("X", 1, 1), Triple::new("msup(mi:y,mn:2)", 2, 1)])
        .with_document("C", vec![])
}

fn extractor_with(store: MemoryElementStore, calls: Arc<AtomicUsize>) -> FrequencyExtractor {
    let connect = move |_: &str| -> mathcore::Result<Box<dyn ElementStore>> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(store.clone()))
    };
    let pool = ElementStorePool::new(["arxiv"], 2, Duration::from_secs(5), &connect).unwrap();
    FrequencyExtractor::new(Arc::new(pool), 1)
}

fn work(ids: &[&str]) -> Vec<WorkItem> {
    ids.iter().map(|id| WorkItem::new("arxiv", *id)).collect()
}

fn config(parallelism: usize) -> AggregatorConfig {
    AggregatorConfig { parallelism, shards: 2, queue_capacity: 4, expected_expressions: 16, ..AggregatorConfig::default() }
}

fn snapshot(aggregator: &CorpusAggregator, items: &[WorkItem]) -> HashMap<String, MathElement> {
    aggregator.reduce(items).unwrap().0.into_iter().collect()
}

#[test]
fn three_document_corpus_builds_expected_table() {
    let dir = tempdir().unwrap();
    let extractor = extractor_with(corpus_store(), Arc::default());
    let aggregator = CorpusAggregator::new(config(2), Some(extractor)).unwrap();
    let summary = aggregator.build(&work(&["A", "B", "C"]), dir.path()).unwrap();
    assert_eq!((summary.total, summary.extracted, summary.empty, summary.failed), (3, 2, 1, 0));
    assert_eq!(summary.shards.len(), 2);

    let table = FrequencyTable::load_dir(dir.path()).unwrap();
    assert_eq!(table.total_docs(), 3);
    assert_eq!(table.lookup("X"), Some(&MathElement::new("X", 1, 3, 2)));
    for e in table.iter() {
        assert!(e.total_frequency >= e.doc_frequency && e.doc_frequency <= table.total_docs());
    }

    let engine = ScoringEngine::new(
        WeightingConfig::new(TermFrequency::Raw, InverseDocumentFrequency::Idf),
        ScoreBounds { min_doc_freq: 1, max_doc_freq: 10, min_depth: 1 },
    )
    .unwrap();
    let mut doc_a = mathcore::Document::new("arxiv", "A");
    doc_a.push(Triple::new("X", 1, 2));
    let scored = engine.score(&doc_a, &table, table.total_docs());
    assert!((scored["X"].score - 0.811).abs() < 1e-3);
}

#[test]
fn aggregation_is_order_independent() {
    let store = MemoryElementStore::new()
        .with_document("d1", vec![Triple::new("X", 1, 2), Triple::new("Y", 2, 1)])
        .with_document("d2", vec![Triple::new("X", 1, 1), Triple::new("Z", 1, 4)])
        .with_document("d3", vec![Triple::new("Y", 2, 3), Triple::new("Z", 1, 1), Triple::new("X", 1, 1)])
        .with_document("d4", vec![Triple::new("W", 3, 1)]);
    let aggregator = CorpusAggregator::new(config(4), Some(extractor_with(store, Arc::default()))).unwrap();

    let expected = snapshot(&aggregator, &work(&["d1", "d2", "d3", "d4"]));
    assert_eq!(expected["X"], MathElement::new("X", 1, 4, 3));
    for order in [["d4", "d3", "d2", "d1"], ["d2", "d4", "d1", "d3"], ["d3", "d1", "d4", "d2"]] {
        assert_eq!(snapshot(&aggregator, &work(&order)), expected);
    }
}

#[test]
fn failed_documents_are_counted_not_fatal() {
    let store = corpus_store().with_failing_document("B");
    let aggregator = CorpusAggregator::new(config(2), Some(extractor_with(store, Arc::default()))).unwrap();
    let (reduced, summary) = aggregator.reduce(&work(&["A", "B", "C"])).unwrap();
    assert_eq!((summary.extracted, summary.failed, summary.empty), (1, 1, 1));
    assert_eq!(reduced.get("X").map(|e| e.doc_frequency), Some(1));
}

#[test]
fn artifacts_resume_without_querying_again() {
    let dir = tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let cfg = AggregatorConfig { artifacts: Some(artifacts.clone()), ..config(2) };

    let live_dir = dir.path().join("live");
    let first = CorpusAggregator::new(cfg.clone(), Some(extractor_with(corpus_store(), Arc::default()))).unwrap();
    let summary = first.build(&work(&["A", "B", "C"]), &live_dir).unwrap();
    assert_eq!((summary.extracted, summary.empty), (2, 1));
    let paths = ArtifactPaths::new(&artifacts);
    assert_eq!(read_artifact(&paths, "arxiv", "A").unwrap().triples.len(), 2);
    assert!(read_artifact(&paths, "arxiv", "C").unwrap().is_empty());

    // a store that knows nothing: everything must come from the artifacts
    let second = CorpusAggregator::new(cfg.clone(), Some(extractor_with(MemoryElementStore::new(), Arc::default()))).unwrap();
    let (reduced, summary) = second.reduce(&work(&["A", "B", "C"])).unwrap();
    assert_eq!((summary.resumed, summary.empty, summary.extracted, summary.failed), (2, 1, 0, 0));
    assert_eq!(reduced.get("X").map(|e| e.total_frequency), Some(3));

    // offline build straight from the artifact directory
    let offline = CorpusAggregator::new(cfg, None).unwrap();
    let corpus = Corpus::discover_artifacts(&artifacts).unwrap();
    let offline_dir = dir.path().join("offline");
    let summary = offline.build(&corpus.interleave(), &offline_dir).unwrap();
    assert_eq!((summary.total, summary.resumed, summary.empty), (3, 2, 1));

    let live = FrequencyTable::load_dir(&live_dir).unwrap();
    let offline = FrequencyTable::load_dir(&offline_dir).unwrap();
    assert_eq!(live.total_docs(), offline.total_docs());
    let entries = |t: &FrequencyTable| {
        let mut v: Vec<MathElement> = t.iter().cloned().collect();
        v.sort_by(|a, b| a.expression.cmp(&b.expression));
        v
    };
    assert_eq!(entries(&live), entries(&offline));
    assert_eq!(offline.lookup("X"), Some(&MathElement::new("X", 1, 3, 2)));
}

#[test]
fn busy_pool_times_out_some_documents() {
    let ids: Vec<String> = (0..8).map(|i| format!("d{i}")).collect();
    let store = ids
        .iter()
        .fold(MemoryElementStore::new(), |s, id| s.with_document(id.as_str(), vec![Triple::new("X", 1, 1)]))
        .with_latency(Duration::from_millis(300));
    let connect = move |_: &str| -> mathcore::Result<Box<dyn ElementStore>> { Ok(Box::new(store.clone())) };
    let pool = ElementStorePool::new(["arxiv"], 1, Duration::from_millis(20), &connect).unwrap();
    let extractor = FrequencyExtractor::new(Arc::new(pool), 1);

    {
        let _held = extractor.pool().acquire("arxiv").unwrap();
        let err = extractor.try_extract("arxiv", ExtractionScope::Document("d0".into())).unwrap_err();
        assert!(matches!(err, mathcore::Error::Timeout { .. }));
    }

    let aggregator = CorpusAggregator::new(config(4), Some(extractor)).unwrap();
    let items: Vec<WorkItem> = ids.iter().map(|id| WorkItem::new("arxiv", id.as_str())).collect();
    let (reduced, summary) = aggregator.reduce(&items).unwrap();
    assert!(summary.extracted >= 1);
    assert!(summary.failed >= 1);
    assert_eq!(summary.extracted + summary.failed, 8);
    assert_eq!(reduced.get("X").map(|e| e.doc_frequency), Some(summary.extracted));
}

#[test]
fn batch_deadline_skips_remaining_documents() {
    let aggregator = CorpusAggregator::new(
        AggregatorConfig { batch_timeout: Some(Duration::ZERO), ..config(2) },
        Some(extractor_with(corpus_store(), Arc::default())),
    )
    .unwrap();
    let (reduced, summary) = aggregator.reduce(&work(&["A", "B", "C"])).unwrap();
    assert_eq!((summary.total, summary.failed, summary.timed_out, summary.extracted), (3, 3, 3, 0));
    assert!(reduced.is_empty());

    let generous = CorpusAggregator::new(
        AggregatorConfig { batch_timeout: Some(Duration::from_secs(60)), ..config(2) },
        Some(extractor_with(corpus_store(), Arc::default())),
    )
    .unwrap();
    let (_, summary) = generous.reduce(&work(&["A", "B", "C"])).unwrap();
    assert_eq!((summary.extracted, summary.timed_out), (2, 0));
}

#[test]
fn pool_clients_are_created_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let aggregator = CorpusAggregator::new(config(4), Some(extractor_with(corpus_store(), calls.clone()))).unwrap();
    let items: Vec<WorkItem> = (0..40).map(|i| WorkItem::new("arxiv", ["A", "B", "C"][i % 3])).collect();
    let (_, summary) = aggregator.reduce(&items).unwrap();
    assert_eq!(summary.total, 40);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
