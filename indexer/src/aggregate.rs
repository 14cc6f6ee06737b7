use crate::corpus::WorkItem;
use crate::progress;
use crate::tables::{self, TableWriteOptions};
use anyhow::{bail, Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mathcore::persist::{read_artifact, write_artifact, ArtifactPaths, TableMeta};
use mathcore::{Document, ExtractionOutcome, ExtractionScope, FrequencyExtractor, MathElement};
use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Documents processed concurrently.
    pub parallelism: usize,
    pub shards: usize,
    pub queue_capacity: usize,
    /// Initial capacity of the reduction map.
    pub expected_expressions: usize,
    /// Per-document artifacts are read from and written to this directory.
    pub artifacts: Option<PathBuf>,
    pub min_term_frequency: u32,
    pub show_progress: bool,
    /// Items not started before this much time has passed are counted as
    /// failed without being processed.
    pub batch_timeout: Option<Duration>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            shards: 4,
            queue_capacity: 10_000,
            expected_expressions: 1 << 16,
            artifacts: None,
            min_term_frequency: 1,
            show_progress: false,
            batch_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardSummary {
    pub path: PathBuf,
    pub records: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationSummary {
    pub total: u64,
    pub extracted: u64,
    pub resumed: u64,
    pub empty: u64,
    pub failed: u64,
    /// Part of `failed`: items skipped after the batch deadline.
    pub timed_out: u64,
    pub expressions: u64,
    pub shards: Vec<ShardSummary>,
    pub elapsed_secs: f64,
}

#[derive(Default)]
struct Counters {
    extracted: AtomicU64,
    resumed: AtomicU64,
    empty: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl Counters {
    fn summary(&self, total: usize, started: Instant) -> AggregationSummary {
        AggregationSummary {
            total: total as u64,
            extracted: self.extracted.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            elapsed_secs: started.elapsed().as_secs_f64(),
            ..AggregationSummary::default()
        }
    }
}

enum Obtained {
    Extracted(Document),
    Resumed(Document),
    Empty,
    Failed,
}

/// Walks a work list on a bounded pool and reduces the extracted triples
/// into corpus statistics.
pub struct CorpusAggregator {
    config: AggregatorConfig,
    extractor: Option<FrequencyExtractor>,
    artifacts: Option<ArtifactPaths>,
}

impl CorpusAggregator {
    pub fn new(config: AggregatorConfig, extractor: Option<FrequencyExtractor>) -> Result<Self> {
        if config.parallelism == 0 || config.shards == 0 {
            bail!("parallelism and shard count must be at least 1");
        }
        if extractor.is_none() && config.artifacts.is_none() {
            bail!("either an element store or an artifact directory is required");
        }
        let artifacts = config.artifacts.as_ref().map(ArtifactPaths::new);
        Ok(Self { config, extractor, artifacts })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn obtain(&self, item: &WorkItem) -> Obtained {
        if let Some(artifacts) = &self.artifacts {
            if artifacts.exists(&item.collection, &item.document_id) {
                match read_artifact(artifacts, &item.collection, &item.document_id) {
                    Ok(doc) if doc.is_empty() => return Obtained::Empty,
                    Ok(doc) => return Obtained::Resumed(doc),
                    Err(e) => warn!(collection = %item.collection, document = %item.document_id, error = %e, "unreadable artifact"),
                }
            }
        }
        let Some(extractor) = &self.extractor else {
            warn!(collection = %item.collection, document = %item.document_id, "no artifact and no element store");
            return Obtained::Failed;
        };
        let (doc, outcome) = extractor.extract(&item.collection, ExtractionScope::Document(item.document_id.clone()));
        match outcome {
            ExtractionOutcome::Failed => Obtained::Failed,
            ExtractionOutcome::NoMath => {
                self.store_artifact(item, &doc);
                Obtained::Empty
            }
            ExtractionOutcome::Extracted(_) => {
                self.store_artifact(item, &doc);
                Obtained::Extracted(doc)
            }
        }
    }

    /// An empty document is stored as a zero-line artifact.
    fn store_artifact(&self, item: &WorkItem, doc: &Document) {
        if let Some(artifacts) = &self.artifacts {
            if let Err(e) = write_artifact(artifacts, doc) {
                warn!(collection = %item.collection, document = %item.document_id, error = %e, "cannot store artifact");
            }
        }
    }

    fn run<F>(&self, work: &[WorkItem], prefix: &str, sink: F) -> Result<Counters>
    where
        F: Fn(Document) + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism)
            .thread_name(|i| format!("aggregate-{i}"))
            .build()
            .context("building worker pool")?;
        let counters = Counters::default();
        let deadline = self.config.batch_timeout.map(|t| Instant::now() + t);
        let pb = progress::bar(work.len() as u64, prefix, self.config.show_progress);
        pool.install(|| {
            work.iter().par_bridge().for_each(|item| {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    if counters.timed_out.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!(document = %item.document_id, "batch deadline passed, skipping remaining documents");
                    }
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    pb.inc(1);
                    return;
                }
                match self.obtain(item) {
                    Obtained::Extracted(doc) => {
                        counters.extracted.fetch_add(1, Ordering::Relaxed);
                        sink(doc);
                    }
                    Obtained::Resumed(doc) => {
                        counters.resumed.fetch_add(1, Ordering::Relaxed);
                        sink(doc);
                    }
                    Obtained::Empty => {
                        counters.empty.fetch_add(1, Ordering::Relaxed);
                    }
                    Obtained::Failed => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                pb.inc(1);
            })
        });
        pb.finish_with_message(format!(
            "{} empty, {} failed",
            counters.empty.load(Ordering::Relaxed),
            counters.failed.load(Ordering::Relaxed)
        ));
        Ok(counters)
    }

    /// Extracts every work item into an artifact without reducing.
    pub fn extract(&self, work: &[WorkItem]) -> Result<AggregationSummary> {
        if self.artifacts.is_none() || self.extractor.is_none() {
            bail!("extraction needs both an element store and an artifact directory");
        }
        let started = Instant::now();
        let counters = self.run(work, "Extracting", |_| {})?;
        let summary = counters.summary(work.len(), started);
        info!(total = summary.total, extracted = summary.extracted, resumed = summary.resumed, empty = summary.empty, failed = summary.failed, "extraction finished");
        Ok(summary)
    }

    /// Reduces the work list into per-expression statistics.
    pub fn reduce(&self, work: &[WorkItem]) -> Result<(DashMap<String, MathElement>, AggregationSummary)> {
        let started = Instant::now();
        let reduced: DashMap<String, MathElement> = DashMap::with_capacity(self.config.expected_expressions);
        let counters = self.run(work, "Aggregating", |doc| fold(&reduced, &doc))?;
        let mut summary = counters.summary(work.len(), started);
        summary.expressions = reduced.len() as u64;
        Ok((reduced, summary))
    }

    /// Reduces the work list and writes the table (shards and `meta.json`) to `output`.
    pub fn build(&self, work: &[WorkItem], output: &Path) -> Result<AggregationSummary> {
        let started = Instant::now();
        let (reduced, mut summary) = self.reduce(work)?;
        let meta = TableMeta {
            total_docs: summary.total,
            empty_docs: summary.empty,
            failed_docs: summary.failed,
            num_expressions: summary.expressions,
            num_shards: self.config.shards as u32,
            min_term_frequency: self.config.min_term_frequency,
            created_at: tables::now_rfc3339(),
            version: mathcore::persist::FORMAT_VERSION,
        };
        let options = TableWriteOptions {
            shards: self.config.shards,
            queue_capacity: self.config.queue_capacity,
            show_progress: self.config.show_progress,
        };
        let reports = tables::write_table(reduced.into_iter().map(|(_, e)| e), summary.expressions, output, &meta, &options)?;
        summary.shards = reports;
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            total = summary.total,
            extracted = summary.extracted,
            resumed = summary.resumed,
            empty = summary.empty,
            failed = summary.failed,
            timed_out = summary.timed_out,
            expressions = summary.expressions,
            elapsed_secs = summary.elapsed_secs,
            "table built"
        );
        Ok(summary)
    }
}

/// Adds one document: each distinct expression counts once towards the
/// document frequency.
fn fold(reduced: &DashMap<String, MathElement>, doc: &Document) {
    for (expression, (depth, count)) in doc.grouped() {
        let incoming = MathElement::new(expression, depth, count, 1);
        if let Some(mut existing) = reduced.get_mut(expression) {
            merge_logged(&mut existing, &incoming, doc);
            continue;
        }
        match reduced.entry(expression.to_string()) {
            Entry::Occupied(mut existing) => merge_logged(existing.get_mut(), &incoming, doc),
            Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
        }
    }
}

/// On a depth conflict the smaller depth is kept, so the result does not
/// depend on the order documents are folded in.
fn merge_logged(existing: &mut MathElement, incoming: &MathElement, doc: &Document) {
    if let Err(e) = existing.merge(incoming) {
        warn!(document = %doc.document_id, error = %e, "depth conflict, keeping the smaller depth");
        existing.merge_min_depth(incoming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mathcore::Triple;

    #[test]
    fn fold_counts_distinct_documents() {
        let reduced = DashMap::new();
        let mut a = Document::new("c", "a");
        a.push(Triple::new("X", 1, 1));
        a.push(Triple::new("X", 1, 1));
        let mut b = Document::new("c", "b");
        b.push(Triple::new("X", 1, 1));
        b.push(Triple::new("X", 2, 5));
        fold(&reduced, &a);
        fold(&reduced, &b);
        let x = reduced.get("X").unwrap();
        assert_eq!((x.total_frequency, x.doc_frequency), (8, 2));
    }

    #[test]
    fn depth_conflicts_fold_the_same_in_any_order() {
        let mut shallow = Document::new("c", "a");
        shallow.push(Triple::new("X", 1, 2));
        let mut deep = Document::new("c", "b");
        deep.push(Triple::new("X", 3, 4));
        deep.push(Triple::new("mi:y", 1, 1));

        let forward = DashMap::new();
        fold(&forward, &shallow);
        fold(&forward, &deep);
        let backward = DashMap::new();
        fold(&backward, &deep);
        fold(&backward, &shallow);

        for reduced in [&forward, &backward] {
            let x = reduced.get("X").unwrap();
            assert_eq!((x.depth, x.total_frequency, x.doc_frequency), (1, 6, 2));
        }
    }

    #[test]
    fn needs_a_source() {
        assert!(CorpusAggregator::new(AggregatorConfig::default(), None).is_err());
        let config = AggregatorConfig { parallelism: 0, artifacts: Some(PathBuf::from("a")), ..AggregatorConfig::default() };
        assert!(CorpusAggregator::new(config, None).is_err());
    }
}
