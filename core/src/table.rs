use crate::element::{Depth, MathElement};
use crate::error::Result;
use crate::persist::{load_meta, read_shard, TableMeta, TablePaths};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Corpus-wide statistics keyed by expression. Built once, then only read.
#[derive(Debug, Default, Clone)]
pub struct FrequencyTable {
    elements: HashMap<String, MathElement>,
    total_docs: u64,
    total_occurrences: u64,
    meta: Option<TableMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthStats {
    pub depth: Depth,
    pub expressions: u64,
    pub total_frequency: u64,
    pub max_doc_frequency: u64,
}

impl FrequencyTable {
    pub fn new(total_docs: u64) -> Self {
        Self { total_docs, ..Self::default() }
    }

    pub fn from_elements<I>(elements: I, total_docs: u64) -> Self
    where
        I: IntoIterator<Item = MathElement>,
    {
        let mut table = Self::new(total_docs);
        for element in elements {
            table.insert(element);
        }
        table
    }

    /// Adds `element`, merging it into an existing entry. An entry with a
    /// different depth is kept as is and the incoming one dropped.
    pub fn insert(&mut self, element: MathElement) -> bool {
        let added = element.total_frequency;
        if let Some(existing) = self.elements.get_mut(&element.expression) {
            if let Err(e) = existing.merge(&element) {
                warn!(error = %e, "skipping record");
                return false;
            }
        } else {
            self.elements.insert(element.expression.clone(), element);
        }
        self.total_occurrences += added;
        true
    }

    /// Reads shard files in parallel.
    pub fn load<P>(shards: &[P], total_docs: u64) -> Result<Self>
    where
        P: AsRef<Path> + Sync,
    {
        let parts = shards
            .par_iter()
            .map(|path| -> Result<Vec<MathElement>> {
                let path = path.as_ref();
                let (elements, rejected) = read_shard(path)?;
                for (line, e) in &rejected {
                    warn!(shard = %path.display(), line, error = %e, "skipping bad record");
                }
                Ok(elements)
            })
            .collect::<Result<Vec<_>>>()?;

        let capacity = parts.iter().map(Vec::len).sum();
        let mut table = Self::new(total_docs);
        table.elements.reserve(capacity);
        for element in parts.into_iter().flatten() {
            table.insert(element);
        }
        info!(shards = shards.len(), expressions = table.len(), total_docs, "frequency table loaded");
        Ok(table)
    }

    /// Loads `meta.json` and every shard of a table directory.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let paths = TablePaths::new(dir);
        let meta = load_meta(&paths)?;
        let shards = paths.list_shards()?;
        let mut table = Self::load(&shards, meta.total_docs)?;
        table.meta = Some(meta);
        Ok(table)
    }

    /// Adds the statistics of `incoming` to `base`.
    pub fn merge(mut base: FrequencyTable, incoming: &FrequencyTable) -> FrequencyTable {
        let mut skipped = 0usize;
        for element in incoming.elements.values() {
            if !base.insert(element.clone()) {
                skipped += 1;
            }
        }
        base.total_docs += incoming.total_docs;
        base.meta = None;
        info!(expressions = base.len(), skipped, total_docs = base.total_docs, "tables merged");
        base
    }

    pub fn lookup(&self, expression: &str) -> Option<&MathElement> {
        self.elements.get(expression)
    }

    pub fn total_docs(&self) -> u64 {
        self.total_docs
    }

    pub fn total_occurrences(&self) -> u64 {
        self.total_occurrences
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MathElement> {
        self.elements.values()
    }

    pub fn meta(&self) -> Option<&TableMeta> {
        self.meta.as_ref()
    }

    /// Average number of expression occurrences per document.
    pub fn average_document_length(&self) -> f64 {
        if self.total_docs == 0 {
            0.0
        } else {
            self.total_occurrences as f64 / self.total_docs as f64
        }
    }

    pub fn top_by_total_frequency(&self, limit: usize, depth: Option<Depth>) -> Vec<&MathElement> {
        let mut selected: Vec<&MathElement> = self
            .elements
            .values()
            .filter(|e| depth.map_or(true, |d| e.depth == d))
            .collect();
        selected.sort_unstable_by(|a, b| {
            b.total_frequency
                .cmp(&a.total_frequency)
                .then_with(|| a.expression.cmp(&b.expression))
        });
        selected.truncate(limit);
        selected
    }

    pub fn depth_summary(&self) -> Vec<DepthStats> {
        let mut by_depth: BTreeMap<Depth, DepthStats> = BTreeMap::new();
        for e in self.elements.values() {
            let stats = by_depth.entry(e.depth).or_insert(DepthStats {
                depth: e.depth,
                expressions: 0,
                total_frequency: 0,
                max_doc_frequency: 0,
            });
            stats.expressions += 1;
            stats.total_frequency += e.total_frequency;
            stats.max_doc_frequency = stats.max_doc_frequency.max(e.doc_frequency);
        }
        by_depth.into_values().collect()
    }
}

/// Shared, atomically replaceable reference to the current table.
#[derive(Clone)]
pub struct TableHandle {
    inner: Arc<RwLock<Arc<FrequencyTable>>>,
}

impl TableHandle {
    pub fn new(table: FrequencyTable) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(table))) }
    }

    /// Snapshot that stays valid across later swaps.
    pub fn current(&self) -> Arc<FrequencyTable> {
        self.inner.read().clone()
    }

    /// Publishes `table` and returns the previous one.
    pub fn swap(&self, table: FrequencyTable) -> Arc<FrequencyTable> {
        let next = Arc::new(table);
        std::mem::replace(&mut *self.inner.write(), next)
    }
}
