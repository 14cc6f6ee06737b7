use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Depth = u16;

/// Corpus statistics of one expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MathElement {
    pub expression: String,
    pub depth: Depth,
    /// Occurrences summed over all contributing documents.
    pub total_frequency: u64,
    /// Number of contributing documents.
    pub doc_frequency: u64,
}

impl MathElement {
    pub fn new(expression: impl Into<String>, depth: Depth, total_frequency: u64, doc_frequency: u64) -> Self {
        Self { expression: expression.into(), depth, total_frequency, doc_frequency }
    }

    /// Adds the frequencies of `other`. Fails without touching `self` if the
    /// depths disagree.
    pub fn merge(&mut self, other: &MathElement) -> Result<()> {
        if self.depth != other.depth {
            return Err(Error::InconsistentDepth {
                expression: self.expression.clone(),
                left: self.depth,
                right: other.depth,
            });
        }
        self.total_frequency += other.total_frequency;
        self.doc_frequency += other.doc_frequency;
        Ok(())
    }

    /// Adds the frequencies of `other` and keeps the smaller of the two depths.
    pub fn merge_min_depth(&mut self, other: &MathElement) {
        self.depth = self.depth.min(other.depth);
        self.total_frequency += other.total_frequency;
        self.doc_frequency += other.doc_frequency;
    }
}

/// One `(expression, depth, termFrequency)` row of an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub expression: String,
    pub depth: Depth,
    pub term_frequency: u32,
}

impl Triple {
    pub fn new(expression: impl Into<String>, depth: Depth, term_frequency: u32) -> Self {
        Self { expression: expression.into(), depth, term_frequency }
    }
}

/// Extraction result for one source document (or one collection when the
/// whole collection is extracted at once).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub document_id: String,
    pub triples: Vec<Triple>,
}

impl Document {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self { collection: collection.into(), document_id: document_id.into(), triples: Vec::new() }
    }

    pub fn push(&mut self, triple: Triple) {
        self.triples.push(triple);
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Sum of all term frequencies.
    pub fn length(&self) -> u64 {
        self.triples.iter().map(|t| t.term_frequency as u64).sum()
    }

    /// Groups repeated expressions, summing their term frequencies. The
    /// smallest depth seen for an expression is kept.
    pub fn grouped(&self) -> HashMap<&str, (Depth, u64)> {
        let mut grouped: HashMap<&str, (Depth, u64)> = HashMap::with_capacity(self.triples.len());
        for t in &self.triples {
            let entry = grouped.entry(t.expression.as_str()).or_insert((t.depth, 0));
            entry.0 = entry.0.min(t.depth);
            entry.1 += t.term_frequency as u64;
        }
        grouped
    }
}

/// An expression with a computed score and the frequencies seen by the
/// documents that contributed to that score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredElement {
    pub expression: String,
    pub depth: Depth,
    pub score: f64,
    pub total_frequency: u64,
    pub doc_frequency: u64,
}

impl ScoredElement {
    pub fn new(expression: impl Into<String>, depth: Depth, score: f64, total_frequency: u64) -> Self {
        Self { expression: expression.into(), depth, score, total_frequency, doc_frequency: 1 }
    }
}
