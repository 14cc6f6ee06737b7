use crate::element::{Depth, Document, ScoredElement};
use crate::error::{Error, Result};
use crate::table::FrequencyTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TermFrequency {
    Binary,
    Raw,
    /// `r / t`, `t` being all occurrences in the document.
    Relative,
    Log,
    /// `0.5 + 0.5 r / t`, `t` being the highest frequency in the document.
    Norm,
    /// Depth-bucketed BM25; `t` is the highest frequency at the same depth.
    Bm25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InverseDocumentFrequency {
    Binary,
    Idf,
    PropIdf,
    Bm25Idf,
}

impl InverseDocumentFrequency {
    pub fn calculate(self, doc_frequency: u64, total_docs: u64) -> f64 {
        let (df, n) = (doc_frequency as f64, total_docs as f64);
        let value = match self {
            InverseDocumentFrequency::Binary => return if doc_frequency > 0 { 1.0 } else { 0.0 },
            InverseDocumentFrequency::Idf => (n / df).ln(),
            InverseDocumentFrequency::PropIdf => ((n - df) / df).ln(),
            InverseDocumentFrequency::Bm25Idf => (1.0 + (n - df + 0.5) / (df + 0.5)).ln(),
        };
        finite_or_zero(value)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

impl fmt::Display for TermFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TermFrequency::Binary => "BINARY",
            TermFrequency::Raw => "RAW",
            TermFrequency::Relative => "RELATIVE",
            TermFrequency::Log => "LOG",
            TermFrequency::Norm => "NORM",
            TermFrequency::Bm25 => "BM25",
        })
    }
}

impl FromStr for TermFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BINARY" => Ok(TermFrequency::Binary),
            "RAW" => Ok(TermFrequency::Raw),
            "RELATIVE" => Ok(TermFrequency::Relative),
            "LOG" => Ok(TermFrequency::Log),
            "NORM" => Ok(TermFrequency::Norm),
            "BM25" => Ok(TermFrequency::Bm25),
            _ => Err(Error::Configuration(format!("unknown term frequency {s:?}"))),
        }
    }
}

impl fmt::Display for InverseDocumentFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InverseDocumentFrequency::Binary => "BINARY",
            InverseDocumentFrequency::Idf => "IDF",
            InverseDocumentFrequency::PropIdf => "PROP_IDF",
            InverseDocumentFrequency::Bm25Idf => "BM25_IDF",
        })
    }
}

impl FromStr for InverseDocumentFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "BINARY" => Ok(InverseDocumentFrequency::Binary),
            "IDF" => Ok(InverseDocumentFrequency::Idf),
            "PROP_IDF" | "PROPIDF" => Ok(InverseDocumentFrequency::PropIdf),
            "BM25_IDF" | "BM25IDF" => Ok(InverseDocumentFrequency::Bm25Idf),
            _ => Err(Error::Configuration(format!("unknown inverse document frequency {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightingConfig {
    pub tf: TermFrequency,
    pub idf: InverseDocumentFrequency,
    pub k1: f64,
    pub b: f64,
    /// Multiply the BM25 term frequency by the IDF of the raw count within
    /// the document.
    pub local_idf: bool,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self { tf: TermFrequency::Relative, idf: InverseDocumentFrequency::Idf, k1: 1.2, b: 0.95, local_idf: true }
    }
}

impl WeightingConfig {
    pub fn new(tf: TermFrequency, idf: InverseDocumentFrequency) -> Self {
        Self { tf, idf, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.k1.is_finite() || self.k1 < 0.0 {
            return Err(Error::Configuration(format!("k1 must be a non-negative number, got {}", self.k1)));
        }
        if !(0.0..=1.0).contains(&self.b) {
            return Err(Error::Configuration(format!("b must be within [0, 1], got {}", self.b)));
        }
        Ok(())
    }

    /// Term frequency of a raw count `raw` against `normalizer`. Zero
    /// normalizers yield 0.
    pub fn term_frequency(&self, raw: u64, normalizer: u64, average_length: f64) -> f64 {
        let (r, t) = (raw as f64, normalizer as f64);
        let value = match self.tf {
            TermFrequency::Binary => return if raw > 0 { 1.0 } else { 0.0 },
            TermFrequency::Raw => r,
            TermFrequency::Log => (1.0 + r).ln(),
            TermFrequency::Relative if normalizer == 0 => 0.0,
            TermFrequency::Relative => r / t,
            TermFrequency::Norm if normalizer == 0 => 0.0,
            TermFrequency::Norm => 0.5 + 0.5 * (r / t),
            TermFrequency::Bm25 if average_length <= 0.0 => 0.0,
            TermFrequency::Bm25 => {
                r * (self.k1 + 1.0) / (r + self.k1 * (1.0 - self.b + self.b * (t / average_length)))
            }
        };
        finite_or_zero(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBounds {
    pub min_doc_freq: u64,
    pub max_doc_freq: u64,
    pub min_depth: Depth,
}

impl Default for ScoreBounds {
    fn default() -> Self {
        Self { min_doc_freq: 1, max_doc_freq: u64::MAX, min_depth: 1 }
    }
}

/// Turns one extracted document into per-expression scores.
#[derive(Debug, Clone, Copy)]
pub struct ScoringEngine {
    weighting: WeightingConfig,
    bounds: ScoreBounds,
}

impl ScoringEngine {
    pub fn new(weighting: WeightingConfig, bounds: ScoreBounds) -> Result<Self> {
        weighting.validate()?;
        if bounds.min_doc_freq > bounds.max_doc_freq {
            return Err(Error::Configuration(format!(
                "min doc frequency {} exceeds max doc frequency {}",
                bounds.min_doc_freq, bounds.max_doc_freq
            )));
        }
        Ok(Self { weighting, bounds })
    }

    pub fn weighting(&self) -> &WeightingConfig {
        &self.weighting
    }

    pub fn bounds(&self) -> &ScoreBounds {
        &self.bounds
    }

    /// Scores every expression of `document` that the table knows and whose
    /// corpus document frequency lies within the bounds (inclusive).
    pub fn score(&self, document: &Document, table: &FrequencyTable, total_docs: u64) -> HashMap<String, ScoredElement> {
        let local: Vec<(&str, Depth, u64)> = document
            .grouped()
            .into_iter()
            .filter(|(_, (depth, _))| *depth >= self.bounds.min_depth)
            .map(|(expression, (depth, count))| (expression, depth, count))
            .collect();
        if local.is_empty() {
            return HashMap::new();
        }

        let document_length = document.length();
        let normalizer = match self.weighting.tf {
            TermFrequency::Norm => local.iter().map(|(_, _, c)| *c).max().unwrap_or(0),
            _ => local.iter().map(|(_, _, c)| *c).sum(),
        };
        let mut max_per_depth: HashMap<Depth, u64> = HashMap::new();
        for (_, depth, count) in &local {
            let slot = max_per_depth.entry(*depth).or_insert(0);
            *slot = (*slot).max(*count);
        }
        let average_length = if total_docs == 0 { 0.0 } else { table.total_occurrences() as f64 / total_docs as f64 };

        let mut scored = HashMap::with_capacity(local.len());
        for (expression, depth, count) in local {
            let Some(reference) = table.lookup(expression) else { continue };
            if reference.doc_frequency < self.bounds.min_doc_freq || reference.doc_frequency > self.bounds.max_doc_freq {
                continue;
            }
            let tf = match self.weighting.tf {
                TermFrequency::Bm25 => {
                    let depth_max = max_per_depth.get(&depth).copied().unwrap_or(count);
                    let mut tf = self.weighting.term_frequency(count, depth_max, average_length);
                    if self.weighting.local_idf {
                        tf *= self.weighting.idf.calculate(count, document_length);
                    }
                    tf
                }
                _ => self.weighting.term_frequency(count, normalizer, average_length),
            };
            let idf = self.weighting.idf.calculate(reference.doc_frequency, total_docs);
            let score = finite_or_zero(tf * idf);
            scored.insert(expression.to_string(), ScoredElement::new(expression, depth, score, count));
        }
        scored
    }
}
