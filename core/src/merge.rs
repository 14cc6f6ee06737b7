use crate::element::ScoredElement;
use crate::error::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeFunction {
    #[default]
    Max,
    Sum,
    Avg,
}

impl MergeFunction {
    pub fn apply(self, scores: &[f64]) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        match self {
            MergeFunction::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            MergeFunction::Sum => scores.iter().sum(),
            MergeFunction::Avg => scores.iter().sum::<f64>() / scores.len() as f64,
        }
    }
}

impl fmt::Display for MergeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeFunction::Max => "MAX",
            MergeFunction::Sum => "SUM",
            MergeFunction::Avg => "AVG",
        })
    }
}

impl FromStr for MergeFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MAX" => Ok(MergeFunction::Max),
            "SUM" => Ok(MergeFunction::Sum),
            "AVG" | "MEAN" => Ok(MergeFunction::Avg),
            _ => Err(Error::Configuration(format!("unknown merge function {s:?}"))),
        }
    }
}

/// Groups per-document scores by expression.
pub fn collect<I>(per_document: I) -> HashMap<String, Vec<ScoredElement>>
where
    I: IntoIterator<Item = HashMap<String, ScoredElement>>,
{
    let mut grouped: HashMap<String, Vec<ScoredElement>> = HashMap::new();
    for scores in per_document {
        for (expression, element) in scores {
            grouped.entry(expression).or_default().push(element);
        }
    }
    grouped
}

/// Reduces each expression's contributions to one ranked entry. Expressions
/// with fewer than `min_hit_frequency` contributing documents are dropped.
/// Sorted by score descending, then by expression.
pub fn merge(
    grouped: HashMap<String, Vec<ScoredElement>>,
    function: MergeFunction,
    min_hit_frequency: usize,
) -> Vec<ScoredElement> {
    let mut ranked: Vec<ScoredElement> = grouped
        .into_par_iter()
        .filter(|(_, contributions)| !contributions.is_empty() && contributions.len() >= min_hit_frequency)
        .map(|(expression, contributions)| {
            let scores: Vec<f64> = contributions.iter().map(|c| c.score).collect();
            ScoredElement {
                depth: contributions[0].depth,
                score: function.apply(&scores),
                total_frequency: contributions.iter().map(|c| c.total_frequency).sum(),
                doc_frequency: contributions.len() as u64,
                expression,
            }
        })
        .collect();
    ranked.par_sort_unstable_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.expression.cmp(&b.expression)));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(entries: &[(&str, f64, u64)]) -> HashMap<String, ScoredElement> {
        entries
            .iter()
            .map(|(e, score, tf)| (e.to_string(), ScoredElement::new(*e, 1, *score, *tf)))
            .collect()
    }

    fn grouped() -> HashMap<String, Vec<ScoredElement>> {
        collect(vec![
            hits(&[("a", 0.5, 2), ("b", 0.9, 1)]),
            hits(&[("a", 0.7, 1), ("c", 0.2, 4)]),
            hits(&[("a", 0.1, 3), ("b", 0.3, 1)]),
        ])
    }

    #[test]
    fn min_hit_frequency_boundary() {
        let names = |v: Vec<ScoredElement>| v.into_iter().map(|e| e.expression).collect::<Vec<_>>();
        assert_eq!(names(merge(grouped(), MergeFunction::Max, 2)), vec!["b", "a"]);
        assert_eq!(names(merge(grouped(), MergeFunction::Max, 3)), vec!["a"]);
        assert!(merge(grouped(), MergeFunction::Max, 4).is_empty());
    }

    #[test]
    fn merged_frequencies_and_functions() {
        let merged = merge(grouped(), MergeFunction::Sum, 1);
        let a = merged.iter().find(|e| e.expression == "a").unwrap();
        assert!((a.score - 1.3).abs() < 1e-12);
        assert_eq!((a.total_frequency, a.doc_frequency), (6, 3));

        let avg = merge(grouped(), MergeFunction::Avg, 1);
        let b = avg.iter().find(|e| e.expression == "b").unwrap();
        assert!((b.score - 0.6).abs() < 1e-12);
        assert_eq!(MergeFunction::Max.apply(&[0.2, 0.9, 0.4]), 0.9);
    }

    #[test]
    fn ties_are_ordered_by_expression() {
        let merged = merge(collect(vec![hits(&[("z", 1.0, 1), ("m", 1.0, 1), ("q", 2.0, 1)])]), MergeFunction::Max, 1);
        let order: Vec<&str> = merged.iter().map(|e| e.expression.as_str()).collect();
        assert_eq!(order, vec!["q", "m", "z"]);
    }
}
