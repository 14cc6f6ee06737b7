//! Corpus-wide frequency aggregation: discovery, extraction, reduction and
//! shard output, plus table maintenance (merge, statistics).

pub mod aggregate;
pub mod corpus;
pub mod progress;
pub mod tables;
pub mod writer;

pub use aggregate::{AggregationSummary, AggregatorConfig, CorpusAggregator};
pub use corpus::{Corpus, WorkItem};
