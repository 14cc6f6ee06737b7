//! Frequency statistics, scoring and ranking of mathematical expressions.
//!
//! Expressions are identified by their linear notation (see [`notation`]).
//! Extraction goes through pooled element-store clients, corpus statistics
//! live in a [`FrequencyTable`], and query-time results are produced by
//! [`ScoringEngine`] followed by [`merge::merge`].

pub mod element;
pub mod error;
pub mod extract;
pub mod merge;
pub mod notation;
pub mod persist;
pub mod pool;
pub mod scoring;
pub mod store;
pub mod table;

pub use element::{Depth, Document, MathElement, ScoredElement, Triple};
pub use error::{Error, ParseError, Result};
pub use extract::{ExtractionOutcome, FrequencyExtractor};
pub use merge::MergeFunction;
pub use notation::MathNode;
pub use pool::{ElementStorePool, PooledClient};
pub use scoring::{InverseDocumentFrequency, ScoreBounds, ScoringEngine, TermFrequency, WeightingConfig};
pub use store::{ElementStore, ExtractionQuery, ExtractionScope, HttpElementStore, MemoryElementStore};
pub use table::{FrequencyTable, TableHandle};
