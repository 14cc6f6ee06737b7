use crate::aggregate::ShardSummary;
use crate::progress;
use crate::writer::ShardWriters;
use anyhow::{Context, Result};
use mathcore::notation::notation_to_markup;
use mathcore::persist::{save_meta, TableMeta, TablePaths, FORMAT_VERSION};
use mathcore::table::DepthStats;
use mathcore::{Depth, FrequencyTable, MathElement};
use serde::Serialize;
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| "".into())
}

#[derive(Debug, Clone)]
pub struct TableWriteOptions {
    pub shards: usize,
    pub queue_capacity: usize,
    pub show_progress: bool,
}

/// Writes `elements` as shard files plus `meta.json`, replacing any shards
/// already in `output`. A failed shard is reported, not fatal.
pub fn write_table<I>(elements: I, count: u64, output: &Path, meta: &TableMeta, options: &TableWriteOptions) -> Result<Vec<ShardSummary>>
where
    I: Iterator<Item = MathElement>,
{
    fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
    let paths = TablePaths::new(output);
    for stale in paths.list_shards()? {
        fs::remove_file(&stale).with_context(|| format!("removing {}", stale.display()))?;
    }

    let writers = ShardWriters::spawn((0..options.shards).map(|i| paths.shard(i)).collect(), options.queue_capacity);
    let pb = progress::bar(count, "Writing", options.show_progress);
    for element in elements {
        writers.send(element)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let mut summaries = Vec::with_capacity(options.shards);
    for report in writers.finish() {
        match report.outcome {
            Ok(records) => summaries.push(ShardSummary { path: report.path, records, error: None }),
            Err(e) => {
                warn!(shard = report.index, error = %e, "shard incomplete");
                summaries.push(ShardSummary { path: report.path, records: 0, error: Some(e.to_string()) });
            }
        }
    }
    save_meta(&paths, meta)?;
    Ok(summaries)
}

/// Adds the table in `incoming` to the one in `base` and writes the result to `output`.
pub fn merge_tables(base: &Path, incoming: &Path, output: &Path, options: &TableWriteOptions) -> Result<TableMeta> {
    let base_table = FrequencyTable::load_dir(base).with_context(|| format!("loading base table {}", base.display()))?;
    let incoming_table =
        FrequencyTable::load_dir(incoming).with_context(|| format!("loading incoming table {}", incoming.display()))?;
    let (base_meta, incoming_meta) = (base_table.meta().cloned(), incoming_table.meta().cloned());

    let merged = FrequencyTable::merge(base_table, &incoming_table);
    let sum = |f: fn(&TableMeta) -> u64| base_meta.as_ref().map_or(0, f) + incoming_meta.as_ref().map_or(0, f);
    let meta = TableMeta {
        total_docs: merged.total_docs(),
        empty_docs: sum(|m| m.empty_docs),
        failed_docs: sum(|m| m.failed_docs),
        num_expressions: merged.len() as u64,
        num_shards: options.shards as u32,
        min_term_frequency: base_meta.as_ref().map_or(1, |m| m.min_term_frequency),
        created_at: now_rfc3339(),
        version: FORMAT_VERSION,
    };
    let count = merged.len() as u64;
    write_table(merged.iter().cloned(), count, output, &meta, options)?;
    info!(output = %output.display(), expressions = meta.num_expressions, total_docs = meta.total_docs, "merged table written");
    Ok(meta)
}

#[derive(Debug, Clone, Serialize)]
pub struct TopEntry {
    pub expression: String,
    pub depth: Depth,
    pub total_frequency: u64,
    pub doc_frequency: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markup: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_docs: u64,
    pub expressions: u64,
    pub total_occurrences: u64,
    pub depths: Vec<DepthStats>,
    pub top: Vec<TopEntry>,
}

/// Depth summary plus the most frequent expressions.
pub fn stats(table: &FrequencyTable, limit: usize, depth: Option<Depth>, with_markup: bool) -> StatsReport {
    let top = table
        .top_by_total_frequency(limit, depth)
        .into_iter()
        .map(|e| TopEntry {
            expression: e.expression.clone(),
            depth: e.depth,
            total_frequency: e.total_frequency,
            doc_frequency: e.doc_frequency,
            markup: if with_markup { notation_to_markup(&e.expression).ok() } else { None },
        })
        .collect();
    StatsReport {
        total_docs: table.total_docs(),
        expressions: table.len() as u64,
        total_occurrences: table.total_occurrences(),
        depths: table.depth_summary(),
        top,
    }
}
