use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub collection: String,
    pub document_id: String,
}

impl WorkItem {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self { collection: collection.into(), document_id: document_id.into() }
    }
}

/// Document ids per collection, both in name order.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    collections: BTreeMap<String, Vec<String>>,
}

impl Corpus {
    /// Every sub-directory of `dataset` is a collection and every regular
    /// file inside it a document, identified by its file stem.
    pub fn discover(dataset: &Path) -> Result<Self> {
        Self::walk(dataset, false)
    }

    /// Same layout as [`discover`](Self::discover), but artifact file names
    /// are the document ids themselves.
    pub fn discover_artifacts(artifacts: &Path) -> Result<Self> {
        Self::walk(artifacts, true)
    }

    fn walk(dataset: &Path, full_names: bool) -> Result<Self> {
        if !dataset.is_dir() {
            bail!("dataset directory {} does not exist", dataset.display());
        }
        let mut corpus = Corpus::default();
        for entry in WalkDir::new(dataset).min_depth(1).max_depth(2).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", dataset.display()))?;
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if entry.depth() == 1 && entry.file_type().is_dir() {
                corpus.collections.entry(name.into_owned()).or_default();
            } else if entry.depth() == 2 && entry.file_type().is_file() {
                let collection = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if full_names {
                    if !name.ends_with(".partial") {
                        corpus.add(collection, name.into_owned());
                    }
                    continue;
                }
                let Some(stem) = entry.path().file_stem() else { continue };
                corpus.add(collection, stem.to_string_lossy());
            }
        }
        for ids in corpus.collections.values_mut() {
            ids.sort();
            ids.dedup();
        }
        tracing::info!(collections = corpus.collections.len(), documents = corpus.len(), "corpus discovered");
        Ok(corpus)
    }

    pub fn add(&mut self, collection: impl Into<String>, document_id: impl Into<String>) {
        self.collections.entry(collection.into()).or_default().push(document_id.into());
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn documents(&self, collection: &str) -> &[String] {
        self.collections.get(collection).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes one document from each collection in turn until all are used up.
    pub fn interleave(&self) -> Vec<WorkItem> {
        let mut queues: Vec<(&String, std::slice::Iter<'_, String>)> =
            self.collections.iter().map(|(c, ids)| (c, ids.iter())).collect();
        let mut work = Vec::with_capacity(self.len());
        loop {
            let before = work.len();
            for (collection, ids) in queues.iter_mut() {
                if let Some(id) = ids.next() {
                    work.push(WorkItem::new(collection.as_str(), id.as_str()));
                }
            }
            if work.len() == before {
                return work;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn round_robin_order() {
        let mut corpus = Corpus::default();
        for id in ["a1", "a2", "a3"] {
            corpus.add("a", id);
        }
        corpus.add("b", "b1");
        for id in ["c1", "c2"] {
            corpus.add("c", id);
        }
        let order: Vec<String> = corpus.interleave().into_iter().map(|w| w.document_id).collect();
        assert_eq!(order, vec!["a1", "b1", "c1", "a2", "c2", "a3"]);
    }

    #[test]
    fn discovers_collections_and_stems() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("arxiv")).unwrap();
        fs::create_dir_all(dir.path().join("zbmath")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("arxiv").join("2103.00001.xml"), "").unwrap();
        fs::write(dir.path().join("arxiv").join("2103.00002.xml"), "").unwrap();
        fs::write(dir.path().join("zbmath").join("7001.xml"), "").unwrap();
        fs::write(dir.path().join("zbmath").join(".hidden"), "").unwrap();

        let corpus = Corpus::discover(dir.path()).unwrap();
        assert_eq!(corpus.collections().collect::<Vec<_>>(), vec!["arxiv", "empty", "zbmath"]);
        assert_eq!(corpus.documents("arxiv"), ["2103.00001", "2103.00002"]);
        assert_eq!(corpus.len(), 3);
        assert!(Corpus::discover(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn artifact_ids_keep_dots() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("arxiv")).unwrap();
        fs::write(dir.path().join("arxiv").join("2103.00001"), "").unwrap();
        fs::write(dir.path().join("arxiv").join("2103.00002.partial"), "").unwrap();
        let corpus = Corpus::discover_artifacts(dir.path()).unwrap();
        assert_eq!(corpus.documents("arxiv"), ["2103.00001"]);
    }
}
