use crate::element::{Depth, Document, MathElement, Triple};
use crate::error::{Error, ParseError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, create_dir_all, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;
pub const ARTIFACT_DELIMITER: &str = " #-<>-# ";
const SHARD_EXTENSION: &str = "csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Documents seen while building, including empty and failed ones.
    pub total_docs: u64,
    pub empty_docs: u64,
    pub failed_docs: u64,
    pub num_expressions: u64,
    pub num_shards: u32,
    pub min_term_frequency: u32,
    pub created_at: String,
    pub version: u32,
}

/// Layout of a frequency table directory.
pub struct TablePaths {
    pub root: PathBuf,
}

impl TablePaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn meta(&self) -> PathBuf { self.root.join("meta.json") }
    pub fn shard(&self, index: usize) -> PathBuf { self.root.join(format!("shard-{index:04}.{SHARD_EXTENSION}")) }

    /// Shard files present in the directory, in name order.
    pub fn list_shards(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::persistence(&self.root, e))?;
        let mut shards = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::persistence(&self.root, e))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == SHARD_EXTENSION) {
                shards.push(path);
            }
        }
        shards.sort();
        Ok(shards)
    }
}

/// Location of per-document extraction artifacts: `<root>/<collection>/<document_id>`.
pub struct ArtifactPaths {
    pub root: PathBuf,
}

impl ArtifactPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn document(&self, collection: &str, document_id: &str) -> PathBuf {
        self.root.join(collection).join(document_id)
    }

    pub fn exists(&self, collection: &str, document_id: &str) -> bool {
        self.document(collection, document_id).is_file()
    }
}

pub fn format_shard_record(element: &MathElement) -> String {
    format!(
        "\"{}\";{};{};{}",
        element.expression.replace('"', "\"\""),
        element.depth,
        element.total_frequency,
        element.doc_frequency
    )
}

/// Splits a shard record on the `;` separators outside the quoted expression.
fn split_record(line: &str) -> std::result::Result<(String, &str), ParseError> {
    let Some(body) = line.strip_prefix('"') else {
        // unquoted expression: the three numeric fields are the last ones
        return match line.rsplitn(4, ';').nth(3) {
            Some(expr) => Ok((expr.to_string(), &line[expr.len() + 1..])),
            None => Err(ParseError::record(format!("expected 4 fields in {line:?}"))),
        };
    };

    let mut expression = String::with_capacity(body.len());
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '"' {
            expression.push(c);
            continue;
        }
        if matches!(chars.peek(), Some((_, '"'))) {
            chars.next();
            expression.push('"');
            continue;
        }
        let rest = &body[i + 1..];
        return match rest.strip_prefix(';') {
            Some(fields) => Ok((expression, fields)),
            None => Err(ParseError::record(format!("expected ';' after quoted expression in {line:?}"))),
        };
    }
    Err(ParseError::record(format!("unterminated quote in {line:?}")))
}

pub fn parse_shard_record(line: &str) -> std::result::Result<MathElement, ParseError> {
    let (expression, fields) = split_record(line.trim_end())?;
    if expression.is_empty() {
        return Err(ParseError::record("empty expression"));
    }
    let fields: Vec<&str> = fields.split(';').collect();
    let [depth, tf, df] = fields.as_slice() else {
        return Err(ParseError::record(format!("expected 4 fields in {line:?}")));
    };
    let depth: Depth = parse_field(depth, "depth")?;
    let total_frequency: u64 = parse_field(tf, "total frequency")?;
    let doc_frequency: u64 = parse_field(df, "doc frequency")?;
    if doc_frequency > total_frequency {
        return Err(ParseError::record(format!(
            "doc frequency {doc_frequency} exceeds total frequency {total_frequency} for {expression}"
        )));
    }
    Ok(MathElement { expression, depth, total_frequency, doc_frequency })
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> std::result::Result<T, ParseError> {
    raw.trim()
        .parse()
        .map_err(|_| ParseError::record(format!("invalid {name}: {raw:?}")))
}

/// Writes one shard file, one record per line.
pub fn write_shard<'a, I>(path: &Path, elements: I) -> Result<u64>
where
    I: IntoIterator<Item = &'a MathElement>,
{
    let wrap = |e: io::Error| Error::persistence(path, e);
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(wrap)?;
    }
    let mut out = BufWriter::new(File::create(path).map_err(wrap)?);
    let mut written = 0;
    for element in elements {
        writeln!(out, "{}", format_shard_record(element)).map_err(wrap)?;
        written += 1;
    }
    out.flush().map_err(wrap)?;
    Ok(written)
}

/// Reads a shard file. Malformed records are returned separately so the
/// caller can report them.
pub fn read_shard(path: &Path) -> Result<(Vec<MathElement>, Vec<(usize, ParseError)>)> {
    let file = File::open(path).map_err(|e| Error::persistence(path, e))?;
    let mut elements = Vec::new();
    let mut rejected = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::persistence(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_shard_record(&line) {
            Ok(element) => elements.push(element),
            Err(e) => rejected.push((number + 1, e)),
        }
    }
    Ok((elements, rejected))
}

pub fn parse_artifact_line(line: &str) -> std::result::Result<Triple, ParseError> {
    let mut parts = line.trim_end().rsplitn(3, ARTIFACT_DELIMITER);
    let (Some(tf), Some(depth), Some(expression)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ParseError::record(format!("expected 3 fields in artifact line {line:?}")));
    };
    if expression.is_empty() {
        return Err(ParseError::record("empty expression"));
    }
    Ok(Triple {
        expression: expression.to_string(),
        depth: parse_field(depth, "depth")?,
        term_frequency: parse_field(tf, "term frequency")?,
    })
}

/// Writes the triples of `document`. The file appears under its final name
/// only once it is complete, so a half-written artifact is never resumed from.
pub fn write_artifact(paths: &ArtifactPaths, document: &Document) -> Result<PathBuf> {
    let path = paths.document(&document.collection, &document.document_id);
    let partial = path.with_file_name(format!("{}.partial", document.document_id));
    let wrap = |e: io::Error| Error::persistence(&path, e);
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(wrap)?;
    }
    let mut out = BufWriter::new(File::create(&partial).map_err(wrap)?);
    for t in &document.triples {
        writeln!(out, "{}{ARTIFACT_DELIMITER}{}{ARTIFACT_DELIMITER}{}", t.expression, t.depth, t.term_frequency)
            .map_err(wrap)?;
    }
    out.flush().map_err(wrap)?;
    drop(out);
    fs::rename(&partial, &path).map_err(wrap)?;
    Ok(path)
}

pub fn read_artifact(paths: &ArtifactPaths, collection: &str, document_id: &str) -> Result<Document> {
    let path = paths.document(collection, document_id);
    let file = File::open(&path).map_err(|e| Error::persistence(&path, e))?;
    let mut document = Document::new(collection, document_id);
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::persistence(&path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let triple = parse_artifact_line(&line).map_err(|e| ParseError::Record {
            reason: format!("{}:{}: {e}", path.display(), number + 1),
        })?;
        document.push(triple);
    }
    Ok(document)
}

pub fn save_meta(paths: &TablePaths, meta: &TableMeta) -> Result<()> {
    let path = paths.meta();
    create_dir_all(&paths.root).map_err(|e| Error::persistence(&paths.root, e))?;
    let json = serde_json::to_string_pretty(meta).map_err(|e| Error::persistence(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    fs::write(&path, json).map_err(|e| Error::persistence(&path, e))?;
    Ok(())
}

pub fn load_meta(paths: &TablePaths) -> Result<TableMeta> {
    let path = paths.meta();
    let buf = fs::read_to_string(&path).map_err(|e| Error::persistence(&path, e))?;
    let meta: TableMeta = serde_json::from_str(&buf)
        .map_err(|e| Error::persistence(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn shard_record_with_embedded_semicolons_and_quotes() {
        let e = MathElement::new("mrow(mi:a,mo:;,mo:\",mi:b)", 2, 10, 4);
        let line = format_shard_record(&e);
        assert_eq!(line, "\"mrow(mi:a,mo:;,mo:\"\",mi:b)\";2;10;4");
        assert_eq!(parse_shard_record(&line).unwrap(), e);
    }

    #[test]
    fn unquoted_expression_is_read() {
        let e = parse_shard_record("mi:x;1;2;1").unwrap();
        assert_eq!((e.expression.as_str(), e.total_frequency), ("mi:x", 2));
    }

    #[test]
    fn bad_records_are_rejected() {
        for line in ["\"mi:x\";1;2", "\"mi:x;1;2;1", "\"mi:x\";one;2;1", "\"mi:x\";1;2;5", "\"\";1;1;1", "\"mi:x\"1;2;1"] {
            assert!(parse_shard_record(line).is_err(), "{line}");
        }
    }

    #[test]
    fn shard_file_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard-0000.csv");
        fs::write(&path, "\"mi:x\";1;5;2\ngarbage\n\n\"mi:y\";1;1;1\n").unwrap();
        let (elements, rejected) = read_shard(&path).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, 2);
    }

    #[test]
    fn artifact_round_trip() {
        let dir = tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        let mut doc = Document::new("arxiv", "2103.04567");
        doc.push(Triple::new("mrow(mi:a,mo:+,mi:b)", 2, 3));
        doc.push(Triple::new("mi:a", 1, 5));
        let path = write_artifact(&paths, &doc).unwrap();
        assert_eq!(path, dir.path().join("arxiv").join("2103.04567"));
        assert!(paths.exists("arxiv", "2103.04567"));
        assert_eq!(read_artifact(&paths, "arxiv", "2103.04567").unwrap(), doc);
    }

    #[test]
    fn meta_round_trip_and_shard_listing() {
        let dir = tempdir().unwrap();
        let paths = TablePaths::new(dir.path());
        let meta = TableMeta {
            total_docs: 3,
            empty_docs: 1,
            failed_docs: 0,
            num_expressions: 2,
            num_shards: 2,
            min_term_frequency: 1,
            created_at: "2024-01-01T00:00:00Z".into(),
            version: FORMAT_VERSION,
        };
        save_meta(&paths, &meta).unwrap();
        assert_eq!(load_meta(&paths).unwrap(), meta);

        write_shard(&paths.shard(1), &[MathElement::new("mi:y", 1, 1, 1)]).unwrap();
        write_shard(&paths.shard(0), &[MathElement::new("mi:x", 1, 1, 1)]).unwrap();
        let shards = paths.list_shards().unwrap();
        assert_eq!(shards, vec![paths.shard(0), paths.shard(1)]);
    }
}
