use crossbeam_channel::{bounded, Receiver, Sender};
use mathcore::persist::format_shard_record;
use mathcore::{Error, MathElement};
use std::fs::{create_dir_all, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

pub enum ShardMessage {
    Element(MathElement),
    /// Sent once per writer after the last element.
    Done,
}

#[derive(Debug)]
pub struct ShardReport {
    pub index: usize,
    pub path: PathBuf,
    pub outcome: Result<u64, Error>,
}

/// Writer threads draining one shared queue, one shard file each.
pub struct ShardWriters {
    sender: Sender<ShardMessage>,
    handles: Vec<JoinHandle<ShardReport>>,
}

impl ShardWriters {
    pub fn spawn(paths: Vec<PathBuf>, queue_capacity: usize) -> Self {
        let (sender, receiver) = bounded(queue_capacity.max(1));
        let handles = paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| {
                let receiver = receiver.clone();
                thread::spawn(move || write_shard(index, path, receiver))
            })
            .collect();
        Self { sender, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn send(&self, element: MathElement) -> anyhow::Result<()> {
        self.sender
            .send(ShardMessage::Element(element))
            .map_err(|_| anyhow::anyhow!("all shard writers have stopped"))
    }

    /// Signals the end of the stream and waits for every writer.
    pub fn finish(self) -> Vec<ShardReport> {
        for _ in 0..self.handles.len() {
            if self.sender.send(ShardMessage::Done).is_err() {
                break;
            }
        }
        drop(self.sender);
        self.handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                handle.join().unwrap_or_else(|_| ShardReport {
                    index,
                    path: PathBuf::new(),
                    outcome: Err(Error::Io(io::Error::other("shard writer panicked"))),
                })
            })
            .collect()
    }
}

fn write_shard(index: usize, path: PathBuf, receiver: Receiver<ShardMessage>) -> ShardReport {
    let mut out = match open(&path) {
        Ok(out) => out,
        Err(e) => {
            warn!(shard = index, path = %path.display(), error = %e, "cannot open shard");
            return drain_after_failure(index, path, receiver, e);
        }
    };
    let mut written = 0u64;
    while let Ok(ShardMessage::Element(element)) = receiver.recv() {
        if let Err(e) = writeln!(out, "{}", format_shard_record(&element)) {
            warn!(shard = index, path = %path.display(), error = %e, "shard write failed");
            return drain_after_failure(index, path, receiver, e);
        }
        written += 1;
    }
    if let Err(e) = out.flush() {
        return ShardReport { index, outcome: Err(Error::persistence(&path, e)), path };
    }
    info!(shard = index, records = written, "shard written");
    ShardReport { index, path, outcome: Ok(written) }
}

fn open(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Keeps consuming until `Done` so the producer never blocks on a dead shard.
fn drain_after_failure(index: usize, path: PathBuf, receiver: Receiver<ShardMessage>, error: io::Error) -> ShardReport {
    let mut dropped = 0u64;
    while let Ok(ShardMessage::Element(_)) = receiver.recv() {
        dropped += 1;
    }
    warn!(shard = index, dropped, "records lost with failed shard");
    ShardReport { index, outcome: Err(Error::persistence(&path, error)), path }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mathcore::persist::read_shard;
    use tempfile::tempdir;

    #[test]
    fn writers_stop_on_done_and_keep_every_record() {
        let dir = tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("shard-{i:04}.csv"))).collect();
        let writers = ShardWriters::spawn(paths.clone(), 4);
        for i in 0..100 {
            writers.send(MathElement::new(format!("mn:{i}"), 1, 2, 1)).unwrap();
        }
        let reports = writers.finish();
        assert_eq!(reports.len(), 3);
        let written: u64 = reports.iter().map(|r| *r.outcome.as_ref().unwrap()).sum();
        assert_eq!(written, 100);

        let read: usize = paths.iter().map(|p| read_shard(p).unwrap().0.len()).sum();
        assert_eq!(read, 100);
    }

    #[test]
    fn failing_shard_does_not_stop_others() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "a file, not a directory").unwrap();
        let paths = vec![blocker.join("shard-0000.csv"), dir.path().join("shard-0001.csv")];
        let writers = ShardWriters::spawn(paths, 2);
        for i in 0..50 {
            writers.send(MathElement::new(format!("mn:{i}"), 1, 1, 1)).unwrap();
        }
        let reports = writers.finish();
        assert!(matches!(reports[0].outcome, Err(Error::Persistence { .. })));
        assert!(reports[1].outcome.is_ok());
    }
}
