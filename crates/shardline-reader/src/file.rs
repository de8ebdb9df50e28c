//! File-backed partitioned log.
//!
//! Layout: `<root>/<stream>/<partition>.jsonl`, one [`Record`] per line.
//! A `<partition>.closed` marker file closes the partition.
//!
//! Appends take an exclusive advisory lock on the partition file, so
//! writers in other processes get distinct, contiguous sequence numbers.
//! Each channel keeps a line index per partition and only parses lines
//! appended since the last read.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shardline_core::{PartitionPosition, SourceError, TextMessage, codec};
use tracing::debug;

use crate::source::{
    Batch, Cursor, PartitionInfo, PartitionSource, Record, RetainedRecords, SequencedLog, route,
};

const LOG_SUFFIX: &str = "jsonl";
const CLOSED_SUFFIX: &str = "closed";

#[derive(Debug, Clone)]
pub struct FileChannel {
    root: PathBuf,
    indexes: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<LineIndex>>>>>,
}

impl FileChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indexes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the stream directory with `partition_count` empty partitions.
    /// Existing partitions are kept.
    pub async fn create_stream(&self, stream: &str, partition_count: usize) -> Result<(), SourceError> {
        let dir = self.stream_dir(stream);
        blocking(move || {
            fs::create_dir_all(&dir)?;
            for i in 0..partition_count.max(1) {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_path(&dir, &format!("shard-{i}")))?;
            }
            Ok(())
        })
        .await
    }

    /// Append to the partition the message key routes to.
    pub async fn append(&self, stream: &str, message: &TextMessage) -> Result<PartitionPosition, SourceError> {
        let dir = self.stream_dir(stream);
        let ids: Vec<String> = {
            let dir = dir.clone();
            blocking(move || read_partitions(&dir)).await?
        }
        .into_iter()
        .map(|p| p.id)
        .collect();
        let partition_id = route(message.key.partition_key(), &ids)
            .ok_or_else(|| SourceError::PartitionNotFound {
                stream: stream.to_owned(),
                partition: "*".to_owned(),
            })?
            .to_owned();

        let index = self.index_for(&log_path(&dir, &partition_id));
        let message = message.clone();
        blocking(move || append_record(&dir, &partition_id, &index, &message)).await
    }

    pub async fn close_partition(&self, stream: &str, partition_id: &str) -> Result<(), SourceError> {
        let marker = closed_path(&self.stream_dir(stream), partition_id);
        blocking(move || {
            fs::write(&marker, b"")?;
            Ok(())
        })
        .await
    }

    fn stream_dir(&self, stream: &str) -> PathBuf {
        self.root.join(stream)
    }

    fn index_for(&self, path: &Path) -> Arc<Mutex<LineIndex>> {
        Arc::clone(self.indexes.lock().entry(path.to_owned()).or_default())
    }

    /// Run `f` over the partition log, with the index caught up to the
    /// last complete line.
    async fn with_log<R, F>(&self, stream: &str, partition_id: &str, f: F) -> Result<R, SourceError>
    where
        F: FnOnce(SequencedLog<'_, IndexedLog<'_>>) -> Result<R, SourceError> + Send + 'static,
        R: Send + 'static,
    {
        let dir = self.stream_dir(stream);
        let stream = stream.to_owned();
        let partition_id = partition_id.to_owned();
        let path = log_path(&dir, &partition_id);
        let index = self.index_for(&path);
        blocking(move || {
            let file = match File::open(&path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(SourceError::PartitionNotFound {
                        stream,
                        partition: partition_id,
                    });
                }
                opened => opened?,
            };
            // Checked before catching up: every record written before the
            // close is then part of the view.
            let closed = closed_path(&dir, &partition_id).exists();
            let mut index = index.lock();
            index.catch_up(&file, &path)?;
            f(SequencedLog {
                partition_id: &partition_id,
                base: 0,
                records: &IndexedLog {
                    index: &index,
                    file: &file,
                    path: &path,
                },
                closed,
            })
        })
        .await
    }
}

#[async_trait]
impl PartitionSource for FileChannel {
    async fn list_partitions(&self, stream: &str) -> Result<Vec<PartitionInfo>, SourceError> {
        let dir = self.stream_dir(stream);
        blocking(move || read_partitions(&dir)).await
    }

    async fn acquire_cursor(
        &self,
        stream: &str,
        position: &PartitionPosition,
    ) -> Result<Cursor, SourceError> {
        let start_from = position.start_from.clone();
        self.with_log(stream, &position.partition_id, move |log| {
            log.cursor_for(&start_from)
        })
        .await
    }

    async fn fetch_batch(
        &self,
        stream: &str,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Batch, SourceError> {
        let owned = cursor.clone();
        self.with_log(stream, &cursor.partition_id, move |log| log.batch(&owned, limit))
            .await
    }
}

// ─── Line index ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct IndexedLine {
    offset: u64,
    arrival: DateTime<Utc>,
}

/// Byte offset and arrival time of every record line of one partition file.
#[derive(Debug, Default)]
struct LineIndex {
    /// File bytes covered so far; always ends after a newline.
    scanned: u64,
    lines: Vec<IndexedLine>,
}

impl LineIndex {
    /// Index the complete lines appended since the last call. A trailing
    /// line without a newline is still being written and is left for later.
    fn catch_up(&mut self, file: &File, path: &Path) -> Result<(), SourceError> {
        let len = file.metadata()?.len();
        if len < self.scanned {
            debug!(path = %path.display(), "file channel: log shrank, rebuilding index");
            *self = Self::default();
        }
        if len == self.scanned {
            return Ok(());
        }

        let mut handle = file;
        handle.seek(SeekFrom::Start(self.scanned))?;
        let mut reader = BufReader::new(handle);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            let offset = self.scanned;
            self.scanned += read as u64;
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_record(&line, path, self.lines.len())?;
            self.lines.push(IndexedLine {
                offset,
                arrival: record.arrival,
            });
        }
        Ok(())
    }
}

/// Partition file seen through its index.
struct IndexedLog<'a> {
    index: &'a LineIndex,
    file: &'a File,
    path: &'a Path,
}

impl RetainedRecords for IndexedLog<'_> {
    fn count(&self) -> usize {
        self.index.lines.len()
    }

    fn arrival(&self, index: usize) -> DateTime<Utc> {
        self.index.lines[index].arrival
    }

    fn read(&self, range: Range<usize>) -> Result<Vec<Record>, SourceError> {
        let Some(first) = self.index.lines.get(range.start) else {
            return Ok(Vec::new());
        };
        let mut handle = self.file;
        handle.seek(SeekFrom::Start(first.offset))?;
        let mut reader = BufReader::new(handle);
        let mut records = Vec::with_capacity(range.len());
        let mut line = String::new();
        while records.len() < range.len() {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            records.push(parse_record(&line, self.path, range.start + records.len())?);
        }
        Ok(records)
    }
}

// ─── File helpers ─────────────────────────────────────────────────

async fn blocking<T, F>(f: F) -> Result<T, SourceError>
where
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SourceError::Transport(format!("file channel worker failed: {e}")))?
}

fn log_path(dir: &Path, partition_id: &str) -> PathBuf {
    dir.join(format!("{partition_id}.{LOG_SUFFIX}"))
}

fn closed_path(dir: &Path, partition_id: &str) -> PathBuf {
    dir.join(format!("{partition_id}.{CLOSED_SUFFIX}"))
}

fn read_partitions(dir: &Path) -> Result<Vec<PartitionInfo>, SourceError> {
    let mut partitions = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_SUFFIX) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        partitions.push(PartitionInfo {
            id: id.to_owned(),
            closed: closed_path(dir, id).exists(),
        });
    }
    partitions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(partitions)
}

fn parse_record(line: &str, path: &Path, sequence: usize) -> Result<Record, SourceError> {
    serde_json::from_str(line).map_err(|e| {
        SourceError::Decode(format!("{} record {sequence}: {e}", path.display()))
    })
}

fn append_record(
    dir: &Path,
    partition_id: &str,
    index: &Mutex<LineIndex>,
    message: &TextMessage,
) -> Result<PartitionPosition, SourceError> {
    if closed_path(dir, partition_id).exists() {
        return Err(SourceError::Transport(format!(
            "partition {partition_id} is closed"
        )));
    }
    let path = log_path(dir, partition_id);
    let mut file = OpenOptions::new().read(true).append(true).open(&path)?;
    let mut index = index.lock();
    // Released when `file` is dropped.
    file.lock()?;
    index.catch_up(&file, &path)?;

    let sequence = index.lines.len().to_string();
    let record = Record {
        sequence: sequence.clone(),
        key: message.key.clone(),
        arrival: Utc::now(),
        data: Some(codec::encode(message)),
    };
    let mut line = serde_json::to_string(&record)
        .map_err(|e| SourceError::Decode(e.to_string()))?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    index.catch_up(&file, &path)?;

    debug!(partition = partition_id, sequence = %sequence, "file channel: record appended");
    Ok(PartitionPosition::at_cursor(partition_id, sequence))
}
