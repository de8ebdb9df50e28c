//! Full-history store that spills entries to a temporary file.
//!
//! Entries are appended as JSON lines; only their byte offsets, the key
//! index and the positions stay in memory. The file is deleted on close or
//! drop.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::RwLock;
use shardline_core::{Key, StoreError, StreamPosition};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::store::{ChannelPositions, EntryStream, MessageStore, MessageStoreEntry};

struct Spill {
    file: NamedTempFile,
    writer: BufWriter<File>,
    len: u64,
}

#[derive(Default)]
struct Inner {
    spill: Option<Spill>,
    offsets: Vec<u64>,
    index: HashMap<(String, String), usize>,
    positions: ChannelPositions,
}

pub struct OffHeapIndexingMessageStore {
    name: String,
    inner: RwLock<Inner>,
}

impl OffHeapIndexingMessageStore {
    /// Spill file in the system temp directory.
    pub fn new() -> Result<Self, StoreError> {
        Self::from_file(NamedTempFile::new()?)
    }

    pub fn new_in(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_file(NamedTempFile::new_in(dir)?)
    }

    fn from_file(file: NamedTempFile) -> Result<Self, StoreError> {
        let writer = BufWriter::new(file.reopen()?);
        debug!(path = %file.path().display(), "off-heap store spill file created");
        Ok(Self {
            name: "off-heap-indexing".to_owned(),
            inner: RwLock::new(Inner {
                spill: Some(Spill {
                    file,
                    writer,
                    len: 0,
                }),
                ..Inner::default()
            }),
        })
    }

    /// Latest entry added for `key` on `channel_name`, tombstones included.
    pub fn get(&self, channel_name: &str, key: &Key) -> Result<Option<MessageStoreEntry>, StoreError> {
        let inner = self.inner.read();
        let Some(spill) = &inner.spill else {
            return Ok(None);
        };
        let Some(&slot) = inner
            .index
            .get(&(channel_name.to_owned(), key.compaction_key().to_owned()))
        else {
            return Ok(None);
        };

        let mut reader = BufReader::new(spill.file.reopen()?);
        reader.seek(SeekFrom::Start(inner.offsets[slot]))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    pub fn keys(&self, channel_name: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .index
            .keys()
            .filter(|(channel, _)| channel == channel_name)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

impl MessageStore for OffHeapIndexingMessageStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, entry: MessageStoreEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let Some(spill) = inner.spill.as_mut() else {
            return Err(StoreError::Closed(self.name.clone()));
        };
        spill.writer.write_all(line.as_bytes())?;
        spill.writer.flush()?;
        let offset = spill.len;
        spill.len += line.len() as u64;

        inner.positions.record(&entry);
        let slot = inner.offsets.len();
        inner.offsets.push(offset);
        inner.index.insert(
            (
                entry.channel_name,
                entry.message.key.compaction_key().to_owned(),
            ),
            slot,
        );
        Ok(())
    }

    /// Entries written before this call. Empty once the store is closed.
    fn stream(&self) -> EntryStream<'_> {
        let inner = self.inner.read();
        let Some(spill) = &inner.spill else {
            return Box::new(std::iter::empty());
        };
        match spill.file.reopen() {
            Ok(file) => Box::new(SpillReader {
                reader: BufReader::new(file),
                remaining: inner.offsets.len(),
                line: String::new(),
            }),
            Err(e) => Box::new(std::iter::once(Err(StoreError::Io(e)))),
        }
    }

    fn size(&self) -> usize {
        self.inner.read().offsets.len()
    }

    fn latest_stream_position(&self, channel_name: &str) -> StreamPosition {
        self.inner.read().positions.latest(channel_name)
    }

    fn channel_names(&self) -> BTreeSet<String> {
        self.inner.read().positions.channel_names()
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let Some(spill) = inner.spill.take() else {
            return Ok(());
        };
        inner.offsets.clear();
        inner.index.clear();
        drop(spill.writer);
        spill.file.close()?;
        Ok(())
    }
}

struct SpillReader {
    reader: BufReader<File>,
    remaining: usize,
    line: String,
}

impl Iterator for SpillReader {
    type Item = Result<MessageStoreEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => {
                self.remaining = 0;
                Some(Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "spill file ended early",
                ))))
            }
            Ok(_) => Some(serde_json::from_str(self.line.trim_end()).map_err(StoreError::from)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(StoreError::Io(e)))
            }
        }
    }
}
