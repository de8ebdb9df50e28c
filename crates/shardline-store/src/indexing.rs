//! Full-history store with a key index held on the heap.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use shardline_core::{Key, StoreError, StreamPosition};

use crate::store::{ChannelPositions, EntryStream, MessageStore, MessageStoreEntry};

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<MessageStoreEntry>,
    /// (channel, compaction key) → index of the latest entry.
    index: HashMap<(String, String), usize>,
    positions: ChannelPositions,
    closed: bool,
}

/// Keeps every entry and indexes the latest entry per channel and key.
#[derive(Debug)]
pub struct IndexingMessageStore {
    name: String,
    inner: RwLock<Inner>,
}

impl IndexingMessageStore {
    pub fn new() -> Self {
        Self {
            name: "indexing".to_owned(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Latest entry added for `key` on `channel_name`, tombstones included.
    pub fn get(&self, channel_name: &str, key: &Key) -> Option<MessageStoreEntry> {
        let inner = self.inner.read();
        inner
            .index
            .get(&(channel_name.to_owned(), key.compaction_key().to_owned()))
            .and_then(|&i| inner.entries.get(i).cloned())
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

impl Default for IndexingMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for IndexingMessageStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, entry: MessageStoreEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        inner.positions.record(&entry);
        let slot = inner.entries.len();
        inner.index.insert(
            (
                entry.channel_name.clone(),
                entry.message.key.compaction_key().to_owned(),
            ),
            slot,
        );
        inner.entries.push(entry);
        Ok(())
    }

    fn stream(&self) -> EntryStream<'_> {
        let entries = self.inner.read().entries.clone();
        Box::new(entries.into_iter().map(Ok))
    }

    fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    fn latest_stream_position(&self, channel_name: &str) -> StreamPosition {
        self.inner.read().positions.latest(channel_name)
    }

    fn channel_names(&self) -> BTreeSet<String> {
        self.inner.read().positions.channel_names()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.write().closed = true;
        Ok(())
    }
}
