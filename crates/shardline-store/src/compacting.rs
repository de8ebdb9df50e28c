//! Store keeping only the latest message per channel and compaction key.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use parking_lot::RwLock;
use shardline_core::{StoreError, StreamPosition};

use crate::store::{ChannelPositions, EntryStream, MessageStore, MessageStoreEntry};

type CompactionKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    entries: IndexMap<CompactionKey, MessageStoreEntry>,
    positions: ChannelPositions,
    closed: bool,
}

/// A later message replaces an earlier one with the same compaction key in
/// place, so replay order follows the first time each key was seen.
///
/// With `remove_tombstones`, a tombstone deletes its key; a key added again
/// afterwards moves to the end. Without it, tombstones are stored like any
/// other message.
#[derive(Debug)]
pub struct CompactingMessageStore {
    name: String,
    remove_tombstones: bool,
    inner: RwLock<Inner>,
}

impl CompactingMessageStore {
    pub fn new(remove_tombstones: bool) -> Self {
        Self {
            name: "compacting".to_owned(),
            remove_tombstones,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn removes_tombstones(&self) -> bool {
        self.remove_tombstones
    }
}

impl Default for CompactingMessageStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MessageStore for CompactingMessageStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, entry: MessageStoreEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        inner.positions.record(&entry);
        let key = (
            entry.channel_name.clone(),
            entry.message.key.compaction_key().to_owned(),
        );
        if self.remove_tombstones && entry.message.is_tombstone() {
            inner.entries.shift_remove(&key);
        } else {
            inner.entries.insert(key, entry);
        }
        Ok(())
    }

    fn stream(&self) -> EntryStream<'_> {
        let entries: Vec<_> = self.inner.read().entries.values().cloned().collect();
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
