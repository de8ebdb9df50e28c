//! Bounded FIFO store.

use std::collections::{BTreeSet, VecDeque};

use parking_lot::RwLock;
use shardline_core::{StoreError, StreamPosition};

use crate::store::{ChannelPositions, EntryStream, MessageStore, MessageStoreEntry};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<MessageStoreEntry>,
    positions: ChannelPositions,
    closed: bool,
}

/// Keeps the last `capacity` entries, evicting the oldest on overflow.
///
/// Positions survive eviction: the latest position of a channel reflects
/// every entry ever added, not only the retained ones.
#[derive(Debug)]
pub struct RingBufferMessageStore {
    name: String,
    capacity: usize,
    inner: RwLock<Inner>,
}

impl RingBufferMessageStore {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: format!("ring-buffer({capacity})"),
            capacity,
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                ..Inner::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RingBufferMessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageStore for RingBufferMessageStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, entry: MessageStoreEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed(self.name.clone()));
        }
        inner.positions.record(&entry);
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        Ok(())
    }

    fn stream(&self) -> EntryStream<'_> {
        let entries: Vec<_> = self.inner.read().entries.iter().cloned().collect();
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
