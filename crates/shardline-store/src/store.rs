//! The message store contract and the bookkeeping every variant shares.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use shardline_core::{StoreError, StreamPosition, TextMessage};

/// A message together with the channel it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStoreEntry {
    pub channel_name: String,
    pub message: TextMessage,
}

impl MessageStoreEntry {
    pub fn of(channel_name: impl Into<String>, message: TextMessage) -> Self {
        Self {
            channel_name: channel_name.into(),
            message,
        }
    }
}

/// Lazy sequence of stored entries. Each call to [`MessageStore::stream`]
/// starts a fresh pass over the entries present at that moment.
pub type EntryStream<'a> =
    Box<dyn Iterator<Item = Result<MessageStoreEntry, StoreError>> + Send + 'a>;

/// Append-only buffer of channel messages, used as the replay source of an
/// event source and as the state of a compaction.
///
/// Implementations are safe to share between threads. `add` only holds a
/// short lock and updates entries and positions together, so
/// `latest_stream_position` never observes an entry without its position.
pub trait MessageStore: Send + Sync {
    fn name(&self) -> &str;

    fn add(&self, entry: MessageStoreEntry) -> Result<(), StoreError>;

    fn stream(&self) -> EntryStream<'_>;

    /// Entries of a single channel, in store order.
    fn stream_channel<'a>(&'a self, channel_name: &'a str) -> EntryStream<'a> {
        Box::new(self.stream().filter(move |entry| match entry {
            Ok(entry) => entry.channel_name == channel_name,
            Err(_) => true,
        }))
    }

    fn size(&self) -> usize;

    /// Latest position per partition over every entry of `channel_name`
    /// that carried one. Partitions never seen read as their beginning.
    fn latest_stream_position(&self, channel_name: &str) -> StreamPosition;

    fn channel_names(&self) -> BTreeSet<String>;

    /// Release resources. Calling it again is a no-op.
    fn close(&self) -> Result<(), StoreError>;
}

/// Channel names and latest positions of everything ever added to a store.
#[derive(Debug, Default)]
pub(crate) struct ChannelPositions {
    channels: BTreeSet<String>,
    positions: HashMap<String, StreamPosition>,
}

impl ChannelPositions {
    pub(crate) fn record(&mut self, entry: &MessageStoreEntry) {
        if !self.channels.contains(&entry.channel_name) {
            self.channels.insert(entry.channel_name.clone());
        }
        if let Some(position) = &entry.message.header.partition_position {
            self.positions
                .entry(entry.channel_name.clone())
                .or_default()
                .update(position.clone());
        }
    }

    pub(crate) fn latest(&self, channel_name: &str) -> StreamPosition {
        self.positions
            .get(channel_name)
            .cloned()
            .unwrap_or_else(StreamPosition::beginning)
    }

    pub(crate) fn channel_names(&self) -> BTreeSet<String> {
        self.channels.clone()
    }
}
