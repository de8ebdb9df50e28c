//! shardline-store: message stores used as replay source and bounded buffer.
//!
//! Every variant implements [`MessageStore`]. Snapshot files bootstrap a
//! store without replaying the full history of a channel.

pub mod compacting;
pub mod indexing;
pub mod off_heap;
pub mod ring_buffer;
pub mod snapshot;
pub mod store;

pub use compacting::CompactingMessageStore;
pub use indexing::IndexingMessageStore;
pub use off_heap::OffHeapIndexingMessageStore;
pub use ring_buffer::RingBufferMessageStore;
pub use snapshot::{
    SnapshotMessageStore, SnapshotMetadata, SnapshotReader, SnapshotWriter, latest_snapshot,
    prune_snapshots,
};
pub use store::{EntryStream, MessageStore, MessageStoreEntry};
