//! shardline-reader: partition reading and orchestration.
//!
//! [`ShardReader`] pulls one partition through a [`PartitionSource`];
//! [`ChannelOrchestrator`] runs one reader per partition on a
//! [`WorkerPool`] and reduces their progress into a stream position.

pub mod config;
pub mod file;
pub mod in_memory;
pub mod orchestrator;
pub mod pool;
pub mod shard;
pub mod source;

#[cfg(test)]
mod testing;

pub use config::{OrchestratorConfig, ReaderConfig};
pub use file::FileChannel;
pub use in_memory::InMemoryChannel;
pub use orchestrator::{ChannelOrchestrator, ResponseConsumer};
pub use pool::WorkerPool;
pub use shard::{Clock, ReaderState, ShardReader};
pub use source::{Batch, Cursor, PartitionInfo, PartitionSource, Record, route};
