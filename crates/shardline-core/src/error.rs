//! Error taxonomy shared by every shardline crate.

use thiserror::Error;

/// Failures reported by a partition source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The requested cursor no longer exists upstream (expired, trimmed).
    /// The shard reader recovers from this once by restarting at the
    /// beginning of the partition.
    #[error("position not resolvable on partition {partition}: {detail}")]
    PositionNotResolvable { partition: String, detail: String },

    #[error("partition {partition} not found in stream {stream}")]
    PartitionNotFound { stream: String, partition: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("source io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode record: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_position_not_resolvable(&self) -> bool {
        matches!(self, Self::PositionNotResolvable { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store {0} is closed")]
    Closed(String),

    #[error("message store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message store json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),
}

/// Failures of a consumption pass (shard reader, orchestrator, event source).
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("consuming partition {partition} of stream {stream} failed")]
    Partition {
        stream: String,
        partition: String,
        #[source]
        source: SourceError,
    },

    #[error("discovering partitions of stream {stream} failed")]
    Discovery {
        stream: String,
        #[source]
        source: SourceError,
    },

    #[error("worker for partition {partition} failed: {detail}")]
    Worker { partition: String, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("replaying channel {channel} failed: {detail}")]
    Replay { channel: String, detail: String },

    #[error("consumption was stopped before it started")]
    Stopped,
}

impl ConsumeError {
    /// The partition whose failure caused this error, if any.
    pub fn partition(&self) -> Option<&str> {
        match self {
            Self::Partition { partition, .. } | Self::Worker { partition, .. } => Some(partition),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("send transport failure: {0}")]
    Transport(String),

    #[error("send io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
