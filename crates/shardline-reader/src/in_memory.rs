//! In-process partitioned log.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shardline_core::{PartitionPosition, SourceError, TextMessage, codec};

use crate::source::{
    Batch, Cursor, PartitionInfo, PartitionSource, Record, SequencedLog, route,
};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<Record>,
    /// Records before this sequence number have expired.
    trimmed: usize,
    closed: bool,
}

/// Partitioned log held in memory. Sequence numbers count from zero per
/// partition; messages are routed by a hash of their partition key.
#[derive(Debug)]
pub struct InMemoryChannel {
    stream_name: String,
    partitions: RwLock<BTreeMap<String, PartitionLog>>,
}

impl InMemoryChannel {
    /// Channel with partitions `shard-0` .. `shard-{n-1}`.
    pub fn new(stream_name: impl Into<String>, partition_count: usize) -> Self {
        Self::with_partitions(
            stream_name,
            (0..partition_count.max(1)).map(|i| format!("shard-{i}")),
        )
    }

    pub fn with_partitions<I, S>(stream_name: impl Into<String>, partition_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let partitions = partition_ids
            .into_iter()
            .map(|id| (id.into(), PartitionLog::default()))
            .collect();
        Self {
            stream_name: stream_name.into(),
            partitions: RwLock::new(partitions),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn partition_ids(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Append to the partition the message key routes to.
    pub fn append(&self, message: &TextMessage) -> Result<PartitionPosition, SourceError> {
        let ids = self.partition_ids();
        let partition_id = route(message.key.partition_key(), &ids)
            .ok_or_else(|| SourceError::Transport("channel has no partitions".to_owned()))?
            .to_owned();
        self.append_to(&partition_id, message, Utc::now())
    }

    pub fn append_to(
        &self,
        partition_id: &str,
        message: &TextMessage,
        arrival: DateTime<Utc>,
    ) -> Result<PartitionPosition, SourceError> {
        let mut partitions = self.partitions.write();
        let log = partitions
            .get_mut(partition_id)
            .ok_or_else(|| self.not_found(partition_id))?;
        if log.closed {
            return Err(SourceError::Transport(format!(
                "partition {partition_id} is closed"
            )));
        }
        let sequence = log.records.len().to_string();
        log.records.push(Record {
            sequence: sequence.clone(),
            key: message.key.clone(),
            arrival,
            data: Some(codec::encode(message)),
        });
        Ok(PartitionPosition::at_cursor(partition_id, sequence))
    }

    /// Close a partition: no more appends, readers end after its last record.
    pub fn close_partition(&self, partition_id: &str) -> Result<(), SourceError> {
        let mut partitions = self.partitions.write();
        let log = partitions
            .get_mut(partition_id)
            .ok_or_else(|| self.not_found(partition_id))?;
        log.closed = true;
        Ok(())
    }

    /// Expire every record with a sequence number below `before`.
    pub fn trim(&self, partition_id: &str, before: usize) -> Result<(), SourceError> {
        let mut partitions = self.partitions.write();
        let log = partitions
            .get_mut(partition_id)
            .ok_or_else(|| self.not_found(partition_id))?;
        log.trimmed = before.min(log.records.len()).max(log.trimmed);
        Ok(())
    }

    pub fn len(&self, partition_id: &str) -> usize {
        self.partitions
            .read()
            .get(partition_id)
            .map_or(0, |log| log.records.len())
    }

    fn not_found(&self, partition_id: &str) -> SourceError {
        SourceError::PartitionNotFound {
            stream: self.stream_name.clone(),
            partition: partition_id.to_owned(),
        }
    }

    fn check_stream(&self, stream: &str) -> Result<(), SourceError> {
        if stream == self.stream_name {
            Ok(())
        } else {
            Err(SourceError::Transport(format!("unknown stream {stream}")))
        }
    }

    fn with_log<R>(
        &self,
        partition_id: &str,
        f: impl FnOnce(SequencedLog<'_>) -> Result<R, SourceError>,
    ) -> Result<R, SourceError> {
        let partitions = self.partitions.read();
        let log = partitions
            .get(partition_id)
            .ok_or_else(|| self.not_found(partition_id))?;
        f(SequencedLog {
            partition_id,
            base: log.trimmed as u64,
            records: &log.records[log.trimmed..],
            closed: log.closed,
        })
    }
}

#[async_trait]
impl PartitionSource for InMemoryChannel {
    async fn list_partitions(&self, stream: &str) -> Result<Vec<PartitionInfo>, SourceError> {
        self.check_stream(stream)?;
        Ok(self
            .partitions
            .read()
            .iter()
            .map(|(id, log)| PartitionInfo {
                id: id.clone(),
                closed: log.closed,
            })
            .collect())
    }

    async fn acquire_cursor(
        &self,
        stream: &str,
        position: &PartitionPosition,
    ) -> Result<Cursor, SourceError> {
        self.check_stream(stream)?;
        self.with_log(&position.partition_id, |log| {
            log.cursor_for(&position.start_from)
        })
    }

    async fn fetch_batch(
        &self,
        stream: &str,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Batch, SourceError> {
        self.check_stream(stream)?;
        self.with_log(&cursor.partition_id, |log| log.batch(cursor, limit))
    }
}
