//! The partitioned log a shard reader pulls from.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_core::{Key, PartitionPosition, SourceError, StartFrom};
use twox_hash::XxHash64;

/// A partition as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: String,
    /// Closed partitions accept no writes and are skipped by discovery.
    pub closed: bool,
}

/// Opaque handle used to fetch the next batch of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub partition_id: String,
    pub token: String,
}

/// One raw record of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub sequence: String,
    pub key: Key,
    pub arrival: DateTime<Utc>,
    /// Record text; `None` or empty decodes to a tombstone.
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub records: Vec<Record>,
    /// `None` once a closed partition has been read to its end.
    pub next_cursor: Option<Cursor>,
    /// Lag behind the newest record, when the source reports one.
    pub duration_behind: Option<Duration>,
}

/// Transport boundary of a partitioned log.
#[async_trait]
pub trait PartitionSource: Send + Sync {
    async fn list_partitions(&self, stream: &str) -> Result<Vec<PartitionInfo>, SourceError>;

    /// Resolve a position into a cursor. Positions the log no longer holds
    /// fail with [`SourceError::PositionNotResolvable`].
    async fn acquire_cursor(
        &self,
        stream: &str,
        position: &PartitionPosition,
    ) -> Result<Cursor, SourceError>;

    async fn fetch_batch(
        &self,
        stream: &str,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Batch, SourceError>;
}

const ROUTE_SEED: u64 = 0;

/// Pick the partition for `partition_key` among `partition_ids`.
///
/// The hash is fixed, so a key keeps its partition across builds and
/// processes as long as the partition list is unchanged.
pub fn route<'a>(partition_key: &str, partition_ids: &'a [String]) -> Option<&'a str> {
    if partition_ids.is_empty() {
        return None;
    }
    let hash = XxHash64::oneshot(ROUTE_SEED, partition_key.as_bytes());
    let slot = (hash % partition_ids.len() as u64) as usize;
    Some(partition_ids[slot].as_str())
}

// ─── Sequence-numbered logs ───────────────────────────────────────

/// Random access to the retained records of one partition.
pub(crate) trait RetainedRecords {
    fn count(&self) -> usize;

    fn arrival(&self, index: usize) -> DateTime<Utc>;

    /// Records in `range`, which lies within `0..count()`.
    fn read(&self, range: Range<usize>) -> Result<Vec<Record>, SourceError>;
}

impl RetainedRecords for [Record] {
    fn count(&self) -> usize {
        self.len()
    }

    fn arrival(&self, index: usize) -> DateTime<Utc> {
        self[index].arrival
    }

    fn read(&self, range: Range<usize>) -> Result<Vec<Record>, SourceError> {
        Ok(self[range].to_vec())
    }
}

/// View over the retained records of one partition whose sequence numbers
/// are consecutive integers starting at `base`. Cursor tokens are the
/// sequence number of the next record to read.
pub(crate) struct SequencedLog<'a, R: RetainedRecords + ?Sized = [Record]> {
    pub partition_id: &'a str,
    pub base: u64,
    pub records: &'a R,
    pub closed: bool,
}

impl<R: RetainedRecords + ?Sized> SequencedLog<'_, R> {
    fn end(&self) -> u64 {
        self.base + self.records.count() as u64
    }

    fn not_resolvable(&self, detail: String) -> SourceError {
        SourceError::PositionNotResolvable {
            partition: self.partition_id.to_owned(),
            detail,
        }
    }

    fn cursor(&self, next: u64) -> Cursor {
        Cursor {
            partition_id: self.partition_id.to_owned(),
            token: next.to_string(),
        }
    }

    pub fn cursor_for(&self, start_from: &StartFrom) -> Result<Cursor, SourceError> {
        let next = match start_from {
            StartFrom::Beginning => self.base,
            StartFrom::End => self.end(),
            StartFrom::Cursor(sequence) => {
                let after: u64 = sequence
                    .parse()
                    .map_err(|_| self.not_resolvable(format!("invalid sequence number {sequence:?}")))?;
                let next = after
                    .checked_add(1)
                    .ok_or_else(|| self.not_resolvable(format!("sequence {after} has no successor")))?;
                if next < self.base {
                    return Err(self.not_resolvable(format!(
                        "sequence {after} is older than the oldest retained record {}",
                        self.base
                    )));
                }
                next
            }
            StartFrom::Timestamp(at) => (0..self.records.count())
                .find(|&i| self.records.arrival(i) >= *at)
                .map_or(self.end(), |i| self.base + i as u64),
        };
        Ok(self.cursor(next))
    }

    pub fn batch(&self, cursor: &Cursor, limit: usize) -> Result<Batch, SourceError> {
        let from: u64 = cursor
            .token
            .parse()
            .map_err(|_| SourceError::Transport(format!("invalid cursor token {:?}", cursor.token)))?;
        if from < self.base {
            return Err(SourceError::PositionNotResolvable {
                partition: self.partition_id.to_owned(),
                detail: format!("cursor {from} points at a trimmed record"),
            });
        }

        let len = self.records.count();
        let start = usize::try_from(from - self.base).map_or(len, |i| i.min(len));
        let stop = start.saturating_add(limit.max(1)).min(len);
        let records = self.records.read(start..stop)?;
        let next = from.max(self.base + stop as u64);
        let at_end = next >= self.end();

        let duration_behind = if at_end || stop == start {
            Duration::ZERO
        } else {
            (self.records.arrival(len - 1) - self.records.arrival(stop - 1))
                .to_std()
                .unwrap_or(Duration::ZERO)
        };
        let next_cursor = if self.closed && at_end {
            None
        } else {
            Some(self.cursor(next))
        };

        Ok(Batch {
            records,
            next_cursor,
            duration_behind: Some(duration_behind),
        })
    }
}
