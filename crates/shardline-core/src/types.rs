//! Position, message and response model.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Key ──────────────────────────────────────────────────────────

/// Routing and compaction identity of a message.
///
/// The partition key decides which partition a message is written to; the
/// compaction key decides which entries replace each other in a compacting
/// store. Most messages use the same value for both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    partition_key: String,
    compaction_key: String,
}

impl Key {
    /// Key whose partition key and compaction key are the same value.
    pub fn of(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            partition_key: key.clone(),
            compaction_key: key,
        }
    }

    pub fn compound(partition_key: impl Into<String>, compaction_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            compaction_key: compaction_key.into(),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn compaction_key(&self) -> &str {
        &self.compaction_key
    }

    pub fn is_compound(&self) -> bool {
        self.partition_key != self.compaction_key
    }
}

/// Displays the compaction key, which is the identity users reason about.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compaction_key)
    }
}

// ─── Positions ────────────────────────────────────────────────────

/// Where a partition read starts.
///
/// The cursor only exists inside [`StartFrom::Cursor`], so a `Beginning`
/// position can never carry a stale cursor value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum StartFrom {
    /// Oldest record still retained by the partition.
    Beginning,
    /// Only records written after the read started.
    End,
    /// Records strictly after the record with this cursor (sequence number).
    Cursor(String),
    /// Records that arrived at or after this instant.
    Timestamp(DateTime<Utc>),
}

/// Read position of a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionPosition {
    pub partition_id: String,
    pub start_from: StartFrom,
}

impl PartitionPosition {
    pub fn beginning(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            start_from: StartFrom::Beginning,
        }
    }

    pub fn end(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            start_from: StartFrom::End,
        }
    }

    pub fn at_cursor(partition_id: impl Into<String>, cursor: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            start_from: StartFrom::Cursor(cursor.into()),
        }
    }

    pub fn at_timestamp(partition_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            partition_id: partition_id.into(),
            start_from: StartFrom::Timestamp(timestamp),
        }
    }

    /// The cursor value, if this position resumes after a known record.
    pub fn cursor(&self) -> Option<&str> {
        match &self.start_from {
            StartFrom::Cursor(cursor) => Some(cursor),
            _ => None,
        }
    }

    pub fn is_beginning(&self) -> bool {
        self.start_from == StartFrom::Beginning
    }
}

impl fmt::Display for PartitionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start_from {
            StartFrom::Beginning => write!(f, "{}@beginning", self.partition_id),
            StartFrom::End => write!(f, "{}@end", self.partition_id),
            StartFrom::Cursor(cursor) => write!(f, "{}@{cursor}", self.partition_id),
            StartFrom::Timestamp(ts) => write!(f, "{}@{}", self.partition_id, ts.to_rfc3339()),
        }
    }
}

/// Read position of a whole stream: one [`PartitionPosition`] per partition.
///
/// Partitions without an entry are read from the beginning. This is the only
/// state a caller has to persist to resume consumption later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamPosition {
    partitions: BTreeMap<String, PartitionPosition>,
}

impl StreamPosition {
    /// Position covering no partition: every partition starts at its beginning.
    pub fn beginning() -> Self {
        Self::default()
    }

    /// Build from positions; a later position for the same partition wins.
    pub fn of(positions: impl IntoIterator<Item = PartitionPosition>) -> Self {
        positions.into_iter().collect()
    }

    /// The position of `partition_id`, defaulting to its beginning.
    pub fn partition(&self, partition_id: &str) -> PartitionPosition {
        self.partitions
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| PartitionPosition::beginning(partition_id))
    }

    pub fn get(&self, partition_id: &str) -> Option<&PartitionPosition> {
        self.partitions.get(partition_id)
    }

    /// Record `position`, replacing any earlier position of its partition.
    pub fn update(&mut self, position: PartitionPosition) {
        self.partitions
            .insert(position.partition_id.clone(), position);
    }

    /// Merge `other` into `self`; positions in `other` overwrite.
    pub fn merge_from(&mut self, other: &StreamPosition) {
        for position in other.partitions.values() {
            self.update(position.clone());
        }
    }

    /// Merged copy; positions in `other` win, no partition is dropped.
    pub fn merge(&self, other: &StreamPosition) -> StreamPosition {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = &str> {
        self.partitions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionPosition> {
        self.partitions.values()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl FromIterator<PartitionPosition> for StreamPosition {
    fn from_iter<I: IntoIterator<Item = PartitionPosition>>(iter: I) -> Self {
        let mut position = Self::default();
        for p in iter {
            position.update(p);
        }
        position
    }
}

// ─── Messages ─────────────────────────────────────────────────────

/// Message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_position: Option<PartitionPosition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Header {
    pub fn of(position: PartitionPosition) -> Self {
        Self {
            partition_position: Some(position),
            ..Self::default()
        }
    }

    pub fn with_arrival_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.arrival_timestamp = Some(timestamp);
        self
    }

    pub fn with_partition_position(mut self, position: PartitionPosition) -> Self {
        self.partition_position = Some(position);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A keyed message with an optional payload.
///
/// A `None` payload is a tombstone: it marks the key as deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<P = String> {
    pub key: Key,
    #[serde(default)]
    pub header: Header,
    pub payload: Option<P>,
}

/// Message whose payload has not been decoded yet.
pub type TextMessage = Message<String>;

impl<P> Message<P> {
    pub fn new(key: Key, header: Header, payload: Option<P>) -> Self {
        Self {
            key,
            header,
            payload,
        }
    }

    /// Message with an empty header.
    pub fn of(key: Key, payload: P) -> Self {
        Self::new(key, Header::default(), Some(payload))
    }

    pub fn tombstone(key: Key, header: Header) -> Self {
        Self::new(key, header, None)
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> Message<Q> {
        Message {
            key: self.key,
            header: self.header,
            payload: self.payload.map(f),
        }
    }
}

// ─── Responses ────────────────────────────────────────────────────

/// Result of reading one batch from one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResponse {
    pub stream_name: String,
    pub partition_id: String,
    /// Position after this batch: the last record, or the unchanged start
    /// position when the batch was empty.
    pub position: PartitionPosition,
    pub messages: Vec<TextMessage>,
    /// Lag reported by the source; `None` when the source did not report one.
    pub duration_behind: Option<Duration>,
    /// When the batch was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl PartitionResponse {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The source reported zero lag for this batch.
    pub fn is_at_end(&self) -> bool {
        self.duration_behind == Some(Duration::ZERO)
    }
}

/// Final responses of every partition of one orchestration pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResponse {
    pub stream_name: String,
    pub responses: Vec<PartitionResponse>,
}

impl StreamResponse {
    pub fn stream_position(&self) -> StreamPosition {
        self.responses
            .iter()
            .map(|response| response.position.clone())
            .collect()
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = &str> {
        self.responses.iter().map(|r| r.partition_id.as_str())
    }

    /// Reported lag per partition.
    pub fn durations_behind(&self) -> BTreeMap<String, Option<Duration>> {
        self.responses
            .iter()
            .map(|r| (r.partition_id.clone(), r.duration_behind))
            .collect()
    }
}

// ─── Tests ────────────────────────────────────────────────────────
