//! Scripted partition source for reader and orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use shardline_core::{Key, PartitionPosition, SourceError};

use crate::source::{Batch, Cursor, PartitionInfo, PartitionSource, Record};

#[derive(Default)]
struct Script {
    acquires: VecDeque<Result<Cursor, SourceError>>,
    batches: VecDeque<Result<Batch, SourceError>>,
    fetch_delay: Duration,
    panic_on_fetch: bool,
    acquired: Vec<PartitionPosition>,
    fetched: Vec<Cursor>,
}

/// Replays queued acquisition and fetch results per partition. Once a queue
/// is empty, acquisitions succeed with token `"0"` and fetches return an
/// empty batch at the end of the partition.
pub(crate) struct ScriptedSource {
    partitions: Mutex<Vec<PartitionInfo>>,
    scripts: Mutex<HashMap<String, Script>>,
    list_calls: Mutex<usize>,
}

impl ScriptedSource {
    pub fn new<I, S>(partition_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let partitions = partition_ids
            .into_iter()
            .map(|id| PartitionInfo {
                id: id.into(),
                closed: false,
            })
            .collect();
        Self {
            partitions: Mutex::new(partitions),
            scripts: Mutex::new(HashMap::new()),
            list_calls: Mutex::new(0),
        }
    }

    pub fn add_closed(&self, partition_id: &str) {
        self.partitions.lock().push(PartitionInfo {
            id: partition_id.to_owned(),
            closed: true,
        });
    }

    pub fn cursor(&self, partition_id: &str, token: &str) -> Cursor {
        Cursor {
            partition_id: partition_id.to_owned(),
            token: token.to_owned(),
        }
    }

    pub fn push_acquire(&self, partition_id: &str, result: Result<Cursor, SourceError>) {
        self.script(partition_id, |s| s.acquires.push_back(result));
    }

    pub fn push_batch(&self, partition_id: &str, result: Result<Batch, SourceError>) {
        self.script(partition_id, |s| s.batches.push_back(result));
    }

    pub fn set_fetch_delay(&self, partition_id: &str, delay: Duration) {
        self.script(partition_id, |s| s.fetch_delay = delay);
    }

    pub fn panic_on_fetch(&self, partition_id: &str) {
        self.script(partition_id, |s| s.panic_on_fetch = true);
    }

    pub fn acquired(&self, partition_id: &str) -> Vec<PartitionPosition> {
        self.script(partition_id, |s| s.acquired.clone())
    }

    pub fn fetched(&self, partition_id: &str) -> Vec<Cursor> {
        self.script(partition_id, |s| s.fetched.clone())
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock()
    }

    fn script<R>(&self, partition_id: &str, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut scripts = self.scripts.lock();
        f(scripts.entry(partition_id.to_owned()).or_default())
    }
}

#[async_trait]
impl PartitionSource for ScriptedSource {
    async fn list_partitions(&self, _stream: &str) -> Result<Vec<PartitionInfo>, SourceError> {
        *self.list_calls.lock() += 1;
        Ok(self.partitions.lock().clone())
    }

    async fn acquire_cursor(
        &self,
        _stream: &str,
        position: &PartitionPosition,
    ) -> Result<Cursor, SourceError> {
        let partition_id = position.partition_id.clone();
        self.script(&partition_id, |s| {
            s.acquired.push(position.clone());
            s.acquires.pop_front().unwrap_or_else(|| {
                Ok(Cursor {
                    partition_id: partition_id.clone(),
                    token: "0".to_owned(),
                })
            })
        })
    }

    async fn fetch_batch(
        &self,
        _stream: &str,
        cursor: &Cursor,
        _limit: usize,
    ) -> Result<Batch, SourceError> {
        let (delay, panics) = self.script(&cursor.partition_id, |s| (s.fetch_delay, s.panic_on_fetch));
        if panics {
            panic!("scripted fetch panic on {}", cursor.partition_id);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.script(&cursor.partition_id, |s| {
            s.fetched.push(cursor.clone());
            s.batches.pop_front().unwrap_or_else(|| {
                Ok(Batch {
                    records: Vec::new(),
                    next_cursor: Some(cursor.clone()),
                    duration_behind: Some(Duration::ZERO),
                })
            })
        });
        result.map(|mut batch| {
            if let Some(next) = batch.next_cursor.as_mut() {
                if next.partition_id.is_empty() {
                    next.partition_id = cursor.partition_id.clone();
                }
            }
            batch
        })
    }
}

pub(crate) fn record(sequence: &str, key: &str, data: &str) -> Record {
    Record {
        sequence: sequence.to_owned(),
        key: Key::of(key),
        arrival: Utc::now(),
        data: Some(data.to_owned()),
    }
}

pub(crate) fn batch(records: Vec<Record>, duration_behind: Option<Duration>) -> Batch {
    Batch {
        records,
        next_cursor: Some(Cursor {
            partition_id: String::new(),
            token: "next".to_owned(),
        }),
        duration_behind,
    }
}
