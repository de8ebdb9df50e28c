//! Per-partition reader: cursor management, batch loop, stop handling.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shardline_core::{
    ConsumeError, Header, PartitionPosition, PartitionResponse, SourceError, StopCondition,
    codec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReaderConfig;
use crate::source::{Cursor, PartitionSource, Record};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Reads one partition of one stream.
///
/// A reader is reusable: every `consume_until` call starts from the given
/// position. Once stopped it delivers one last batch per call and returns.
pub struct ShardReader {
    stream_name: String,
    partition_id: String,
    source: Arc<dyn PartitionSource>,
    config: ReaderConfig,
    stop: CancellationToken,
    state: Mutex<ReaderState>,
    clock: Clock,
}

impl ShardReader {
    pub fn new(
        stream_name: impl Into<String>,
        partition_id: impl Into<String>,
        source: Arc<dyn PartitionSource>,
        config: ReaderConfig,
    ) -> Self {
        Self::with_stop_token(
            stream_name,
            partition_id,
            source,
            config,
            CancellationToken::new(),
        )
    }

    /// Reader stopped when `stop` is cancelled, e.g. a child token of an
    /// orchestrator.
    pub fn with_stop_token(
        stream_name: impl Into<String>,
        partition_id: impl Into<String>,
        source: Arc<dyn PartitionSource>,
        config: ReaderConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            partition_id: partition_id.into(),
            source,
            config,
            stop,
            state: Mutex::new(ReaderState::Idle),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn state(&self) -> ReaderState {
        *self.state.lock()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Request a stop. The fetch in flight completes and its response is
    /// still delivered.
    pub fn stop(&self) {
        self.stop.cancel();
        let mut state = self.state.lock();
        if matches!(*state, ReaderState::Idle | ReaderState::Running) {
            *state = ReaderState::Stopping;
        }
    }

    /// Read from `start` until `stop_condition` matches a response, the
    /// reader is stopped, or a closed partition is exhausted. `consumer` gets
    /// one response per fetched batch. Returns the position after the last
    /// delivered batch.
    pub async fn consume_until<F>(
        &self,
        start: PartitionPosition,
        stop_condition: &StopCondition,
        mut consumer: F,
    ) -> Result<PartitionPosition, ConsumeError>
    where
        F: FnMut(&PartitionResponse) + Send,
    {
        self.set_state(ReaderState::Running);
        info!(
            stream = %self.stream_name,
            partition = %self.partition_id,
            start = %start,
            stop_condition = stop_condition.name(),
            "shard reader: started"
        );

        let (mut cursor, mut position) = match self.acquire(start).await {
            Ok(acquired) => acquired,
            Err(e) => return Err(self.fail(e)),
        };

        loop {
            let batch = match self
                .source
                .fetch_batch(&self.stream_name, &cursor, self.config.batch_limit)
                .await
            {
                Ok(batch) => batch,
                Err(e) => return Err(self.fail(e)),
            };

            let response = self.to_response(&position, batch.records, batch.duration_behind);
            position = response.position.clone();
            let done = stop_condition.matches(&response);
            let empty = response.is_empty();
            consumer(&response);

            if done {
                debug!(
                    stream = %self.stream_name,
                    partition = %self.partition_id,
                    stop_condition = stop_condition.name(),
                    "shard reader: stop condition met"
                );
                break;
            }
            if self.is_stopping() {
                break;
            }
            match batch.next_cursor {
                Some(next) => cursor = next,
                None => {
                    info!(
                        stream = %self.stream_name,
                        partition = %self.partition_id,
                        "shard reader: partition closed and fully read"
                    );
                    break;
                }
            }

            let backoff = self.config.empty_batch_backoff();
            if empty && !backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.stop.cancelled() => break,
                }
            }
        }

        self.set_state(ReaderState::Stopped);
        info!(
            stream = %self.stream_name,
            partition = %self.partition_id,
            position = %position,
            "shard reader: finished"
        );
        Ok(position)
    }

    /// Acquire a cursor for `start`, falling back to the beginning of the
    /// partition once if the position cannot be resolved. Returns the cursor
    /// and the position it was acquired for.
    async fn acquire(
        &self,
        start: PartitionPosition,
    ) -> Result<(Cursor, PartitionPosition), SourceError> {
        match self.source.acquire_cursor(&self.stream_name, &start).await {
            Ok(cursor) => Ok((cursor, start)),
            Err(e) if e.is_position_not_resolvable() => {
                warn!(
                    stream = %self.stream_name,
                    partition = %self.partition_id,
                    position = %start,
                    error = %e,
                    "shard reader: position not resolvable, restarting from beginning"
                );
                let beginning = PartitionPosition::beginning(&self.partition_id);
                let cursor = self
                    .source
                    .acquire_cursor(&self.stream_name, &beginning)
                    .await?;
                Ok((cursor, beginning))
            }
            Err(e) => Err(e),
        }
    }

    fn to_response(
        &self,
        previous: &PartitionPosition,
        records: Vec<Record>,
        duration_behind: Option<std::time::Duration>,
    ) -> PartitionResponse {
        let position = records
            .last()
            .map(|r| PartitionPosition::at_cursor(&self.partition_id, &r.sequence))
            .unwrap_or_else(|| previous.clone());
        let messages = records
            .into_iter()
            .map(|record| {
                let header = Header::of(PartitionPosition::at_cursor(
                    &self.partition_id,
                    record.sequence,
                ))
                .with_arrival_timestamp(record.arrival);
                codec::decode(record.key, header, record.data.as_deref())
            })
            .collect();

        PartitionResponse {
            stream_name: self.stream_name.clone(),
            partition_id: self.partition_id.clone(),
            position,
            messages,
            duration_behind,
            fetched_at: (self.clock)(),
        }
    }

    fn fail(&self, source: SourceError) -> ConsumeError {
        self.set_state(ReaderState::Failed);
        warn!(
            stream = %self.stream_name,
            partition = %self.partition_id,
            error = %source,
            "shard reader: failed"
        );
        ConsumeError::Partition {
            stream: self.stream_name.clone(),
            partition: self.partition_id.clone(),
            source,
        }
    }

    fn set_state(&self, next: ReaderState) {
        let mut state = self.state.lock();
        // A stop requested while running is reported until the loop exits.
        if next == ReaderState::Running && self.stop.is_cancelled() {
            *state = ReaderState::Stopping;
        } else {
            *state = next;
        }
    }
}

impl fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardReader")
            .field("stream_name", &self.stream_name)
            .field("partition_id", &self.partition_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
