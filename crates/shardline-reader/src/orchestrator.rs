//! Fan-out of one shard reader per partition, fan-in of their responses.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use shardline_core::{
    ConsumeError, PartitionResponse, StopCondition, StreamPosition, StreamResponse,
};
use tokio::sync::OnceCell;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::pool::WorkerPool;
use crate::shard::{ReaderState, ShardReader};
use crate::source::PartitionSource;

/// Callback receiving every batch of every partition. Called concurrently
/// from partition workers.
pub type ResponseConsumer = Arc<dyn Fn(&PartitionResponse) + Send + Sync>;

type PartitionOutcome = (String, Result<Option<PartitionResponse>, ConsumeError>);

/// Consumes every open partition of one stream in parallel.
///
/// Partitions are discovered once. The orchestrator keeps the stream
/// position reached so far, updated after every batch. A stop, or the
/// failure of any partition, stops the orchestrator for good; restart from
/// [`ChannelOrchestrator::stream_position`] with a new instance.
pub struct ChannelOrchestrator {
    stream_name: String,
    source: Arc<dyn PartitionSource>,
    pool: WorkerPool,
    config: OrchestratorConfig,
    readers: OnceCell<Vec<Arc<ShardReader>>>,
    position: Arc<Mutex<StreamPosition>>,
    stop: CancellationToken,
}

impl ChannelOrchestrator {
    pub fn new(
        stream_name: impl Into<String>,
        source: Arc<dyn PartitionSource>,
        pool: WorkerPool,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            source,
            pool,
            config,
            readers: OnceCell::new(),
            position: Arc::new(Mutex::new(StreamPosition::beginning())),
            stop: CancellationToken::new(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Position reached so far, across passes.
    pub fn stream_position(&self) -> StreamPosition {
        self.position.lock().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop every reader after its current batch. No new pass starts.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(stream = %self.stream_name, "orchestrator: stop requested");
        }
        self.stop.cancel();
    }

    /// Read every open partition from `start` (partitions it does not cover
    /// start at their beginning) until `stop_condition` matches each of
    /// them. Fails with the first partition error after stopping the other
    /// readers.
    pub async fn consume_stream(
        &self,
        start: &StreamPosition,
        stop_condition: StopCondition,
        consumer: ResponseConsumer,
    ) -> Result<StreamResponse, ConsumeError> {
        if self.is_stopping() {
            return Err(ConsumeError::Stopped);
        }
        let readers = self.readers().await?;
        self.position.lock().merge_from(start);

        let mut tasks: JoinSet<PartitionOutcome> = JoinSet::new();
        let mut partitions: HashMap<task::Id, String> = HashMap::with_capacity(readers.len());
        for reader in readers {
            let reader = Arc::clone(reader);
            let start = start.partition(reader.partition_id());
            let stop_condition = stop_condition.clone();
            let consumer = Arc::clone(&consumer);
            let position = Arc::clone(&self.position);

            let partition_id = reader.partition_id().to_owned();
            let handle = self.pool.spawn_into(&mut tasks, async move {
                let mut last = None;
                let result = reader
                    .consume_until(start, &stop_condition, |response| {
                        position.lock().update(response.position.clone());
                        consumer(response);
                        last = Some(response.clone());
                    })
                    .await;
                (reader.partition_id().to_owned(), result.map(|_| last))
            });
            partitions.insert(handle.id(), partition_id);
        }
        info!(
            stream = %self.stream_name,
            partitions = readers.len(),
            pool = self.pool.name(),
            "orchestrator: pass started"
        );

        let mut responses = Vec::with_capacity(readers.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            let failure = match joined {
                Ok((_, (partition, Ok(last)))) => {
                    debug!(stream = %self.stream_name, partition = %partition, "orchestrator: partition finished");
                    responses.extend(last);
                    continue;
                }
                Ok((_, (_, Err(e)))) => e,
                Err(join_error) => ConsumeError::Worker {
                    partition: partitions
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_owned()),
                    detail: join_error.to_string(),
                },
            };
            error!(
                stream = %self.stream_name,
                partition = failure.partition().unwrap_or("unknown"),
                error = %failure,
                "orchestrator: partition failed, stopping remaining readers"
            );
            self.shut_down(readers, tasks).await;
            return Err(failure);
        }

        responses.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        let response = StreamResponse {
            stream_name: self.stream_name.clone(),
            responses,
        };
        self.position.lock().merge_from(&response.stream_position());
        info!(
            stream = %self.stream_name,
            partitions = response.responses.len(),
            "orchestrator: pass finished"
        );
        Ok(response)
    }

    async fn readers(&self) -> Result<&[Arc<ShardReader>], ConsumeError> {
        let readers = self
            .readers
            .get_or_try_init(|| async {
                let partitions = self
                    .source
                    .list_partitions(&self.stream_name)
                    .await
                    .map_err(|source| ConsumeError::Discovery {
                        stream: self.stream_name.clone(),
                        source,
                    })?;

                let mut readers = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    if partition.closed {
                        info!(
                            stream = %self.stream_name,
                            partition = %partition.id,
                            "orchestrator: skipping closed partition"
                        );
                        continue;
                    }
                    readers.push(Arc::new(ShardReader::with_stop_token(
                        self.stream_name.clone(),
                        partition.id,
                        Arc::clone(&self.source),
                        self.config.reader.clone(),
                        self.stop.child_token(),
                    )));
                }
                info!(
                    stream = %self.stream_name,
                    partitions = readers.len(),
                    "orchestrator: partitions discovered"
                );
                Ok::<_, ConsumeError>(readers)
            })
            .await?;
        Ok(readers.as_slice())
    }

    async fn shut_down(&self, readers: &[Arc<ShardReader>], mut tasks: JoinSet<PartitionOutcome>) {
        self.stop.cancel();
        let drained = tokio::time::timeout(self.config.shutdown_grace(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let survivors: Vec<&str> = readers
                .iter()
                .filter(|r| matches!(r.state(), ReaderState::Running | ReaderState::Stopping))
                .map(|r| r.partition_id())
                .collect();
            warn!(
                stream = %self.stream_name,
                survivors = ?survivors,
                grace_ms = self.config.shutdown_grace_ms,
                "orchestrator: readers still running after grace period, aborting"
            );
            tasks.abort_all();
        }
    }
}
