//! Snapshot compaction of a channel.
//!
//! A pass loads the newest snapshot of the channel into a compacting store,
//! reads the live log from the snapshot's position up to the end of every
//! partition, writes the result as a new snapshot and removes the older
//! ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use shardline_core::{
    ConsumeError, PartitionResponse, StopCondition, StoreError, StreamPosition,
};
use shardline_reader::{
    ChannelOrchestrator, OrchestratorConfig, PartitionSource, ResponseConsumer, WorkerPool,
};
use shardline_store::{
    CompactingMessageStore, MessageStore, MessageStoreEntry, SnapshotMessageStore, SnapshotWriter,
    prune_snapshots,
};
use tracing::{error, info};

type CompactionStore = SnapshotMessageStore<CompactingMessageStore>;

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub path: PathBuf,
    pub position: StreamPosition,
    /// Messages in the new snapshot.
    pub messages: usize,
    /// Older snapshots removed.
    pub pruned: usize,
}

pub struct CompactionService {
    source: Arc<dyn PartitionSource>,
    pool: WorkerPool,
    config: OrchestratorConfig,
    snapshot_dir: PathBuf,
    remove_tombstones: bool,
}

impl CompactionService {
    pub fn new(
        source: Arc<dyn PartitionSource>,
        pool: WorkerPool,
        config: OrchestratorConfig,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            pool,
            config,
            snapshot_dir: snapshot_dir.into(),
            remove_tombstones: true,
        }
    }

    /// Keep tombstones in the snapshot instead of dropping the key.
    pub fn keep_tombstones(mut self) -> Self {
        self.remove_tombstones = false;
        self
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub async fn compact(&self, channel_name: &str) -> Result<CompactionReport, ConsumeError> {
        let store = Arc::new(self.load_store(channel_name).await?);
        let start = store.latest_stream_position(channel_name);
        info!(
            channel = channel_name,
            loaded = store.size(),
            partitions = start.len(),
            "compaction: started"
        );

        let orchestrator = ChannelOrchestrator::new(
            channel_name,
            Arc::clone(&self.source),
            self.pool.clone(),
            self.config.clone(),
        );
        let add_failure: Arc<Mutex<Option<StoreError>>> = Arc::new(Mutex::new(None));
        let consumer: ResponseConsumer = {
            let store = Arc::clone(&store);
            let add_failure = Arc::clone(&add_failure);
            let channel_name = channel_name.to_owned();
            Arc::new(move |response: &PartitionResponse| {
                for message in &response.messages {
                    if let Err(e) = store.add(MessageStoreEntry::of(&channel_name, message.clone())) {
                        let mut failure = add_failure.lock();
                        if failure.is_none() {
                            *failure = Some(e);
                        }
                        return;
                    }
                }
            })
        };
        orchestrator
            .consume_stream(&start, StopCondition::end_of_partition(), consumer)
            .await?;
        if let Some(e) = add_failure.lock().take() {
            return Err(e.into());
        }

        let position = orchestrator.stream_position();
        let report = self.write_snapshot(store, channel_name, position).await?;
        info!(
            channel = channel_name,
            messages = report.messages,
            pruned = report.pruned,
            path = %report.path.display(),
            "compaction: finished"
        );
        Ok(report)
    }

    async fn load_store(&self, channel_name: &str) -> Result<CompactionStore, ConsumeError> {
        let dir = self.snapshot_dir.clone();
        let channel = channel_name.to_owned();
        let remove_tombstones = self.remove_tombstones;
        let loaded = self
            .pool
            .spawn_blocking(move || {
                SnapshotMessageStore::load_latest(
                    &dir,
                    &channel,
                    CompactingMessageStore::new(remove_tombstones),
                )
            })
            .await
            .map_err(|e| ConsumeError::Replay {
                channel: channel_name.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(loaded?)
    }

    async fn write_snapshot(
        &self,
        store: Arc<CompactionStore>,
        channel_name: &str,
        position: StreamPosition,
    ) -> Result<CompactionReport, ConsumeError> {
        let writer = SnapshotWriter::new(self.snapshot_dir.clone());
        let channel = channel_name.to_owned();
        let written = self
            .pool
            .spawn_blocking(move || {
                let result = write_and_prune(&writer, &*store, &channel, position);
                if let Err(e) = store.close() {
                    error!(channel = %channel, error = %e, "failed to close compaction store");
                }
                result
            })
            .await
            .map_err(|e| ConsumeError::Replay {
                channel: channel_name.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(written?)
    }
}

fn write_and_prune(
    writer: &SnapshotWriter,
    store: &dyn MessageStore,
    channel_name: &str,
    position: StreamPosition,
) -> Result<CompactionReport, StoreError> {
    let path = writer.write(store, channel_name, &position, Utc::now())?;
    let pruned = prune_snapshots(writer.dir(), channel_name, &path)?;
    let messages = store.stream_channel(channel_name).count();
    Ok(CompactionReport {
        path,
        position,
        messages,
        pruned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{Header, Key, Message};
    use shardline_reader::InMemoryChannel;
    use shardline_store::{SnapshotReader, latest_snapshot};

    fn service(channel: &Arc<InMemoryChannel>, dir: &Path) -> CompactionService {
        CompactionService::new(
            Arc::clone(channel) as Arc<dyn PartitionSource>,
            WorkerPool::current("compaction").expect("inside runtime"),
            OrchestratorConfig::default(),
            dir,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compacts_latest_values_and_drops_tombstones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Arc::new(InMemoryChannel::new("products", 2));
        for (key, value) in [("a", "1"), ("b", "1"), ("a", "2"), ("c", "1")] {
            channel
                .append(&Message::of(Key::of(key), value.to_owned()))
                .expect("append");
        }
        channel
            .append(&Message::tombstone(Key::of("b"), Header::default()))
            .expect("append");

        let report = service(&channel, dir.path())
            .compact("products")
            .await
            .expect("compacted");

        assert_eq!(report.messages, 2);
        assert_eq!(report.pruned, 0);
        let store = CompactingMessageStore::default();
        let metadata = SnapshotReader::load(&report.path, &store).expect("load");
        assert_eq!(metadata.stream_position, report.position);
        let mut values: Vec<_> = store
            .stream()
            .map(|e| {
                let e = e.expect("entry");
                (e.message.key.to_string(), e.message.payload)
            })
            .collect();
        values.sort();
        assert_eq!(
            values,
            [
                ("a".to_owned(), Some("2".to_owned())),
                ("c".to_owned(), Some("1".to_owned())),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_pass_starts_from_snapshot_and_prunes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Arc::new(InMemoryChannel::new("products", 1));
        channel
            .append(&Message::of(Key::of("a"), "1".to_owned()))
            .expect("append");
        let first = service(&channel, dir.path())
            .compact("products")
            .await
            .expect("first pass");
        assert_eq!(first.position.partition("shard-0").cursor(), Some("0"));

        // Expire the compacted record: the second pass must not need it.
        channel.trim("shard-0", 1).expect("trim");
        channel
            .append(&Message::of(Key::of("b"), "1".to_owned()))
            .expect("append");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let second = service(&channel, dir.path())
            .compact("products")
            .await
            .expect("second pass");
        assert_eq!(second.messages, 2);
        assert_eq!(second.pruned, 1);
        assert_eq!(second.position.partition("shard-0").cursor(), Some("1"));
        assert_eq!(
            latest_snapshot(dir.path(), "products").expect("list"),
            Some(second.path.clone())
        );
        assert!(!first.path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_tombstones_retains_deleted_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Arc::new(InMemoryChannel::new("products", 1));
        channel
            .append(&Message::of(Key::of("a"), "1".to_owned()))
            .expect("append");
        channel
            .append(&Message::tombstone(Key::of("a"), Header::default()))
            .expect("append");

        let report = service(&channel, dir.path())
            .keep_tombstones()
            .compact("products")
            .await
            .expect("compacted");
        assert_eq!(report.messages, 1);
    }
}
