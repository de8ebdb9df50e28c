//! Snapshot files: a compacted, point-in-time copy of one channel.
//!
//! Format (JSON lines):
//! ```text
//! {"channel_name":"orders","stream_position":{...},"created_at":"...","message_count":2}
//! {"key":{...},"header":{...},"payload":"..."}
//! {"key":{...},"header":{...},"payload":null}
//! ```
//! The first line is the metadata; every following line is one message.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shardline_core::{StoreError, StreamPosition, TextMessage};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::store::{EntryStream, MessageStore, MessageStoreEntry};

const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub channel_name: String,
    pub stream_position: StreamPosition,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
}

// ─── File naming ──────────────────────────────────────────────────

fn file_prefix(channel_name: &str) -> String {
    format!("compaction-{channel_name}-snapshot-")
}

/// `compaction-{channel}-snapshot-{YYYY-MM-DDTHH-MMZ}-{millis}.jsonl`
pub fn snapshot_file_name(channel_name: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}{}-{}{FILE_SUFFIX}",
        file_prefix(channel_name),
        created_at.format("%Y-%m-%dT%H-%MZ"),
        created_at.timestamp_millis()
    )
}

/// Creation time in epoch millis encoded in a snapshot file name of
/// `channel_name`, or `None` for any other file.
fn snapshot_millis(channel_name: &str, file_name: &str) -> Option<i64> {
    let rest = file_name
        .strip_prefix(&file_prefix(channel_name))?
        .strip_suffix(FILE_SUFFIX)?;
    let (_, millis) = rest.rsplit_once('-')?;
    millis.parse().ok()
}

fn snapshots_of(dir: &Path, channel_name: &str) -> Result<Vec<(i64, PathBuf)>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(millis) = snapshot_millis(channel_name, file_name) {
            found.push((millis, dir_entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

/// Newest snapshot of `channel_name` in `dir`, by the time in its name.
pub fn latest_snapshot(dir: &Path, channel_name: &str) -> Result<Option<PathBuf>, StoreError> {
    Ok(snapshots_of(dir, channel_name)?
        .pop()
        .map(|(_, path)| path))
}

/// Delete every snapshot of `channel_name` except `keep`. Returns the number
/// of files removed.
pub fn prune_snapshots(dir: &Path, channel_name: &str, keep: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    for (_, path) in snapshots_of(dir, channel_name)? {
        if path == keep {
            continue;
        }
        fs::remove_file(&path)?;
        debug!(path = %path.display(), channel = channel_name, "removed old snapshot");
        removed += 1;
    }
    Ok(removed)
}

// ─── Writer ───────────────────────────────────────────────────────

/// Writes snapshot files into one directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every message of `channel_name` held by `store`, tagged with
    /// `stream_position`. The file appears atomically under its final name.
    pub fn write(
        &self,
        store: &dyn MessageStore,
        channel_name: &str,
        stream_position: &StreamPosition,
        created_at: DateTime<Utc>,
    ) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir)?;

        let messages = store
            .stream_channel(channel_name)
            .map(|entry| entry.map(|e| e.message))
            .collect::<Result<Vec<_>, _>>()?;
        let metadata = SnapshotMetadata {
            channel_name: channel_name.to_owned(),
            stream_position: stream_position.clone(),
            created_at,
            message_count: messages.len(),
        };

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            writeln!(writer, "{}", serde_json::to_string(&metadata)?)?;
            for message in &messages {
                writeln!(writer, "{}", serde_json::to_string(message)?)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        let path = self.dir.join(snapshot_file_name(channel_name, created_at));
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        info!(
            channel = channel_name,
            messages = messages.len(),
            path = %path.display(),
            "snapshot written"
        );
        Ok(path)
    }
}

// ─── Reader ───────────────────────────────────────────────────────

pub struct SnapshotReader;

impl SnapshotReader {
    /// Metadata line only.
    pub fn read_metadata(path: &Path) -> Result<SnapshotMetadata, StoreError> {
        let mut lines = BufReader::new(File::open(path)?).lines();
        let first = lines
            .next()
            .ok_or_else(|| StoreError::Snapshot(format!("{} is empty", path.display())))??;
        Ok(serde_json::from_str(&first)?)
    }

    /// Add every message of the snapshot at `path` to `store`.
    pub fn load(path: &Path, store: &dyn MessageStore) -> Result<SnapshotMetadata, StoreError> {
        let mut lines = BufReader::new(File::open(path)?).lines();
        let first = lines
            .next()
            .ok_or_else(|| StoreError::Snapshot(format!("{} is empty", path.display())))??;
        let metadata: SnapshotMetadata = serde_json::from_str(&first)
            .map_err(|e| StoreError::Snapshot(format!("bad metadata in {}: {e}", path.display())))?;

        let mut loaded = 0;
        for (line_num, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let message: TextMessage = serde_json::from_str(&line).map_err(|e| {
                StoreError::Snapshot(format!("{} line {}: {e}", path.display(), line_num + 2))
            })?;
            store.add(MessageStoreEntry::of(metadata.channel_name.clone(), message))?;
            loaded += 1;
        }

        if loaded != metadata.message_count {
            warn!(
                path = %path.display(),
                expected = metadata.message_count,
                found = loaded,
                "snapshot message count mismatch"
            );
        }
        info!(
            channel = %metadata.channel_name,
            messages = loaded,
            path = %path.display(),
            "snapshot loaded"
        );
        Ok(metadata)
    }
}

// ─── Snapshot-backed store ────────────────────────────────────────

/// A store pre-populated from a snapshot file.
///
/// The snapshot's own position is merged under the positions of the
/// entries, so a channel whose snapshot holds no messages for a partition
/// still resumes where the snapshot left off.
pub struct SnapshotMessageStore<S> {
    inner: S,
    metadata: SnapshotMetadata,
}

impl<S: MessageStore> SnapshotMessageStore<S> {
    pub fn load(path: &Path, inner: S) -> Result<Self, StoreError> {
        let metadata = SnapshotReader::load(path, &inner)?;
        Ok(Self { inner, metadata })
    }

    /// Load the newest snapshot of `channel_name` in `dir`, or wrap `inner`
    /// unchanged with an empty metadata when there is none.
    pub fn load_latest(dir: &Path, channel_name: &str, inner: S) -> Result<Self, StoreError> {
        match latest_snapshot(dir, channel_name)? {
            Some(path) => Self::load(&path, inner),
            None => {
                debug!(channel = channel_name, dir = %dir.display(), "no snapshot found");
                Ok(Self {
                    inner,
                    metadata: SnapshotMetadata {
                        channel_name: channel_name.to_owned(),
                        stream_position: StreamPosition::beginning(),
                        created_at: Utc::now(),
                        message_count: 0,
                    },
                })
            }
        }
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: MessageStore> MessageStore for SnapshotMessageStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn add(&self, entry: MessageStoreEntry) -> Result<(), StoreError> {
        self.inner.add(entry)
    }

    fn stream(&self) -> EntryStream<'_> {
        self.inner.stream()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn latest_stream_position(&self, channel_name: &str) -> StreamPosition {
        let entries = self.inner.latest_stream_position(channel_name);
        if channel_name == self.metadata.channel_name {
            self.metadata.stream_position.merge(&entries)
        } else {
            entries
        }
    }

    fn channel_names(&self) -> BTreeSet<String> {
        let mut names = self.inner.channel_names();
        names.insert(self.metadata.channel_name.clone());
        names
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compacting::CompactingMessageStore;
    use chrono::TimeZone;
    use shardline_core::{Header, Key, Message, PartitionPosition};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0)
            .single()
            .expect("valid datetime")
    }

    fn filled_store() -> CompactingMessageStore {
        let store = CompactingMessageStore::default();
        for (key, seq) in [("a", 1), ("b", 2), ("a", 3)] {
            let message = Message::new(
                Key::of(key),
                Header::of(PartitionPosition::at_cursor("shard-0", seq.to_string())),
                Some(format!("v{seq}")),
            );
            store.add(MessageStoreEntry::of("orders", message)).expect("add");
        }
        store
            .add(MessageStoreEntry::of("other", Message::of(Key::of("x"), "y".to_owned())))
            .expect("add");
        store
    }

    #[test]
    fn file_name_follows_pattern() {
        let name = snapshot_file_name("orders", at(5));
        assert_eq!(
            name,
            format!("compaction-orders-snapshot-2026-03-01T12-05Z-{}.jsonl", at(5).timestamp_millis())
        );
        assert_eq!(snapshot_millis("orders", &name), Some(at(5).timestamp_millis()));
        assert_eq!(snapshot_millis("order", &name), None);
        assert_eq!(snapshot_millis("orders", "compaction-orders-snapshot-x.tmp"), None);
    }

    #[test]
    fn write_then_load_restores_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = filled_store();
        let position = source.latest_stream_position("orders");
        let path = SnapshotWriter::new(dir.path())
            .write(&source, "orders", &position, at(0))
            .expect("write");

        let target = CompactingMessageStore::default();
        let metadata = SnapshotReader::load(&path, &target).expect("load");
        assert_eq!(metadata.channel_name, "orders");
        assert_eq!(metadata.stream_position, position);
        assert_eq!(metadata.message_count, 2);
        assert_eq!(target.size(), 2);
        assert_eq!(target.channel_names().into_iter().collect::<Vec<_>>(), ["orders"]);
        assert_eq!(
            SnapshotReader::read_metadata(&path).expect("metadata"),
            metadata
        );
    }

    #[test]
    fn latest_snapshot_picks_newest_and_prune_keeps_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = SnapshotWriter::new(dir.path());
        let store = filled_store();
        let position = StreamPosition::beginning();
        writer.write(&store, "orders", &position, at(1)).expect("write");
        let newest = writer.write(&store, "orders", &position, at(30)).expect("write");
        writer.write(&store, "orders", &position, at(10)).expect("write");
        writer.write(&store, "other", &position, at(59)).expect("write");

        let latest = latest_snapshot(dir.path(), "orders").expect("scan");
        assert_eq!(latest.as_deref(), Some(newest.as_path()));

        let removed = prune_snapshots(dir.path(), "orders", &newest).expect("prune");
        assert_eq!(removed, 2);
        assert!(newest.exists());
        assert!(latest_snapshot(dir.path(), "other").expect("scan").is_some());
    }

    #[test]
    fn missing_directory_has_no_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(latest_snapshot(&missing, "orders").expect("scan").is_none());
    }

    #[test]
    fn snapshot_store_merges_snapshot_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = CompactingMessageStore::default();
        source
            .add(MessageStoreEntry::of(
                "orders",
                Message::new(
                    Key::of("a"),
                    Header::of(PartitionPosition::at_cursor("shard-0", "7")),
                    Some("v".to_owned()),
                ),
            ))
            .expect("add");
        let position = StreamPosition::of([
            PartitionPosition::at_cursor("shard-0", "7"),
            PartitionPosition::at_cursor("shard-1", "42"),
        ]);
        SnapshotWriter::new(dir.path())
            .write(&source, "orders", &position, at(0))
            .expect("write");

        let store = SnapshotMessageStore::load_latest(dir.path(), "orders", CompactingMessageStore::default())
            .expect("load");
        assert_eq!(store.size(), 1);
        assert_eq!(store.latest_stream_position("orders"), position);
        assert_eq!(store.latest_stream_position("other"), StreamPosition::beginning());
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(snapshot_file_name("orders", at(0)));
        fs::write(&path, "").expect("write");
        let err = SnapshotReader::load(&path, &CompactingMessageStore::default())
            .expect_err("empty snapshot");
        assert!(matches!(err, StoreError::Snapshot(_)));
    }
}
