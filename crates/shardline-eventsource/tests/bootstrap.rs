use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use shardline_core::{
    Header, Key, Message, PartitionPosition, StopCondition, StreamPosition, TextMessage,
};
use shardline_eventsource::{
    CompactionService, EventSourceBuilder, JsonMessageConsumer, KeyFilter, MessageConsumer,
};
use shardline_reader::{
    FileChannel, InMemoryChannel, OrchestratorConfig, PartitionSource, WorkerPool,
};
use shardline_store::{
    CompactingMessageStore, MessageStore, MessageStoreEntry, RingBufferMessageStore,
    SnapshotMessageStore,
};

const SHARDS: usize = 5;
const HISTORY: usize = 1000;
const LIVE: usize = 10;
const KEYS_PER_SHARD: usize = 100;

fn key(shard: usize, seq: usize) -> Key {
    Key::compound(format!("shard-{shard}"), format!("{shard}-{}", seq % KEYS_PER_SHARD))
}

fn append_range(channel: &InMemoryChannel, seqs: std::ops::Range<usize>) {
    for shard in 0..SHARDS {
        for seq in seqs.clone() {
            channel
                .append_to(
                    &format!("shard-{shard}"),
                    &Message::of(key(shard, seq), seq.to_string()),
                    Utc::now(),
                )
                .expect("append");
        }
    }
}

fn pool() -> WorkerPool {
    WorkerPool::current("bootstrap").expect("inside runtime")
}

fn collector() -> (Arc<dyn MessageConsumer>, Arc<Mutex<Vec<TextMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer: Arc<dyn MessageConsumer> =
        Arc::new(move |m: &TextMessage| sink.lock().push(m.clone()));
    (consumer, seen)
}

fn seq_of(message: &TextMessage) -> usize {
    message
        .payload
        .as_deref()
        .and_then(|p| p.parse().ok())
        .expect("numeric payload")
}

/// Snapshot of 5 x 1000 records, then 10 live records per shard: the live
/// phase must deliver exactly the records written after the snapshot.
#[tokio::test(flavor = "multi_thread")]
async fn snapshot_replay_then_live_tail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let channel = Arc::new(InMemoryChannel::new("orders", SHARDS));
    append_range(&channel, 0..HISTORY);

    let report = CompactionService::new(
        Arc::clone(&channel) as Arc<dyn PartitionSource>,
        pool(),
        OrchestratorConfig::default(),
        dir.path(),
    )
    .compact("orders")
    .await
    .expect("compacted");
    assert_eq!(report.messages, SHARDS * KEYS_PER_SHARD);
    for shard in 0..SHARDS {
        assert_eq!(
            report.position.partition(&format!("shard-{shard}")).cursor(),
            Some("999")
        );
    }

    append_range(&channel, HISTORY..HISTORY + LIVE);

    let store = SnapshotMessageStore::load_latest(
        dir.path(),
        "orders",
        CompactingMessageStore::default(),
    )
    .expect("snapshot store");
    let (consumer, seen) = collector();
    let source = EventSourceBuilder::new(
        "orders-source",
        "orders",
        Arc::clone(&channel) as Arc<dyn PartitionSource>,
        pool(),
    )
    .store(Arc::new(store))
    .consumer(consumer)
    .build();

    let position = source
        .consume_until(StopCondition::end_of_partition())
        .await
        .expect("consumed");

    let seen = seen.lock();
    let (live, replayed): (Vec<_>, Vec<_>) = seen.iter().partition(|m| seq_of(m) >= HISTORY);
    assert_eq!(replayed.len(), SHARDS * KEYS_PER_SHARD);
    assert!(replayed.iter().all(|m| seq_of(m) >= HISTORY - KEYS_PER_SHARD));
    assert_eq!(live.len(), SHARDS * LIVE);
    for shard in 0..SHARDS {
        let partition = format!("shard-{shard}");
        let shard_live: Vec<usize> = live
            .iter()
            .filter(|m| m.key.partition_key() == partition)
            .map(|m| seq_of(m))
            .collect();
        assert_eq!(shard_live, (HISTORY..HISTORY + LIVE).collect::<Vec<_>>());
        assert_eq!(position.partition(&partition).cursor(), Some("1009"));
    }
}

/// A store positioned part-way through a partition resumes right after it,
/// and partitions the store never saw start at their beginning.
#[tokio::test(flavor = "multi_thread")]
async fn ring_buffer_store_positions_the_live_phase() {
    let channel = Arc::new(InMemoryChannel::new("orders", 2));
    for seq in 0..4 {
        channel
            .append_to("shard-0", &Message::of(key(0, seq), seq.to_string()), Utc::now())
            .expect("append");
    }
    channel
        .append_to("shard-1", &Message::of(key(1, 0), "0".to_owned()), Utc::now())
        .expect("append");

    let store = RingBufferMessageStore::new(1);
    store
        .add(MessageStoreEntry::of(
            "orders",
            Message::new(
                key(0, 1),
                Header::of(PartitionPosition::at_cursor("shard-0", "1")),
                Some("1".to_owned()),
            ),
        ))
        .expect("add");

    let (consumer, seen) = collector();
    let source = EventSourceBuilder::new(
        "orders-source",
        "orders",
        Arc::clone(&channel) as Arc<dyn PartitionSource>,
        pool(),
    )
    .store(Arc::new(store))
    .consumer(consumer)
    .build();
    source
        .consume_until(StopCondition::end_of_partition())
        .await
        .expect("consumed");

    let mut delivered: Vec<(String, usize)> = seen
        .lock()
        .iter()
        .map(|m| (m.key.partition_key().to_owned(), seq_of(m)))
        .collect();
    delivered.sort();
    assert_eq!(
        delivered,
        [
            ("shard-0".to_owned(), 1),
            ("shard-0".to_owned(), 2),
            ("shard-0".to_owned(), 3),
            ("shard-1".to_owned(), 0),
        ]
    );
}

#[derive(Debug, Deserialize, PartialEq)]
struct Order {
    id: u32,
    total: u32,
}

/// File-backed log: typed consumers, a persisted position, and a second
/// process resuming from it.
#[tokio::test(flavor = "multi_thread")]
async fn file_channel_resume_from_persisted_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    let channel = FileChannel::new(dir.path());
    channel.create_stream("orders", 2).await.expect("create");
    for id in 0..6u32 {
        let payload = format!(r#"{{"id":{id},"total":{}}}"#, id * 10);
        channel
            .append("orders", &Message::of(Key::of(format!("order-{id}")), payload))
            .await
            .expect("append");
    }

    let orders = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&orders);
    let typed = JsonMessageConsumer::<Order>::new("orders", move |m| {
        sink.lock().extend(m.payload);
    })
    .with_key_filter(KeyFilter::Prefix("order-".to_owned()));

    let first = EventSourceBuilder::new(
        "orders-source",
        "orders",
        Arc::new(channel.clone()) as Arc<dyn PartitionSource>,
        pool(),
    )
    .consumer(Arc::new(typed))
    .build();
    let position = first
        .consume_until(StopCondition::end_of_partition())
        .await
        .expect("first run");
    assert_eq!(orders.lock().len(), 6);
    assert!(orders.lock().contains(&Order { id: 5, total: 50 }));

    let persisted = serde_json::to_string(&position).expect("serialize");
    let restored: StreamPosition = serde_json::from_str(&persisted).expect("deserialize");

    channel
        .append(
            "orders",
            &Message::of(Key::of("order-6"), r#"{"id":6,"total":60}"#.to_owned()),
        )
        .await
        .expect("append");

    let (consumer, seen) = collector();
    let second = EventSourceBuilder::new(
        "orders-source",
        "orders",
        Arc::new(channel.clone()) as Arc<dyn PartitionSource>,
        pool(),
    )
    .resume_from(restored)
    .consumer(consumer)
    .build();
    second
        .consume_until(StopCondition::end_of_partition())
        .await
        .expect("second run");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].key, Key::of("order-6"));
}
