//! Two-phase consumption: replay a store, then tail the live log.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use shardline_core::{
    ConsumeError, InterceptorChain, PartitionResponse, StopCondition, StreamPosition,
};
use shardline_reader::{ChannelOrchestrator, ResponseConsumer};
use shardline_store::MessageStore;
use tracing::{error, info};

use crate::dispatch::MessageDispatcher;

/// Consumer-facing entry point for one channel.
///
/// The first call to [`EventSource::consume_until`] replays the message
/// store (if any) on a blocking worker and closes it, then tails the live
/// log from the position the store reached. Later calls tail from where the
/// previous call ended.
pub struct EventSource {
    name: String,
    channel_name: String,
    resume_from: StreamPosition,
    store: Mutex<Option<Arc<dyn MessageStore>>>,
    orchestrator: Arc<ChannelOrchestrator>,
    interceptors: InterceptorChain,
    dispatcher: Arc<MessageDispatcher>,
}

impl EventSource {
    pub fn new(
        name: impl Into<String>,
        orchestrator: Arc<ChannelOrchestrator>,
        store: Option<Arc<dyn MessageStore>>,
        interceptors: InterceptorChain,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            channel_name: orchestrator.stream_name().to_owned(),
            resume_from: StreamPosition::beginning(),
            store: Mutex::new(store),
            orchestrator,
            interceptors,
            dispatcher,
        }
    }

    /// Position persisted by an earlier run. Replayed store positions win
    /// over it for the partitions they cover.
    pub fn with_resume_position(mut self, position: StreamPosition) -> Self {
        self.resume_from = position;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Position reached by the live phase so far.
    pub fn stream_position(&self) -> StreamPosition {
        self.orchestrator.stream_position()
    }

    pub fn stop(&self) {
        self.orchestrator.stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.orchestrator.is_stopping()
    }

    /// Replay, then tail until `stop_condition` matches every partition.
    /// Returns the position to resume from.
    pub async fn consume_until(
        &self,
        stop_condition: StopCondition,
    ) -> Result<StreamPosition, ConsumeError> {
        let store = self.store.lock().take();
        let replayed = match store {
            Some(store) => self.replay(store).await?,
            None => StreamPosition::beginning(),
        };
        let start = self
            .resume_from
            .merge(&replayed)
            .merge(&self.orchestrator.stream_position());

        let interceptors = self.interceptors.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let consumer: ResponseConsumer = Arc::new(move |response: &PartitionResponse| {
            for message in &response.messages {
                if let Some(message) = interceptors.intercept(message.clone()) {
                    dispatcher.accept(&message);
                }
            }
        });

        info!(
            event_source = %self.name,
            channel = %self.channel_name,
            partitions = start.len(),
            stop_condition = stop_condition.name(),
            "event source: tailing live log"
        );
        match self
            .orchestrator
            .consume_stream(&start, stop_condition, consumer)
            .await
        {
            Ok(_) => Ok(self.orchestrator.stream_position()),
            Err(ConsumeError::Stopped) => {
                info!(
                    event_source = %self.name,
                    channel = %self.channel_name,
                    "event source: stopped before tailing"
                );
                Ok(start)
            }
            Err(e) => Err(e),
        }
    }

    async fn replay(&self, store: Arc<dyn MessageStore>) -> Result<StreamPosition, ConsumeError> {
        let channel_name = self.channel_name.clone();
        let interceptors = self.interceptors.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let worker_store = Arc::clone(&store);

        let joined = self
            .orchestrator
            .pool()
            .spawn_blocking(move || {
                let result = replay_store(&*worker_store, &channel_name, &interceptors, &dispatcher);
                close_store(&*worker_store, &channel_name);
                result
            })
            .await;

        match joined {
            Ok(result) => result,
            Err(join_error) => {
                close_store(&*store, &self.channel_name);
                Err(ConsumeError::Replay {
                    channel: self.channel_name.clone(),
                    detail: join_error.to_string(),
                })
            }
        }
    }
}

fn replay_store(
    store: &dyn MessageStore,
    channel_name: &str,
    interceptors: &InterceptorChain,
    dispatcher: &MessageDispatcher,
) -> Result<StreamPosition, ConsumeError> {
    let mut replayed = 0usize;
    for entry in store.stream_channel(channel_name) {
        if let Some(message) = interceptors.intercept(entry?.message) {
            dispatcher.accept(&message);
        }
        replayed += 1;
    }
    let position = store.latest_stream_position(channel_name);
    info!(
        channel = channel_name,
        store = store.name(),
        messages = replayed,
        partitions = position.len(),
        "event source: store replayed"
    );
    Ok(position)
}

fn close_store(store: &dyn MessageStore, channel_name: &str) {
    if let Err(e) = store.close() {
        error!(channel = channel_name, store = store.name(), error = %e, "failed to close message store");
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.name)
            .field("channel_name", &self.channel_name)
            .field("interceptors", &self.interceptors)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{
        Header, Key, Message, PartitionPosition, StoreError, TextMessage,
    };
    use shardline_reader::{InMemoryChannel, OrchestratorConfig, PartitionSource, WorkerPool};
    use shardline_store::{
        CompactingMessageStore, EntryStream, MessageStoreEntry,
    };
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn orchestrator(channel: &Arc<InMemoryChannel>) -> Arc<ChannelOrchestrator> {
        Arc::new(ChannelOrchestrator::new(
            channel.stream_name(),
            Arc::clone(channel) as Arc<dyn PartitionSource>,
            WorkerPool::current("test").expect("inside runtime"),
            OrchestratorConfig::default(),
        ))
    }

    fn collecting_dispatcher() -> (Arc<MessageDispatcher>, Arc<Mutex<Vec<TextMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Arc::new(MessageDispatcher::new());
        dispatcher.add(Arc::new(move |m: &TextMessage| sink.lock().push(m.clone())));
        (dispatcher, seen)
    }

    /// Store whose stream fails, to check the store is closed on error.
    struct FailingStore {
        closed: AtomicBool,
    }

    impl MessageStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }
        fn add(&self, _entry: MessageStoreEntry) -> Result<(), StoreError> {
            Ok(())
        }
        fn stream(&self) -> EntryStream<'_> {
            Box::new(std::iter::once(Err(StoreError::Snapshot("corrupt".to_owned()))))
        }
        fn size(&self) -> usize {
            0
        }
        fn latest_stream_position(&self, _channel_name: &str) -> StreamPosition {
            StreamPosition::beginning()
        }
        fn channel_names(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }
        fn close(&self) -> Result<(), StoreError> {
            self.closed.store(true, Ordering::SeqCst);
            Err(StoreError::Closed("close failed".to_owned()))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replays_store_then_tails_after_its_position() {
        let channel = Arc::new(InMemoryChannel::with_partitions("orders", ["shard-0"]));
        for i in 0..3 {
            channel
                .append(&Message::of(Key::of(format!("k{i}")), format!("live-{i}")))
                .expect("append");
        }

        let store = Arc::new(CompactingMessageStore::default());
        let snapshot = Message::new(
            Key::of("k0"),
            Header::of(PartitionPosition::at_cursor("shard-0", "0")),
            Some("snapshot-0".to_owned()),
        );
        store
            .add(MessageStoreEntry::of("orders", snapshot))
            .expect("add");
        store
            .add(MessageStoreEntry::of("payments", Message::of(Key::of("p"), "other".to_owned())))
            .expect("add");

        let (dispatcher, seen) = collecting_dispatcher();
        let source = EventSource::new(
            "orders-source",
            orchestrator(&channel),
            Some(store.clone() as Arc<dyn MessageStore>),
            InterceptorChain::new(),
            dispatcher,
        );

        let position = source
            .consume_until(StopCondition::end_of_partition())
            .await
            .expect("consumed");

        let payloads: Vec<_> = seen
            .lock()
            .iter()
            .filter_map(|m| m.payload.clone())
            .collect();
        assert_eq!(payloads, ["snapshot-0", "live-1", "live-2"]);
        assert_eq!(position.partition("shard-0").cursor(), Some("2"));
        assert!(matches!(
            store.add(MessageStoreEntry::of("orders", Message::of(Key::of("x"), "y".to_owned()))),
            Err(StoreError::Closed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interceptors_apply_to_both_phases() {
        let channel = Arc::new(InMemoryChannel::with_partitions("orders", ["shard-0"]));
        channel
            .append(&Message::of(Key::of("drop-live"), "x".to_owned()))
            .expect("append");
        channel
            .append(&Message::of(Key::of("keep-live"), "y".to_owned()))
            .expect("append");

        let store = Arc::new(CompactingMessageStore::default());
        store
            .add(MessageStoreEntry::of("orders", Message::of(Key::of("drop-replay"), "z".to_owned())))
            .expect("add");

        let chain = InterceptorChain::new().with(|m: TextMessage| {
            (!m.key.compaction_key().starts_with("drop")).then_some(m)
        });
        let (dispatcher, seen) = collecting_dispatcher();
        let source = EventSource::new(
            "orders-source",
            orchestrator(&channel),
            Some(store as Arc<dyn MessageStore>),
            chain,
            dispatcher,
        );
        source
            .consume_until(StopCondition::end_of_partition())
            .await
            .expect("consumed");

        let keys: Vec<_> = seen.lock().iter().map(|m| m.key.to_string()).collect();
        assert_eq!(keys, ["keep-live"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replay_failure_closes_store_and_surfaces() {
        let channel = Arc::new(InMemoryChannel::with_partitions("orders", ["shard-0"]));
        let store = Arc::new(FailingStore {
            closed: AtomicBool::new(false),
        });
        let (dispatcher, _) = collecting_dispatcher();
        let source = EventSource::new(
            "orders-source",
            orchestrator(&channel),
            Some(store.clone() as Arc<dyn MessageStore>),
            InterceptorChain::new(),
            dispatcher,
        );

        let err = source
            .consume_until(StopCondition::end_of_partition())
            .await
            .expect_err("replay failure");
        assert!(matches!(err, ConsumeError::Store(StoreError::Snapshot(_))));
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_call_resumes_without_replay() {
        let channel = Arc::new(InMemoryChannel::with_partitions("orders", ["shard-0"]));
        channel
            .append(&Message::of(Key::of("a"), "1".to_owned()))
            .expect("append");
        let (dispatcher, seen) = collecting_dispatcher();
        let source = EventSource::new(
            "orders-source",
            orchestrator(&channel),
            None,
            InterceptorChain::new(),
            dispatcher,
        );

        source
            .consume_until(StopCondition::end_of_partition())
            .await
            .expect("first");
        channel
            .append(&Message::of(Key::of("b"), "2".to_owned()))
            .expect("append");
        let position = source
            .consume_until(StopCondition::end_of_partition())
            .await
            .expect("second");

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(position.partition("shard-0").cursor(), Some("1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_before_tailing_returns_replayed_position() {
        let channel = Arc::new(InMemoryChannel::with_partitions("orders", ["shard-0"]));
        let store = Arc::new(CompactingMessageStore::default());
        store
            .add(MessageStoreEntry::of(
                "orders",
                Message::new(
                    Key::of("a"),
                    Header::of(PartitionPosition::at_cursor("shard-0", "41")),
                    Some("v".to_owned()),
                ),
            ))
            .expect("add");
        let (dispatcher, _) = collecting_dispatcher();
        let source = EventSource::new(
            "orders-source",
            orchestrator(&channel),
            Some(store as Arc<dyn MessageStore>),
            InterceptorChain::new(),
            dispatcher,
        );

        source.stop();
        let position = source
            .consume_until(StopCondition::shutdown())
            .await
            .expect("stopped");
        assert_eq!(position.partition("shard-0").cursor(), Some("41"));
    }
}
