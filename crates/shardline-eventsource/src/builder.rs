//! Assembly of an [`EventSource`] from its parts.

use std::sync::Arc;

use shardline_core::{
    EndpointType, InterceptorChain, InterceptorRegistry, MessageInterceptor, StreamPosition,
};
use shardline_reader::{ChannelOrchestrator, OrchestratorConfig, PartitionSource, WorkerPool};
use shardline_store::MessageStore;

use crate::dispatch::{MessageConsumer, MessageDispatcher};
use crate::event_source::EventSource;

pub struct EventSourceBuilder {
    name: String,
    channel_name: String,
    source: Arc<dyn PartitionSource>,
    pool: WorkerPool,
    config: OrchestratorConfig,
    store: Option<Arc<dyn MessageStore>>,
    resume_from: StreamPosition,
    interceptors: InterceptorChain,
    dispatcher: Arc<MessageDispatcher>,
}

impl EventSourceBuilder {
    pub fn new(
        name: impl Into<String>,
        channel_name: impl Into<String>,
        source: Arc<dyn PartitionSource>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            name: name.into(),
            channel_name: channel_name.into(),
            source,
            pool,
            config: OrchestratorConfig::default(),
            store: None,
            resume_from: StreamPosition::beginning(),
            interceptors: InterceptorChain::new(),
            dispatcher: Arc::new(MessageDispatcher::new()),
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Store replayed before the live log.
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the live phase from a persisted position.
    pub fn resume_from(mut self, position: StreamPosition) -> Self {
        self.resume_from = position;
        self
    }

    pub fn interceptor(mut self, interceptor: impl MessageInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append the receiver chain the registry holds for this channel.
    pub fn interceptors_from(mut self, registry: &InterceptorRegistry) -> Self {
        let chain = registry.chain_for(&self.channel_name, EndpointType::Receiver);
        self.interceptors.extend(&chain);
        self
    }

    pub fn consumer(self, consumer: Arc<dyn MessageConsumer>) -> Self {
        self.dispatcher.add(consumer);
        self
    }

    pub fn build(self) -> EventSource {
        let orchestrator = ChannelOrchestrator::new(
            self.channel_name,
            self.source,
            self.pool,
            self.config,
        );
        EventSource::new(
            self.name,
            Arc::new(orchestrator),
            self.store,
            self.interceptors,
            self.dispatcher,
        )
        .with_resume_position(self.resume_from)
    }
}
