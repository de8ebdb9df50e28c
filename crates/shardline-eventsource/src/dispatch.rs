//! Delivery of intercepted messages to application consumers.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use shardline_core::{Key, Message, TextMessage};
use tracing::{trace, warn};

/// Which keys a consumer is interested in, matched on the compaction key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyFilter {
    #[default]
    All,
    Exact(String),
    Prefix(String),
}

impl KeyFilter {
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Self::All => true,
            Self::Exact(expected) => key.compaction_key() == expected,
            Self::Prefix(prefix) => key.compaction_key().starts_with(prefix.as_str()),
        }
    }
}

/// Application callback. Called from replay and partition workers
/// concurrently.
pub trait MessageConsumer: Send + Sync {
    fn accept(&self, message: &TextMessage);

    fn key_filter(&self) -> &KeyFilter {
        &ALL_KEYS
    }
}

static ALL_KEYS: KeyFilter = KeyFilter::All;

/// Fans every message out to the consumers whose key filter matches.
#[derive(Default)]
pub struct MessageDispatcher {
    consumers: RwLock<Vec<Arc<dyn MessageConsumer>>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, consumer: Arc<dyn MessageConsumer>) {
        self.consumers.write().push(consumer);
    }

    pub fn len(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.read().is_empty()
    }

    pub fn accept(&self, message: &TextMessage) {
        for consumer in self.consumers.read().iter() {
            if consumer.key_filter().matches(&message.key) {
                consumer.accept(message);
            }
        }
    }
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("consumers", &self.len())
            .finish()
    }
}

type Handler<P> = Box<dyn Fn(Message<P>) + Send + Sync>;

/// Decodes the payload as JSON into `P` before calling the handler.
/// Tombstones reach the handler with a `None` payload; payloads that fail
/// to decode are logged and skipped.
pub struct JsonMessageConsumer<P> {
    name: String,
    filter: KeyFilter,
    handler: Handler<P>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: DeserializeOwned> JsonMessageConsumer<P> {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message<P>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            filter: KeyFilter::All,
            handler: Box::new(handler),
            _payload: PhantomData,
        }
    }

    pub fn with_key_filter(mut self, filter: KeyFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P: DeserializeOwned> MessageConsumer for JsonMessageConsumer<P> {
    fn accept(&self, message: &TextMessage) {
        let payload = match message.payload.as_deref().map(serde_json::from_str::<P>) {
            None => None,
            Some(Ok(payload)) => Some(payload),
            Some(Err(e)) => {
                warn!(
                    consumer = %self.name,
                    key = %message.key,
                    error = %e,
                    "undecodable payload skipped"
                );
                return;
            }
        };
        trace!(consumer = %self.name, key = %message.key, "dispatching message");
        (self.handler)(Message::new(message.key.clone(), message.header.clone(), payload));
    }

    fn key_filter(&self) -> &KeyFilter {
        &self.filter
    }
}

impl<F> MessageConsumer for F
where
    F: Fn(&TextMessage) + Send + Sync,
{
    fn accept(&self, message: &TextMessage) {
        self(message)
    }
}
