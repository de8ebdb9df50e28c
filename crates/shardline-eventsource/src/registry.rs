//! Named event sources of an application, at most one per channel.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::event_source::EventSource;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an event source named {0} is already registered")]
    DuplicateName(String),

    #[error("channel {channel} is already consumed by event source {existing}")]
    DuplicateChannel { channel: String, existing: String },
}

#[derive(Debug, Default)]
pub struct EventSourceRegistry {
    sources: RwLock<IndexMap<String, Arc<EventSource>>>,
}

impl EventSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: EventSource) -> Result<Arc<EventSource>, RegistryError> {
        let mut sources = self.sources.write();
        if sources.contains_key(source.name()) {
            return Err(RegistryError::DuplicateName(source.name().to_owned()));
        }
        if let Some(existing) = sources
            .values()
            .find(|s| s.channel_name() == source.channel_name())
        {
            return Err(RegistryError::DuplicateChannel {
                channel: source.channel_name().to_owned(),
                existing: existing.name().to_owned(),
            });
        }
        info!(
            event_source = source.name(),
            channel = source.channel_name(),
            "registry: event source registered"
        );
        let source = Arc::new(source);
        sources.insert(source.name().to_owned(), Arc::clone(&source));
        Ok(source)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EventSource>> {
        self.sources.read().get(name).cloned()
    }

    pub fn for_channel(&self, channel_name: &str) -> Option<Arc<EventSource>> {
        self.sources
            .read()
            .values()
            .find(|s| s.channel_name() == channel_name)
            .cloned()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    pub fn stop_all(&self) {
        for source in self.sources.read().values() {
            source.stop();
        }
    }
}
