//! shardline-eventsource: the consumer-facing layer.
//!
//! An [`EventSource`] replays a [`MessageStore`](shardline_store::MessageStore)
//! and then tails the live log, handing every intercepted message to the
//! consumers of its [`MessageDispatcher`]. The same crate holds the
//! publishing side ([`MessageSender`]) and the snapshot
//! [`CompactionService`].

pub mod builder;
pub mod compaction;
pub mod dispatch;
pub mod event_source;
pub mod registry;
pub mod sender;

pub use builder::EventSourceBuilder;
pub use compaction::{CompactionReport, CompactionService};
pub use dispatch::{JsonMessageConsumer, KeyFilter, MessageConsumer, MessageDispatcher};
pub use event_source::EventSource;
pub use registry::{EventSourceRegistry, RegistryError};
pub use sender::{FileMessageSender, InMemoryMessageSender, MessageSender};
