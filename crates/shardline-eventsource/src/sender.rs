//! Publishing side: sender interceptors, then an append to the channel.

use std::sync::Arc;

use async_trait::async_trait;
use shardline_core::{InterceptorChain, PartitionPosition, SendError, TextMessage};
use shardline_reader::{FileChannel, InMemoryChannel};
use tracing::debug;

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Position the message was written at, or `None` when an interceptor
    /// dropped it.
    async fn send(&self, message: TextMessage) -> Result<Option<PartitionPosition>, SendError>;
}

pub struct InMemoryMessageSender {
    channel: Arc<InMemoryChannel>,
    interceptors: InterceptorChain,
}

impl InMemoryMessageSender {
    pub fn new(channel: Arc<InMemoryChannel>, interceptors: InterceptorChain) -> Self {
        Self {
            channel,
            interceptors,
        }
    }
}

#[async_trait]
impl MessageSender for InMemoryMessageSender {
    async fn send(&self, message: TextMessage) -> Result<Option<PartitionPosition>, SendError> {
        let Some(message) = self.interceptors.intercept(message) else {
            debug!(channel = self.channel.stream_name(), "sender: message dropped by interceptor");
            return Ok(None);
        };
        Ok(Some(self.channel.append(&message)?))
    }
}

pub struct FileMessageSender {
    channel: FileChannel,
    stream_name: String,
    interceptors: InterceptorChain,
}

impl FileMessageSender {
    pub fn new(
        channel: FileChannel,
        stream_name: impl Into<String>,
        interceptors: InterceptorChain,
    ) -> Self {
        Self {
            channel,
            stream_name: stream_name.into(),
            interceptors,
        }
    }
}

#[async_trait]
impl MessageSender for FileMessageSender {
    async fn send(&self, message: TextMessage) -> Result<Option<PartitionPosition>, SendError> {
        let Some(message) = self.interceptors.intercept(message) else {
            debug!(channel = %self.stream_name, "sender: message dropped by interceptor");
            return Ok(None);
        };
        Ok(Some(self.channel.append(&self.stream_name, &message).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{Key, Message, StopCondition};
    use shardline_reader::{PartitionSource, ReaderConfig, ShardReader};

    #[tokio::test]
    async fn sender_interceptors_can_drop_and_annotate() {
        let channel = Arc::new(InMemoryChannel::new("orders", 1));
        let chain = InterceptorChain::new().with(|m: TextMessage| {
            if m.key.compaction_key() == "secret" {
                return None;
            }
            let header = m.header.clone().with_attribute("origin", "test");
            Some(Message::new(m.key, header, m.payload))
        });
        let sender = InMemoryMessageSender::new(Arc::clone(&channel), chain);

        let dropped = sender
            .send(Message::of(Key::of("secret"), "x".to_owned()))
            .await
            .expect("send");
        assert_eq!(dropped, None);
        let position = sender
            .send(Message::of(Key::of("public"), "y".to_owned()))
            .await
            .expect("send");
        assert_eq!(position, Some(PartitionPosition::at_cursor("shard-0", "0")));

        let reader = ShardReader::new(
            "orders",
            "shard-0",
            channel as Arc<dyn PartitionSource>,
            ReaderConfig::default(),
        );
        let mut messages = Vec::new();
        reader
            .consume_until(
                PartitionPosition::beginning("shard-0"),
                &StopCondition::end_of_partition(),
                |r| messages.extend(r.messages.iter().cloned()),
            )
            .await
            .expect("consumed");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_deref(), Some("y"));
        assert_eq!(messages[0].header.attribute("origin"), Some("test"));
    }

    #[tokio::test]
    async fn file_sender_reports_closed_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = FileChannel::new(dir.path());
        channel.create_stream("orders", 1).await.expect("create");
        let sender = FileMessageSender::new(channel.clone(), "orders", InterceptorChain::new());

        let position = sender
            .send(Message::of(Key::of("a"), "1".to_owned()))
            .await
            .expect("send");
        assert_eq!(position, Some(PartitionPosition::at_cursor("shard-0", "0")));

        channel.close_partition("orders", "shard-0").await.expect("close");
        let err = sender
            .send(Message::of(Key::of("a"), "2".to_owned()))
            .await
            .expect_err("closed partition");
        assert!(matches!(err, SendError::Source(_)));
    }
}
