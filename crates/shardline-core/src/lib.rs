//! shardline-core: value types of the consumption engine.
//! Positions, messages, partition responses, stop conditions, the
//! interceptor chain and the envelope codec. No IO, no runtime.

pub mod codec;
pub mod error;
pub mod interceptor;
pub mod stop;
pub mod types;

pub use error::{ConsumeError, SendError, SourceError, StoreError};
pub use interceptor::{
    ChannelSelector, EndpointType, InterceptorChain, InterceptorRegistration,
    InterceptorRegistry, MessageInterceptor,
};
pub use stop::StopCondition;
pub use types::{
    Header, Key, Message, PartitionPosition, PartitionResponse, StartFrom, StreamPosition,
    StreamResponse, TextMessage,
};
