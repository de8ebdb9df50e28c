//! Message interceptors: an ordered, short-circuiting transform pipeline
//! shared by every partition worker, plus a registry that assembles chains
//! per channel and endpoint type.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::TextMessage;

// ─── Interceptor ──────────────────────────────────────────────────

/// A transform or filter step. Returning `None` drops the message.
///
/// Interceptors are shared across threads and must not rely on exclusive
/// access.
pub trait MessageInterceptor: Send + Sync {
    fn intercept(&self, message: TextMessage) -> Option<TextMessage>;
}

impl<F> MessageInterceptor for F
where
    F: Fn(TextMessage) -> Option<TextMessage> + Send + Sync,
{
    fn intercept(&self, message: TextMessage) -> Option<TextMessage> {
        self(message)
    }
}

// ─── Chain ────────────────────────────────────────────────────────

/// Interceptors applied in registration order. An empty chain is the
/// identity function.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interceptors(interceptors: Vec<Arc<dyn MessageInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn with(mut self, interceptor: impl MessageInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn MessageInterceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Append every interceptor of `other`, after the ones already here.
    pub fn extend(&mut self, other: &InterceptorChain) {
        self.interceptors.extend(other.interceptors.iter().cloned());
    }

    /// Run `message` through every interceptor. Stops at the first `None`
    /// without invoking the remaining interceptors.
    pub fn intercept(&self, message: TextMessage) -> Option<TextMessage> {
        let mut current = message;
        for interceptor in &self.interceptors {
            current = interceptor.intercept(current)?;
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

// ─── Registry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelector {
    All,
    Named(String),
}

impl ChannelSelector {
    pub fn matches(&self, channel_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(name) => name == channel_name,
        }
    }
}

/// An interceptor bound to the channels and endpoint types it applies to.
#[derive(Clone)]
pub struct InterceptorRegistration {
    selector: ChannelSelector,
    /// `None` applies to senders and receivers alike.
    endpoint_type: Option<EndpointType>,
    interceptor: Arc<dyn MessageInterceptor>,
}

impl InterceptorRegistration {
    pub fn new(
        selector: ChannelSelector,
        endpoint_type: Option<EndpointType>,
        interceptor: Arc<dyn MessageInterceptor>,
    ) -> Self {
        Self {
            selector,
            endpoint_type,
            interceptor,
        }
    }

    pub fn all_channels_with(interceptor: impl MessageInterceptor + 'static) -> Self {
        Self::new(ChannelSelector::All, None, Arc::new(interceptor))
    }

    pub fn receiver_channels_with(interceptor: impl MessageInterceptor + 'static) -> Self {
        Self::new(
            ChannelSelector::All,
            Some(EndpointType::Receiver),
            Arc::new(interceptor),
        )
    }

    pub fn sender_channels_with(interceptor: impl MessageInterceptor + 'static) -> Self {
        Self::new(
            ChannelSelector::All,
            Some(EndpointType::Sender),
            Arc::new(interceptor),
        )
    }

    pub fn matching_channels_with(
        channel_name: impl Into<String>,
        interceptor: impl MessageInterceptor + 'static,
    ) -> Self {
        Self::new(
            ChannelSelector::Named(channel_name.into()),
            None,
            Arc::new(interceptor),
        )
    }

    pub fn is_enabled_for(&self, channel_name: &str, endpoint_type: EndpointType) -> bool {
        self.selector.matches(channel_name)
            && self.endpoint_type.is_none_or(|t| t == endpoint_type)
    }
}

impl fmt::Debug for InterceptorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistration")
            .field("selector", &self.selector)
            .field("endpoint_type", &self.endpoint_type)
            .finish_non_exhaustive()
    }
}

/// Application-wide list of interceptor registrations.
#[derive(Debug, Default)]
pub struct InterceptorRegistry {
    registrations: RwLock<Vec<InterceptorRegistration>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: InterceptorRegistration) {
        self.registrations.write().push(registration);
    }

    /// Chain of every registration enabled for the channel and endpoint type,
    /// in registration order.
    pub fn chain_for(&self, channel_name: &str, endpoint_type: EndpointType) -> InterceptorChain {
        let interceptors = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.is_enabled_for(channel_name, endpoint_type))
            .map(|r| Arc::clone(&r.interceptor))
            .collect();
        InterceptorChain::from_interceptors(interceptors)
    }
}

// ─── Tests ────────────────────────────────────────────────────────
