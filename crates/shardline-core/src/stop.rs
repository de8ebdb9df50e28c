//! Stop conditions: predicates over a [`PartitionResponse`] deciding when a
//! partition read is finished.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::types::PartitionResponse;

type Predicate = dyn Fn(&PartitionResponse) -> bool + Send + Sync;

/// Composable predicate evaluated after every batch, including empty ones.
#[derive(Clone)]
pub struct StopCondition {
    name: String,
    predicate: Arc<Predicate>,
}

impl StopCondition {
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&PartitionResponse) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Fires for the first batch fetched at or after `at`.
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Self::custom(format!("timestamp({})", at.to_rfc3339()), move |r| {
            r.fetched_at >= at
        })
    }

    /// Fires once the source reports zero lag.
    pub fn end_of_partition() -> Self {
        Self::custom("end_of_partition", PartitionResponse::is_at_end)
    }

    /// Never fires: the read only ends through an explicit stop signal.
    pub fn shutdown() -> Self {
        Self::custom("shutdown", |_| false)
    }

    /// Fires for the first batch without messages.
    pub fn empty_response() -> Self {
        Self::custom("empty_response", PartitionResponse::is_empty)
    }

    pub fn and(self, other: StopCondition) -> Self {
        let name = format!("({} and {})", self.name, other.name);
        Self::custom(name, move |r| self.matches(r) && other.matches(r))
    }

    pub fn or(self, other: StopCondition) -> Self {
        let name = format!("({} or {})", self.name, other.name);
        Self::custom(name, move |r| self.matches(r) || other.matches(r))
    }

    pub fn matches(&self, response: &PartitionResponse) -> bool {
        (self.predicate)(response)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StopCondition").field(&self.name).finish()
    }
}
