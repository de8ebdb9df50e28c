use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Maximum records requested per fetch.
    pub batch_limit: usize,
    /// Pause after a batch without records before fetching again.
    pub empty_batch_backoff_ms: u64,
}

impl ReaderConfig {
    pub fn empty_batch_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_batch_backoff_ms)
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_limit: 1000,
            empty_batch_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub reader: ReaderConfig,
    /// How long stopped readers get to finish after a sibling failed,
    /// before they are aborted.
    pub shutdown_grace_ms: u64,
}

impl OrchestratorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reader: ReaderConfig::default(),
            shutdown_grace_ms: 30_000,
        }
    }
}
