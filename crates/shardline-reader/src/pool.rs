//! Explicitly owned worker pool.

use std::future::Future;

use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

/// Runtime handle that partition readers and replay work are spawned on.
///
/// The pool does not own the runtime; whoever built the runtime shuts it
/// down.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Pool on the runtime the caller is running in.
    pub fn current(name: impl Into<String>) -> Result<Self, TryCurrentError> {
        Ok(Self::new(name, Handle::try_current()?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn_into<T, F>(&self, tasks: &mut JoinSet<T>, task: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tasks.spawn_on(task, &self.handle)
    }

    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }
}
