//! Shared worker pool bounding concurrent remote calls

use crate::error::{CacheError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default number of worker slots
pub const DEFAULT_WORKERS: usize = 16;

/// Bounded set of worker slots shared by every level of a pyramid
///
/// Cloning the handle shares the pool, so several pyramids opened from the
/// same session can bound their total number of concurrent remote calls.
#[derive(Clone, Debug)]
pub struct SharedWorkerPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    handle: Handle,
    permits: Arc<Semaphore>,
    num_workers: usize,
}

impl SharedWorkerPool {
    /// Create a pool on the current tokio runtime
    pub fn new(num_workers: usize) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            CacheError::Configuration(format!("Worker pool requires a tokio runtime: {}", e))
        })?;
        Self::with_handle(handle, num_workers)
    }

    /// Create a pool that spawns onto the given runtime
    pub fn with_handle(handle: Handle, num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(CacheError::Configuration(
                "Worker pool needs at least one worker".to_string(),
            ));
        }
        debug!(num_workers, "creating shared worker pool");
        Ok(Self {
            inner: Arc::new(PoolInner {
                handle,
                permits: Arc::new(Semaphore::new(num_workers)),
                num_workers,
            }),
        })
    }

    /// Number of worker slots
    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Number of slots currently running remote calls
    pub fn busy_workers(&self) -> usize {
        self.inner.num_workers - self.inner.permits.available_permits()
    }

    /// Whether `other` is a handle to the same pool
    pub fn same_pool(&self, other: &SharedWorkerPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stop accepting work; queued and future `run` calls fail
    pub fn close(&self) {
        debug!("closing shared worker pool");
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Run `work` once a worker slot is free
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::Configuration("Worker pool is closed".to_string()))?;
        work.await
    }

    /// Spawn a detached task on the pool's runtime
    ///
    /// The task itself should go through [`run`](Self::run) for its remote
    /// calls; spawning alone does not take a worker slot.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(task)
    }
}
