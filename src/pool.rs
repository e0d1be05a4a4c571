//! Bounded worker pool for per-image tasks.
//!
//! `submit` waits for a free slot before spawning, which is where the
//! dispatcher feels backpressure. A task checks the pool's cancellation token
//! before its body starts; once started it runs to completion. Panics are
//! contained to the task that raised them.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::PoolError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub panicked: usize,
}

pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    tasks: JoinSet<bool>,
    cancel: CancellationToken,
    stats: PoolStats,
}

impl WorkerPool {
    pub fn new(size: usize, cancel: CancellationToken) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }

        Ok(Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
            cancel,
            stats: PoolStats::default(),
        })
    }

    /// Tasks currently holding a slot.
    pub fn running(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Waits for a free slot and starts `task` on it.
    ///
    /// Returns [`PoolError::Cancelled`] without running `task` if the pool is
    /// cancelled first.
    pub async fn submit<F>(&mut self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::Cancelled)?
            }
        };

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return false;
            }
            task.await;
            true
        });
        self.stats.submitted += 1;

        Ok(())
    }

    /// Waits for every submitted task to finish.
    pub async fn wait(&mut self) -> PoolStats {
        while let Some(result) = self.tasks.join_next().await {
            self.record(result);
        }
        self.stats
    }

    /// Waits for outstanding tasks and refuses any further submissions.
    pub async fn close(mut self) -> PoolStats {
        let stats = self.wait().await;
        self.slots.close();
        stats
    }

    fn record(&mut self, result: Result<bool, JoinError>) {
        match result {
            Ok(true) => self.stats.completed += 1,
            Ok(false) => {
                debug!("Pool: task abandoned after cancellation");
                self.stats.abandoned += 1;
            }
            Err(err) if err.is_panic() => {
                error!("Pool: task panicked: {err}");
                self.stats.panicked += 1;
            }
            Err(err) => {
                error!("Pool: task failed to complete: {err}");
                self.stats.abandoned += 1;
            }
        }
    }
}
