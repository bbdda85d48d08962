//! Bounded worker pools for the checkpointing pipeline.
//!
//! A pool is a fixed set of tokio tasks draining one bounded job queue. What
//! happens when the queue is full is the pool's [`OverflowPolicy`].

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = BoxFuture<'static, ()>;

/// Error type for job submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The queue was full and the pool rejects overflow.
    #[error("{pool} queue is full (capacity {capacity})")]
    QueueFull {
        /// Pool name.
        pool: &'static str,
        /// Queue capacity.
        capacity: usize,
    },
    /// The pool was shut down.
    #[error("{0} pool is shut down")]
    Shutdown(&'static str),
}

/// What to do with a job submitted to a full queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the job immediately.
    Abort,
    /// Run the job in the submitting task.
    CallerRuns,
}

/// Where an accepted job runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    /// Queued for a pool worker.
    Queued,
    /// Already run by the submitter because the queue was full.
    RanOnCaller,
}

/// A named pool of workers draining a bounded queue.
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `threads` workers sharing a queue of `capacity` jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: &'static str,
        threads: usize,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(pool = name, worker, "checkpointing job panicked");
                        }
                    }
                    debug!(pool = name, worker, "worker stopped");
                })
            })
            .collect();
        Self {
            name,
            capacity,
            policy,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Pool name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Submits a job.
    ///
    /// With [`OverflowPolicy::Abort`] this never waits. With
    /// [`OverflowPolicy::CallerRuns`] a full queue makes the caller run the
    /// job to completion before returning.
    pub async fn submit<F>(&self, job: F) -> Result<Submitted, PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().clone().ok_or(PoolError::Shutdown(self.name))?;
        match tx.try_send(job.boxed()) {
            Ok(()) => Ok(Submitted::Queued),
            Err(TrySendError::Closed(_)) => Err(PoolError::Shutdown(self.name)),
            Err(TrySendError::Full(job)) => match self.policy {
                OverflowPolicy::Abort => Err(PoolError::QueueFull {
                    pool: self.name,
                    capacity: self.capacity,
                }),
                OverflowPolicy::CallerRuns => {
                    debug!(pool = self.name, "queue full, running job on caller");
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(pool = self.name, "checkpointing job panicked on caller");
                    }
                    Ok(Submitted::RanOnCaller)
                }
            },
        }
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(pool = self.name, error = %e, "worker task failed");
            }
        }
    }
}
