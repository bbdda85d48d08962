//! Checkpointing coordinator.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use super::{
    CheckpointError, CheckpointHandle, CheckpointId, CheckpointStatus, FetchCircuitBreaker,
    LoggingStorageCallback, OverflowPolicy, StateStorage, StorageCallback, StorageResultCode,
    WorkerPool,
};
use crate::config::CheckpointingSettings;
use crate::metrics::RuntimeMetrics;

/// Something whose state can be snapshotted.
#[async_trait]
pub trait Checkpointable: Send + Sync {
    /// Storage key of this state.
    fn checkpoint_id(&self) -> CheckpointId;

    /// Takes the state lock, waiting at most `lock_wait`, serializes the
    /// state and clears the dirty flag before releasing the lock.
    async fn serialize_state(&self, lock_wait: Duration) -> Result<Bytes, CheckpointError>;
}

/// Runs checkpoint requests through the serialization and storage pools and
/// fetches stored state behind a circuit breaker.
pub struct SafeKeeper {
    storage: Arc<dyn StateStorage>,
    callback: Arc<dyn StorageCallback>,
    serialization: WorkerPool,
    storing: Arc<WorkerPool>,
    fetching: WorkerPool,
    breaker: FetchCircuitBreaker,
    serialization_wait: Duration,
    fetch_wait: Duration,
    metrics: Arc<RuntimeMetrics>,
}

struct Request {
    id: CheckpointId,
    status: watch::Sender<CheckpointStatus>,
    callback: Arc<dyn StorageCallback>,
    metrics: Arc<RuntimeMetrics>,
}

impl Request {
    fn advance(&self, status: CheckpointStatus) {
        self.status.send_replace(status);
    }

    fn fail(&self, error: CheckpointError) {
        self.metrics.checkpoint_failed();
        self.callback
            .storage_operation_result(&self.id, StorageResultCode::Failure, &error.to_string());
        self.advance(CheckpointStatus::Failed(error));
    }

    fn succeed(&self) {
        self.metrics.checkpoint_stored();
        self.callback
            .storage_operation_result(&self.id, StorageResultCode::Success, &self.id.to_string());
        self.advance(CheckpointStatus::Succeeded);
    }
}

impl SafeKeeper {
    /// Creates the pipeline and spawns its pools. Outcomes are logged.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        storage: Arc<dyn StateStorage>,
        settings: &CheckpointingSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self::with_callback(storage, Arc::new(LoggingStorageCallback), settings, metrics)
    }

    /// Creates the pipeline with a custom outcome callback.
    pub fn with_callback(
        storage: Arc<dyn StateStorage>,
        callback: Arc<dyn StorageCallback>,
        settings: &CheckpointingSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            storage,
            callback,
            serialization: WorkerPool::new(
                "serialization",
                settings.serialization_max_threads,
                settings.serialization_max_outstanding_requests,
                OverflowPolicy::Abort,
            ),
            storing: Arc::new(WorkerPool::new(
                "storage",
                settings.storage_max_threads,
                settings.storage_max_outstanding_requests,
                OverflowPolicy::CallerRuns,
            )),
            fetching: WorkerPool::new(
                "fetching",
                settings.fetching_max_threads,
                settings.fetching_queue_size,
                OverflowPolicy::Abort,
            ),
            breaker: FetchCircuitBreaker::new(
                settings.fetching_max_consecutive_failures,
                settings.fetching_disabled_duration(),
            ),
            serialization_wait: settings.serialization_wait(),
            fetch_wait: settings.fetching_max_wait(),
            metrics,
        }
    }

    /// Requests an asynchronous checkpoint of `target`.
    ///
    /// Never blocks on a full pipeline: if the serialization queue is full
    /// the returned handle is already failed.
    pub async fn save_state(&self, target: Arc<dyn Checkpointable>) -> CheckpointHandle {
        let id = target.checkpoint_id();
        let (status, observer) = watch::channel(CheckpointStatus::Requested);
        let handle = CheckpointHandle::new(id.clone(), observer);
        self.metrics.checkpoint_requested();

        let request = Arc::new(Request {
            id,
            status,
            callback: self.callback.clone(),
            metrics: self.metrics.clone(),
        });
        let job = serialize_then_store(
            request.clone(),
            target,
            self.serialization_wait,
            self.storing.clone(),
            self.storage.clone(),
        );
        if let Err(e) = self.serialization.submit(job).await {
            self.metrics.serialization_rejected();
            let error = match e {
                super::PoolError::QueueFull { capacity, .. } => {
                    CheckpointError::QueueFull { capacity }
                }
                super::PoolError::Shutdown(_) => CheckpointError::Shutdown,
            };
            request.fail(error);
        }
        handle
    }

    /// Fetches the stored state for `id`.
    ///
    /// Returns `None` when nothing is stored, when the fetch fails or times
    /// out, and without touching the backend while the breaker is open.
    pub async fn fetch_serialized_state(&self, id: &CheckpointId) -> Option<Bytes> {
        if !self.breaker.allow() {
            self.metrics.fetch_short_circuited();
            debug!(checkpoint_id = %id, "checkpoint fetching disabled, skipping fetch");
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let storage = self.storage.clone();
        let fetch_id = id.clone();
        let submitted = self
            .fetching
            .submit(async move {
                let _ = tx.send(storage.fetch_state(&fetch_id).await);
            })
            .await;

        let failure = match submitted {
            Err(e) => e.to_string(),
            Ok(_) => match tokio::time::timeout(self.fetch_wait, rx).await {
                Ok(Ok(Ok(state))) => {
                    self.metrics.fetch_succeeded();
                    self.breaker.record_success();
                    return state;
                }
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(_)) => "fetch task dropped".to_string(),
                Err(_) => format!("timed out after {} ms", self.fetch_wait.as_millis()),
            },
        };

        self.metrics.fetch_failed();
        error!(checkpoint_id = %id, reason = %failure, "cannot fetch checkpoint from backend");
        self.breaker.record_failure();
        None
    }

    /// Fetch circuit breaker.
    pub fn breaker(&self) -> &FetchCircuitBreaker {
        &self.breaker
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn StateStorage> {
        &self.storage
    }

    /// Stops accepting requests and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        self.serialization.shutdown().await;
        self.storing.shutdown().await;
        self.fetching.shutdown().await;
    }
}

async fn serialize_then_store(
    request: Arc<Request>,
    target: Arc<dyn Checkpointable>,
    lock_wait: Duration,
    storing: Arc<WorkerPool>,
    storage: Arc<dyn StateStorage>,
) {
    request.advance(CheckpointStatus::Serializing);
    let state = match target.serialize_state(lock_wait).await {
        Ok(state) => state,
        Err(e) => {
            warn!(checkpoint_id = %request.id, error = %e, "cannot serialize checkpoint");
            request.fail(e);
            return;
        }
    };
    request.advance(CheckpointStatus::Serialized);

    let store = {
        let request = request.clone();
        async move {
            request.advance(CheckpointStatus::Storing);
            match storage.save_state(&request.id, state).await {
                Ok(()) => request.succeed(),
                Err(e) => request.fail(e.into()),
            }
        }
    };
    match storing.submit(store).await {
        Ok(super::Submitted::RanOnCaller) => request.metrics.storage_on_caller(),
        Ok(super::Submitted::Queued) => {}
        Err(e) => request.fail(CheckpointError::Storage(e.to_string())),
    }
}
