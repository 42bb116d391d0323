//! Driver / Mapper / Worker / Reducer pipeline
//!
//! Stage handlers are stateless: everything they share goes through the
//! ledger, the cache, and the output array. Stages start each other with
//! fire-and-forget triggers through an `Invoker`.

pub mod dispatch;
pub mod driver;
pub mod mapper;
pub mod messages;
pub mod queue;
pub mod reconciler;
pub mod reducer;
pub mod status;
pub mod worker;

pub use dispatch::{Dispatcher, LocalInvoker, LocalRuntime, RunReport};
pub use driver::{run_driver, DriverOutcome};
pub use mapper::{run_mapper, MapperOutcome};
pub use messages::{
    ChunkSpec, ConverterPayload, DriverPayload, MapperPayload, ReducerPayload, TriggerEnvelope,
    WorkUnit, WorkerPayload,
};
pub use queue::{QueueConsumer, QueueInvoker};
pub use reconciler::{ReconcileReport, Reconciler};
pub use reducer::{complete_conversion, run_reducer, ReducerOutcome};
pub use status::{get_status, RequestState, RequestStatus};
pub use worker::{run_worker, WorkerOutcome};

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::array::{ArrayError, ArrayStore};
use crate::cache::RequestCache;
use crate::config::{OrchestratorConfig, ServiceConfig};
use crate::ledger::{LedgerError, RequestLedger, Stage};
use crate::lock::{DistributedLock, LockError};
use crate::source::{ExpressionSource, SourceError};
use crate::storage::{Invoker, KeyValueStore, ObjectStore, StorageError};

/// Errors from stage handlers
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed request, rejected before any ledger entry exists
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Unexpected failure inside stage logic
    #[error("Stage failed: {0}")]
    Work(String),

    #[error("Request {0} not found")]
    NotFound(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Array(#[from] ArrayError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Everything a stage handler needs, shared by clone
#[derive(Clone)]
pub struct StageContext {
    pub ledger: RequestLedger,
    pub cache: RequestCache,
    pub arrays: ArrayStore,
    pub source: Arc<dyn ExpressionSource>,
    pub invoker: Arc<dyn Invoker>,
    pub config: OrchestratorConfig,
}

impl StageContext {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        objects: Arc<dyn ObjectStore>,
        source: Arc<dyn ExpressionSource>,
        invoker: Arc<dyn Invoker>,
        config: &ServiceConfig,
    ) -> Self {
        let lock = DistributedLock::new(kv.clone(), config.lock.clone())
            .with_retry(config.retry.clone());
        Self {
            ledger: RequestLedger::new(kv.clone(), config.retry.clone()),
            cache: RequestCache::new(kv.clone(), config.retry.clone()),
            arrays: ArrayStore::new(
                kv,
                objects,
                lock,
                config.retry.clone(),
                config.array.clone(),
            ),
            source,
            invoker,
            config: config.orchestrator.clone(),
        }
    }

    /// Object-store name of a request's output array
    pub fn array_name(&self, request_id: &str) -> String {
        format!(
            "{}/{}.zarr",
            self.config.results_prefix.trim_end_matches('/'),
            request_id
        )
    }

    pub fn is_native_format(&self, format: &str) -> bool {
        format == self.config.native_format
    }

    /// Fire a trigger for `stage`
    pub async fn trigger<T: Serialize>(
        &self,
        stage: Stage,
        payload: &T,
    ) -> Result<(), OrchestratorError> {
        let payload = serde_json::to_value(payload).map_err(StorageError::from)?;
        debug!("Triggering {} with {}", stage, payload);
        self.invoker.invoke(stage.as_str(), payload).await?;
        Ok(())
    }
}
