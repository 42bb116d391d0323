//! Routing triggers to stage handlers
//!
//! `Dispatcher` is the stage boundary: a handler error that is not a
//! rejected payload is written to the request's ledger entry. `LocalRuntime`
//! runs every trigger as its own tokio task in this process.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::messages::{DriverPayload, MapperPayload, ReducerPayload, WorkerPayload};
use super::{run_driver, run_mapper, run_reducer, run_worker, OrchestratorError, StageContext};
use crate::ledger::Stage;
use crate::storage::{Invoker, StorageError, StorageResult};

fn parse_payload<T: DeserializeOwned>(stage: Stage, payload: Value) -> Result<T, OrchestratorError> {
    serde_json::from_value(payload)
        .map_err(|e| OrchestratorError::Validation(format!("invalid {} payload: {}", stage, e)))
}

/// Maps stage names onto handlers
#[derive(Clone)]
pub struct Dispatcher {
    ctx: StageContext,
}

impl Dispatcher {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Run the handler for `function`, recording failures on the request
    pub async fn dispatch(&self, function: &str, payload: Value) -> Result<(), OrchestratorError> {
        let stage: Stage = function.parse().map_err(OrchestratorError::Dispatch)?;
        let request_id = payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let result = self.run_stage(stage, payload).await;
        if let Err(e) = &result {
            self.record_failure(stage, request_id.as_deref(), e).await;
        }
        result
    }

    async fn run_stage(&self, stage: Stage, payload: Value) -> Result<(), OrchestratorError> {
        match stage {
            Stage::Driver => {
                let payload: DriverPayload = parse_payload(stage, payload)?;
                let outcome = run_driver(&self.ctx, payload).await?;
                debug!("Driver finished: {:?}", outcome);
            }
            Stage::Mapper => {
                let payload: MapperPayload = parse_payload(stage, payload)?;
                let outcome = run_mapper(&self.ctx, payload).await?;
                debug!("Mapper finished: {:?}", outcome);
            }
            Stage::Worker => {
                let payload: WorkerPayload = parse_payload(stage, payload)?;
                let outcome = run_worker(&self.ctx, payload).await?;
                debug!("Worker finished: {:?}", outcome);
            }
            Stage::Reducer => {
                let payload: ReducerPayload = parse_payload(stage, payload)?;
                let outcome = run_reducer(&self.ctx, payload).await?;
                debug!("Reducer finished: {:?}", outcome);
            }
            Stage::Converter => {
                return Err(OrchestratorError::Dispatch(
                    "converter jobs run outside this service".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn record_failure(&self, stage: Stage, request_id: Option<&str>, err: &OrchestratorError) {
        if matches!(
            err,
            OrchestratorError::Validation(_) | OrchestratorError::Dispatch(_)
        ) {
            warn!("Rejected {} trigger: {}", stage, err);
            return;
        }
        let Some(request_id) = request_id else {
            error!("{} failed without a request id: {}", stage, err);
            return;
        };

        let message = format!("{} failed: {}", stage, err);
        if let Err(log_err) = self.ctx.ledger.log_error(request_id, &message).await {
            error!(
                "Could not record failure of {} for {}: {}",
                stage, request_id, log_err
            );
        }
    }
}

/// One trigger waiting to run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub function: String,
    pub payload: Value,
}

/// `Invoker` feeding a `LocalRuntime`
#[derive(Clone)]
pub struct LocalInvoker {
    sender: mpsc::UnboundedSender<Invocation>,
}

impl LocalInvoker {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Invocation>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, function: &str, payload: Value) -> StorageResult<()> {
        self.sender
            .send(Invocation {
                function: function.to_string(),
                payload,
            })
            .map_err(|_| StorageError::unavailable("local runtime has shut down"))
    }
}

/// Summary of a `LocalRuntime::run_until_idle` pass
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    /// Triggers handled in this process
    pub invocations: usize,
    /// `(stage, error)` for each handler that failed
    pub failures: Vec<(String, String)>,
    /// Conversion jobs handed to the external converter
    pub conversions: Vec<Invocation>,
}

/// Runs every trigger as an independent task until nothing is left to do
pub struct LocalRuntime {
    dispatcher: Dispatcher,
    receiver: mpsc::UnboundedReceiver<Invocation>,
}

impl LocalRuntime {
    /// Build a runtime whose context triggers stages through its own invoker
    pub fn new<F>(build: F) -> Self
    where
        F: FnOnce(Arc<dyn Invoker>) -> StageContext,
    {
        let (invoker, receiver) = LocalInvoker::channel();
        let ctx = build(Arc::new(invoker));
        Self {
            dispatcher: Dispatcher::new(ctx),
            receiver,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn context(&self) -> &StageContext {
        self.dispatcher.context()
    }

    /// Queue a Driver trigger
    pub async fn submit(&self, payload: &DriverPayload) -> Result<(), OrchestratorError> {
        self.context().trigger(Stage::Driver, payload).await
    }

    /// Drain queued triggers, including the ones handlers emit, until idle
    pub async fn run_until_idle(&mut self) -> RunReport {
        let mut tasks = JoinSet::new();
        let mut report = RunReport::default();

        loop {
            while let Ok(invocation) = self.receiver.try_recv() {
                if invocation.function == Stage::Converter.as_str() {
                    debug!("Conversion job emitted: {}", invocation.payload);
                    report.conversions.push(invocation);
                    continue;
                }

                report.invocations += 1;
                let dispatcher = self.dispatcher.clone();
                let Invocation { function, payload } = invocation;
                tasks.spawn(async move {
                    let result = dispatcher.dispatch(&function, payload).await;
                    (function, result)
                });
            }

            // A finished task has already queued everything it triggered
            match tasks.join_next().await {
                None => break,
                Some(Ok((_, Ok(())))) => {}
                Some(Ok((function, Err(e)))) => report.failures.push((function, e.to_string())),
                Some(Err(e)) => report.failures.push(("task".to_string(), e.to_string())),
            }
        }

        report
    }
}
