//! Queue-backed triggers for multi-process deployments

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use super::messages::TriggerEnvelope;
use super::OrchestratorError;
use crate::ledger::Stage;
use crate::storage::{Invoker, MessageQueue, QueueMessage, StorageError, StorageResult};

/// Sends trigger envelopes to a queue. Converter jobs go to their own queue
/// so stage consumers never pick them up.
#[derive(Clone)]
pub struct QueueInvoker {
    triggers: Arc<dyn MessageQueue>,
    conversions: Arc<dyn MessageQueue>,
}

impl QueueInvoker {
    pub fn new(triggers: Arc<dyn MessageQueue>, conversions: Arc<dyn MessageQueue>) -> Self {
        Self {
            triggers,
            conversions,
        }
    }
}

#[async_trait]
impl Invoker for QueueInvoker {
    async fn invoke(&self, function: &str, payload: Value) -> StorageResult<()> {
        let stage: Stage = function.parse().map_err(StorageError::configuration)?;
        let body = serde_json::to_string(&TriggerEnvelope { stage, payload })?;

        let queue = if stage == Stage::Converter {
            &self.conversions
        } else {
            &self.triggers
        };
        let id = queue.send(body).await?;
        debug!("Queued {} trigger as message {}", stage, id);
        Ok(())
    }
}

/// Long-polls the trigger queue and dispatches every envelope
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    dispatcher: Dispatcher,
    batch: usize,
    wait: Duration,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn MessageQueue>, dispatcher: Dispatcher) -> Self {
        let config = &dispatcher.context().config;
        let batch = config.queue_batch.max(1);
        let wait = config.queue_wait;
        Self {
            queue,
            dispatcher,
            batch,
            wait,
        }
    }

    /// Receive one batch and handle it; returns how many messages arrived
    pub async fn poll_once(&self) -> Result<usize, OrchestratorError> {
        let messages = self.queue.receive(self.batch, self.wait).await?;
        let received = messages.len();
        join_all(messages.into_iter().map(|m| self.handle(m))).await;
        Ok(received)
    }

    async fn handle(&self, message: QueueMessage) {
        match serde_json::from_str::<TriggerEnvelope>(&message.body) {
            Ok(envelope) => {
                if message.receive_count > 1 {
                    debug!(
                        "Redelivered {} trigger (attempt {})",
                        envelope.stage, message.receive_count
                    );
                }
                if let Err(e) = self
                    .dispatcher
                    .dispatch(envelope.stage.as_str(), envelope.payload)
                    .await
                {
                    warn!("{} trigger failed: {}", envelope.stage, e);
                }
            }
            Err(e) => error!("Dropping malformed message {}: {}", message.receipt, e),
        }

        // Handlers record their own failures, so every message is acknowledged
        if let Err(e) = self.queue.delete(&message.receipt).await {
            warn!("Failed to acknowledge message {}: {}", message.receipt, e);
        }
    }

    /// Poll until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Queue consumer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Queue consumer stopping");
                    return;
                }
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!("Queue receive failed: {}", e);
                        tokio::time::sleep(self.wait.min(Duration::from_secs(5))).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::messages::DriverPayload;
    use crate::orchestrator::tests::{insert_bundle, recording_context, test_config};
    use crate::orchestrator::StageContext;
    use crate::source::StaticSource;
    use crate::storage::backends::{MemoryKeyValueStore, MemoryObjectStore, MemoryQueue};
    use serde_json::json;

    #[tokio::test]
    async fn test_queue_invoker_routes_conversions_separately() {
        let triggers = Arc::new(MemoryQueue::default());
        let conversions = Arc::new(MemoryQueue::default());
        let invoker = QueueInvoker::new(triggers.clone(), conversions.clone());

        invoker
            .invoke("reducer", json!({"request_id": "r1"}))
            .await
            .unwrap();
        invoker
            .invoke("converter", json!({"request_id": "r1"}))
            .await
            .unwrap();
        assert!(invoker.invoke("nope", json!({})).await.is_err());

        assert_eq!(triggers.ready_len().await, 1);
        assert_eq!(conversions.ready_len().await, 1);

        let received = triggers.receive(1, Duration::ZERO).await.unwrap();
        let envelope: TriggerEnvelope = serde_json::from_str(&received[0].body).unwrap();
        assert_eq!(envelope.stage, Stage::Reducer);
    }

    #[tokio::test]
    async fn test_consumer_drains_queue_to_completion() {
        let triggers = Arc::new(MemoryQueue::default());
        let conversions = Arc::new(MemoryQueue::default());
        let source = StaticSource::new();
        insert_bundle(&source, "a", 0, 6).await;

        let mut config = test_config();
        config.orchestrator.queue_wait = Duration::from_millis(20);
        let ctx = StageContext::new(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(source.clone()),
            Arc::new(QueueInvoker::new(triggers.clone(), conversions.clone())),
            &config,
        );
        let consumer = QueueConsumer::new(triggers.clone(), Dispatcher::new(ctx.clone()));

        ctx.trigger(
            Stage::Driver,
            &DriverPayload {
                request_id: "r1".to_string(),
                input_refs: vec!["a".to_string()],
                format: "loom".to_string(),
                params: Value::Null,
            },
        )
        .await
        .unwrap();

        while consumer.poll_once().await.unwrap() > 0 {}

        assert_eq!(triggers.in_flight_len().await, 0);
        assert_eq!(conversions.ready_len().await, 1);
        let entry = ctx.ledger.entry("r1").await.unwrap();
        assert!(entry.is_stage_complete(Stage::Reducer));
        assert!(entry.conversion_job_id.is_some());
    }

    #[tokio::test]
    async fn test_malformed_message_is_acknowledged() {
        let triggers = Arc::new(MemoryQueue::default());
        triggers.send("not json".to_string()).await.unwrap();

        let harness = recording_context();
        let consumer = QueueConsumer::new(triggers.clone(), Dispatcher::new(harness.ctx));

        assert_eq!(consumer.poll_once().await.unwrap(), 1);
        assert_eq!(triggers.in_flight_len().await, 0);
        assert_eq!(triggers.ready_len().await, 0);
    }
}
