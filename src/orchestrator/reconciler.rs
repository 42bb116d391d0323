//! Periodic sweep for requests whose Reducer trigger was lost

use chrono::Utc;
use std::future::Future;
use tracing::{debug, info, warn};

use super::worker::finalize_map_work;
use super::{OrchestratorError, StageContext};
use crate::ledger::{RequestEntry, Stage};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Requests whose map work was finalized again
    pub retriggered: Vec<String>,
}

pub struct Reconciler {
    ctx: StageContext,
}

impl Reconciler {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    fn is_stalled(&self, entry: &RequestEntry) -> bool {
        if entry.is_terminal()
            || entry.reused_from.is_some()
            || entry.is_stage_complete(Stage::Reducer)
            || !entry.map_work_complete()
        {
            return false;
        }
        let idle = Utc::now()
            .signed_duration_since(entry.updated_at)
            .to_std()
            .unwrap_or_default();
        idle >= self.ctx.config.reconcile_grace
    }

    /// One pass over every tracked request
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, OrchestratorError> {
        let mut report = ReconcileReport::default();

        for request_id in self.ctx.ledger.list_request_ids().await? {
            report.scanned += 1;
            let Some(entry) = self.ctx.ledger.get_entry(&request_id).await? else {
                continue;
            };
            if !self.is_stalled(&entry) {
                continue;
            }

            info!("Request {} is stalled before its reducer; retriggering", request_id);
            match finalize_map_work(&self.ctx, &request_id).await {
                Ok(()) => report.retriggered.push(request_id),
                Err(e) => warn!("Could not retrigger {}: {}", request_id, e),
            }
        }

        debug!(
            "Reconciled {} requests, retriggered {}",
            report.scanned,
            report.retriggered.len()
        );
        Ok(report)
    }

    /// Reconcile every `reconcile_interval` until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.ctx.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!("Reconcile pass failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RequestField;
    use crate::orchestrator::tests::{insert_bundle, recording_context, TestHarness};
    use crate::orchestrator::{run_mapper, run_worker, MapperPayload, WorkUnit, WorkerPayload};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lost_reducer_trigger_is_reissued() {
        let TestHarness {
            mut ctx,
            invoker,
            source,
            ..
        } = recording_context();
        ctx.config.reconcile_grace = Duration::ZERO;
        insert_bundle(&source, "a", 0, 2).await;
        ctx.ledger
            .create_entry(
                "r1",
                "zarr",
                &[(Stage::Mapper, 1), (Stage::Worker, 0), (Stage::Reducer, 1)],
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        ctx.ledger
            .create_entry("done", "zarr", &[(Stage::Reducer, 1)], serde_json::Value::Null)
            .await
            .unwrap();
        ctx.ledger
            .increment("done", RequestField::Completed(Stage::Reducer), 1)
            .await
            .unwrap();

        run_mapper(
            &ctx,
            MapperPayload {
                request_id: "r1".to_string(),
                work_unit: WorkUnit {
                    source_ref: "a".to_string(),
                },
            },
        )
        .await
        .unwrap();
        let (_, worker) = invoker.take().await.remove(0);
        let worker: WorkerPayload = serde_json::from_value(worker).unwrap();
        run_worker(&ctx, worker).await.unwrap();

        // Pretend the reducer trigger never arrived
        assert_eq!(invoker.take().await.len(), 1);

        let reconciler = Reconciler::new(ctx.clone());
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.retriggered, vec!["r1".to_string()]);

        let calls = invoker.invocations().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "reducer");
    }

    #[tokio::test]
    async fn test_grace_period_defers_retrigger() {
        let TestHarness { mut ctx, .. } = recording_context();
        ctx.config.reconcile_grace = Duration::from_secs(3600);
        ctx.ledger
            .create_entry(
                "r1",
                "zarr",
                &[(Stage::Mapper, 0), (Stage::Worker, 0), (Stage::Reducer, 1)],
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let report = Reconciler::new(ctx).reconcile_once().await.unwrap();
        assert!(report.retriggered.is_empty());
    }
}
