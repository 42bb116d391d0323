//! Worker: copies one slice of a bundle into the output array

use serde_json::json;
use std::ops::Range;
use tracing::{debug, info};

use super::messages::{ReducerPayload, WorkerPayload};
use super::{OrchestratorError, StageContext};
use crate::ledger::{RequestField, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Rows landed at `rows` in the output; `finalized` if this worker closed map work
    Written { rows: Range<u64>, finalized: bool },
    Skipped,
}

pub async fn run_worker(
    ctx: &StageContext,
    payload: WorkerPayload,
) -> Result<WorkerOutcome, OrchestratorError> {
    let request_id = payload.request_id.as_str();
    let spec = &payload.chunk_spec;

    let entry = ctx.ledger.entry(request_id).await?;
    if entry.is_terminal() {
        debug!("Skipping worker for terminal request {}", request_id);
        return Ok(WorkerOutcome::Skipped);
    }

    let block = ctx
        .source
        .read_rows(&spec.source_ref, spec.start_row, spec.num_rows)
        .await?;
    let writer = ctx.arrays.open(&ctx.array_name(request_id)).await?;
    let rows = writer.write_rows(&block).await?;
    debug!(
        "Wrote {}[{}..{}) to rows {:?} of {}",
        spec.source_ref,
        spec.start_row,
        spec.start_row + spec.num_rows,
        rows,
        writer.name()
    );

    let update = ctx
        .ledger
        .increment_fields(request_id, &[(RequestField::Completed(Stage::Worker), 1)])
        .await?;

    let finalized = update.completed_map_work();
    if finalized {
        finalize_map_work(ctx, request_id).await?;
    }
    Ok(WorkerOutcome::Written { rows, finalized })
}

/// Write the array's metadata and hand the request to the Reducer.
///
/// Called by exactly one Mapper or Worker: the one whose counter update
/// moved map work to complete.
pub(crate) async fn finalize_map_work(
    ctx: &StageContext,
    request_id: &str,
) -> Result<(), OrchestratorError> {
    let writer = ctx.arrays.open(&ctx.array_name(request_id)).await?;
    let rows = writer
        .write_group_metadata(json!({ "request_id": request_id }))
        .await?;
    info!(
        "Map work for {} complete with {} rows; triggering reducer",
        request_id, rows
    );

    ctx.trigger(
        Stage::Reducer,
        &ReducerPayload {
            request_id: request_id.to_string(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::mapper::run_mapper;
    use crate::orchestrator::messages::{ChunkSpec, MapperPayload, WorkUnit};
    use crate::orchestrator::tests::{insert_bundle, recording_context, TestHarness};

    #[tokio::test]
    async fn test_only_last_worker_triggers_reducer() {
        let TestHarness {
            ctx,
            invoker,
            source,
            ..
        } = recording_context();
        insert_bundle(&source, "a", 100, 7).await;
        ctx.ledger
            .create_entry(
                "r1",
                "zarr",
                &[(Stage::Mapper, 1), (Stage::Worker, 0), (Stage::Reducer, 1)],
                serde_json::Value::Null,
            )
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
        let workers: Vec<WorkerPayload> = invoker
            .take()
            .await
            .into_iter()
            .map(|(_, p)| serde_json::from_value(p).unwrap())
            .collect();
        assert_eq!(workers.len(), 3);

        let mut finalized = 0;
        for payload in workers.into_iter().rev() {
            if let WorkerOutcome::Written { finalized: true, .. } =
                run_worker(&ctx, payload).await.unwrap()
            {
                finalized += 1;
            }
        }
        assert_eq!(finalized, 1);

        let calls = invoker.invocations().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "reducer");

        let writer = ctx.arrays.open(&ctx.array_name("r1")).await.unwrap();
        assert_eq!(writer.row_count().await.unwrap(), 7);
        assert!(writer.read_metadata("expression").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_out_of_range_chunk_fails() {
        let TestHarness { ctx, source, .. } = recording_context();
        insert_bundle(&source, "a", 0, 2).await;
        ctx.ledger
            .create_entry("r1", "zarr", &[(Stage::Worker, 1)], serde_json::Value::Null)
            .await
            .unwrap();

        let result = run_worker(
            &ctx,
            WorkerPayload {
                request_id: "r1".to_string(),
                chunk_spec: ChunkSpec {
                    source_ref: "a".to_string(),
                    start_row: 1,
                    num_rows: 5,
                },
            },
        )
        .await;
        assert!(matches!(result, Err(OrchestratorError::Source(_))));
    }
}
