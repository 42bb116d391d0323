//! Mapper: splits one input bundle into Worker-sized chunks

use tracing::{debug, info};

use super::messages::{ChunkSpec, MapperPayload, WorkerPayload};
use super::worker::finalize_map_work;
use super::{OrchestratorError, StageContext};
use crate::array::ArraySchema;
use crate::ledger::{RequestField, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapperOutcome {
    /// `workers` Worker triggers emitted; `finalized` if this mapper closed map work
    Mapped { workers: usize, finalized: bool },
    /// Request already failed or aborted
    Skipped,
}

pub async fn run_mapper(
    ctx: &StageContext,
    payload: MapperPayload,
) -> Result<MapperOutcome, OrchestratorError> {
    let request_id = payload.request_id.as_str();
    let source_ref = payload.work_unit.source_ref.as_str();

    let entry = ctx.ledger.entry(request_id).await?;
    if entry.is_terminal() {
        debug!("Skipping mapper for terminal request {}", request_id);
        return Ok(MapperOutcome::Skipped);
    }

    let families = ctx.source.families(source_ref).await?;
    let schema = ArraySchema::new(ctx.arrays.config().rows_per_chunk, families);
    ctx.arrays
        .create(&ctx.array_name(request_id), schema)
        .await?;

    let total_rows = ctx.source.row_count(source_ref).await?;
    let chunks = ChunkSpec::split(source_ref, total_rows, ctx.config.worker_chunk_rows);

    // Announce the workers before any of them can report completion
    let update = ctx
        .ledger
        .increment_fields(
            request_id,
            &[
                (RequestField::Expected(Stage::Worker), chunks.len() as u64),
                (RequestField::Completed(Stage::Mapper), 1),
            ],
        )
        .await?;

    let workers = chunks.len();
    for chunk_spec in chunks {
        ctx.trigger(
            Stage::Worker,
            &WorkerPayload {
                request_id: request_id.to_string(),
                chunk_spec,
            },
        )
        .await?;
    }
    info!(
        "Mapped {} ({} rows) into {} workers for {}",
        source_ref, total_rows, workers, request_id
    );

    let finalized = update.completed_map_work();
    if finalized {
        finalize_map_work(ctx, request_id).await?;
    }
    Ok(MapperOutcome::Mapped { workers, finalized })
}
