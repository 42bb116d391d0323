//! Reducer: records the result and schedules format conversion
//!
//! Safe to run more than once for the same request. The conversion slot is
//! claimed with a conditional write, and the reducer counter refuses to move
//! past its expected count of one.

use tracing::{debug, info};
use uuid::Uuid;

use super::messages::{ConverterPayload, ReducerPayload};
use super::{OrchestratorError, StageContext};
use crate::ledger::{LedgerError, RequestField, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReducerOutcome {
    Complete { result_location: String },
    /// Conversion job `job_id` scheduled
    AwaitingConversion { job_id: String },
    /// Another reducer invocation already finished this request
    AlreadyDone,
    Skipped,
}

pub async fn run_reducer(
    ctx: &StageContext,
    payload: ReducerPayload,
) -> Result<ReducerOutcome, OrchestratorError> {
    let request_id = payload.request_id.as_str();
    let entry = ctx.ledger.entry(request_id).await?;

    if entry.is_terminal() {
        debug!("Skipping reducer for terminal request {}", request_id);
        return Ok(ReducerOutcome::Skipped);
    }
    if entry.is_stage_complete(Stage::Reducer) {
        debug!("Reducer for {} already ran", request_id);
        return Ok(ReducerOutcome::AlreadyDone);
    }
    if !entry.map_work_complete() {
        return Err(OrchestratorError::Work(format!(
            "reducer triggered for {} before map work completed",
            request_id
        )));
    }

    let location = ctx.array_name(request_id);
    ctx.ledger.set_result_location(request_id, &location).await?;

    let outcome = if ctx.is_native_format(&entry.format) {
        ReducerOutcome::Complete {
            result_location: location.clone(),
        }
    } else {
        let job_id = Uuid::new_v4().to_string();
        if ctx.ledger.set_conversion_job(request_id, &job_id).await? {
            ctx.trigger(
                Stage::Converter,
                &ConverterPayload {
                    request_id: request_id.to_string(),
                    job_id: job_id.clone(),
                    source_location: location.clone(),
                    format: entry.format.clone(),
                },
            )
            .await?;
            info!(
                "Scheduled {} conversion job {} for {}",
                entry.format, job_id, request_id
            );
            ReducerOutcome::AwaitingConversion { job_id }
        } else {
            let existing = ctx.ledger.entry(request_id).await?.conversion_job_id;
            ReducerOutcome::AwaitingConversion {
                job_id: existing.unwrap_or(job_id),
            }
        }
    };

    match ctx
        .ledger
        .increment(request_id, RequestField::Completed(Stage::Reducer), 1)
        .await
    {
        Ok(_) => {}
        Err(LedgerError::Validation(_)) => return Ok(ReducerOutcome::AlreadyDone),
        Err(e) => return Err(e.into()),
    }

    info!("Request {} reduced to {}", request_id, location);
    Ok(outcome)
}

/// Record the output of a finished conversion job
pub async fn complete_conversion(
    ctx: &StageContext,
    request_id: &str,
    job_id: &str,
    converted_location: &str,
) -> Result<(), OrchestratorError> {
    let entry = ctx.ledger.entry(request_id).await?;
    if entry.conversion_job_id.as_deref() != Some(job_id) {
        return Err(OrchestratorError::Validation(format!(
            "conversion job {} does not belong to request {}",
            job_id, request_id
        )));
    }
    if entry.is_stage_complete(Stage::Converter) {
        debug!("Conversion for {} already recorded", request_id);
        return Ok(());
    }

    ctx.ledger
        .set_converted_location(request_id, converted_location)
        .await?;
    match ctx
        .ledger
        .increment(request_id, RequestField::Completed(Stage::Converter), 1)
        .await
    {
        Ok(_) | Err(LedgerError::Validation(_)) => {}
        Err(e) => return Err(e.into()),
    }

    info!(
        "Conversion job {} for {} finished at {}",
        job_id, request_id, converted_location
    );
    Ok(())
}
