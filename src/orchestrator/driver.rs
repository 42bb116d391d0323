//! Driver: validates a request and fans out one Mapper per input

use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::messages::{DriverPayload, MapperPayload, WorkUnit};
use super::status::{derive_status, RequestState};
use super::{OrchestratorError, StageContext};
use crate::cache::RequestCache;
use crate::ledger::{RequestField, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// Ledger entry created and `mappers` Mapper triggers emitted
    Started { mappers: usize },
    /// An identical live request already exists; this one points at it
    Reused { source_request_id: String },
    /// The ledger entry already existed, so this trigger was a redelivery
    Duplicate,
}

fn validate(ctx: &StageContext, payload: &DriverPayload) -> Result<Vec<String>, OrchestratorError> {
    if payload.request_id.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "request_id must not be empty".to_string(),
        ));
    }
    if !ctx.config.supported_formats.contains(&payload.format) {
        return Err(OrchestratorError::Validation(format!(
            "unsupported format '{}' (expected one of {})",
            payload.format,
            ctx.config.supported_formats.join(", ")
        )));
    }
    if payload.input_refs.iter().any(|r| r.trim().is_empty()) {
        return Err(OrchestratorError::Validation(
            "input_refs must not contain empty references".to_string(),
        ));
    }

    let inputs: Vec<String> = payload
        .input_refs
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if inputs.is_empty() {
        return Err(OrchestratorError::Validation(
            "input_refs must not be empty".to_string(),
        ));
    }
    Ok(inputs)
}

/// Run the Driver stage for one submission
pub async fn run_driver(
    ctx: &StageContext,
    payload: DriverPayload,
) -> Result<DriverOutcome, OrchestratorError> {
    let inputs = validate(ctx, &payload)?;
    let request_id = payload.request_id.as_str();
    let request_hash = RequestCache::hash(&inputs, &payload.format, &payload.params);
    debug!("Request {} hashes to {}", request_id, request_hash);

    if let Some(existing) = ctx.cache.lookup_by_hash(&request_hash).await? {
        if existing != request_id {
            if let Some(outcome) = reuse(ctx, &payload, &existing).await? {
                return Ok(outcome);
            }
        }
    }

    if ctx.ledger.get_entry(request_id).await?.is_some() {
        info!("Ignoring repeated Driver trigger for {}", request_id);
        return Ok(DriverOutcome::Duplicate);
    }
    ctx.cache.initialize(request_id).await?;

    let mut expected = vec![
        (Stage::Driver, 1),
        (Stage::Mapper, inputs.len() as u64),
        (Stage::Worker, 0),
        (Stage::Reducer, 1),
    ];
    if !ctx.is_native_format(&payload.format) {
        expected.push((Stage::Converter, 1));
    }

    let created = ctx
        .ledger
        .create_entry(request_id, &payload.format, &expected, payload.params.clone())
        .await?;
    if !created {
        info!("Ignoring repeated Driver trigger for {}", request_id);
        return Ok(DriverOutcome::Duplicate);
    }

    ctx.cache.set_hash(request_id, &request_hash).await?;

    for source_ref in &inputs {
        ctx.trigger(
            Stage::Mapper,
            &MapperPayload {
                request_id: request_id.to_string(),
                work_unit: WorkUnit {
                    source_ref: source_ref.clone(),
                },
            },
        )
        .await?;
    }

    ctx.ledger
        .increment(request_id, RequestField::Completed(Stage::Driver), 1)
        .await?;
    info!(
        "Request {} started with {} inputs (format {})",
        request_id,
        inputs.len(),
        payload.format
    );
    Ok(DriverOutcome::Started {
        mappers: inputs.len(),
    })
}

/// Point `payload.request_id` at `existing` if that request is still usable.
/// Returns `None` when the existing request failed, timed out, was aborted
/// or vanished.
async fn reuse(
    ctx: &StageContext,
    payload: &DriverPayload,
    existing: &str,
) -> Result<Option<DriverOutcome>, OrchestratorError> {
    let Some(entry) = ctx.ledger.get_entry(existing).await? else {
        return Ok(None);
    };
    let state = derive_status(&entry, &ctx.config, Utc::now()).state;
    if matches!(state, RequestState::Failed | RequestState::Aborted) {
        debug!("Not reusing {}: it is {}", existing, state);
        return Ok(None);
    }

    let request_id = payload.request_id.as_str();
    let created = ctx
        .ledger
        .create_entry(
            request_id,
            &payload.format,
            &[(Stage::Driver, 1)],
            payload.params.clone(),
        )
        .await?;
    if !created {
        return Ok(Some(DriverOutcome::Duplicate));
    }
    ctx.ledger.set_reused_from(request_id, existing).await?;
    ctx.ledger
        .increment(request_id, RequestField::Completed(Stage::Driver), 1)
        .await?;

    info!("Request {} reuses the result of {}", request_id, existing);
    Ok(Some(DriverOutcome::Reused {
        source_request_id: existing.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{recording_context, TestHarness};
    use serde_json::json;
    use std::time::Duration;

    fn payload(request_id: &str, inputs: &[&str], format: &str) -> DriverPayload {
        DriverPayload {
            request_id: request_id.to_string(),
            input_refs: inputs.iter().map(|s| s.to_string()).collect(),
            format: format.to_string(),
            params: json!({"filter": "organ = 'liver'"}),
        }
    }

    #[tokio::test]
    async fn test_driver_fans_out_one_mapper_per_unique_input() {
        let TestHarness { ctx, invoker, .. } = recording_context();

        let outcome = run_driver(&ctx, payload("r1", &["b", "a", "b"], "zarr"))
            .await
            .unwrap();
        assert_eq!(outcome, DriverOutcome::Started { mappers: 2 });

        let entry = ctx.ledger.entry("r1").await.unwrap();
        assert_eq!(entry.expected(Stage::Mapper), 2);
        assert!(entry.is_stage_complete(Stage::Driver));
        assert_eq!(entry.progress(Stage::Converter).expected, None);

        let calls = invoker.invocations().await;
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(name, _)| name == "mapper"));
        assert_eq!(calls[0].1["work_unit"]["source_ref"], "a");

        assert!(ctx.cache.hash_for_request("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_driver_rejects_invalid_requests_without_ledger_entry() {
        let TestHarness { ctx, invoker, .. } = recording_context();

        for bad in [
            payload("", &["a"], "zarr"),
            payload("r1", &[], "zarr"),
            payload("r1", &["a"], "parquet"),
            payload("r1", &["a", " "], "zarr"),
        ] {
            assert!(matches!(
                run_driver(&ctx, bad).await,
                Err(OrchestratorError::Validation(_))
            ));
        }
        assert!(ctx.ledger.get_entry("r1").await.unwrap().is_none());
        assert!(invoker.invocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_trigger_does_not_fan_out_twice() {
        let TestHarness { ctx, invoker, .. } = recording_context();

        run_driver(&ctx, payload("r1", &["a"], "zarr")).await.unwrap();
        let hash = ctx.cache.hash_for_request("r1").await.unwrap().unwrap();
        let again = run_driver(&ctx, payload("r1", &["a"], "zarr")).await.unwrap();

        assert_eq!(again, DriverOutcome::Duplicate);
        assert_eq!(invoker.invocations().await.len(), 1);
        assert_eq!(ctx.cache.hash_for_request("r1").await.unwrap(), Some(hash));
        assert_eq!(
            ctx.ledger.entry("r1").await.unwrap().completed(Stage::Driver),
            1
        );
    }

    #[tokio::test]
    async fn test_identical_request_reuses_existing() {
        let TestHarness { ctx, invoker, .. } = recording_context();

        run_driver(&ctx, payload("r1", &["a", "b"], "zarr")).await.unwrap();
        let outcome = run_driver(&ctx, payload("r2", &["b", "a"], "zarr"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DriverOutcome::Reused {
                source_request_id: "r1".to_string()
            }
        );
        assert_eq!(
            ctx.ledger.entry("r2").await.unwrap().reused_from.as_deref(),
            Some("r1")
        );
        assert_eq!(invoker.invocations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_request_is_not_reused() {
        let TestHarness { ctx, .. } = recording_context();

        run_driver(&ctx, payload("r1", &["a"], "zarr")).await.unwrap();
        ctx.ledger.log_error("r1", "worker crashed").await.unwrap();

        let outcome = run_driver(&ctx, payload("r2", &["a"], "zarr")).await.unwrap();
        assert_eq!(outcome, DriverOutcome::Started { mappers: 1 });
    }

    #[tokio::test]
    async fn test_timed_out_request_is_not_reused() {
        let TestHarness { mut ctx, .. } = recording_context();
        ctx.config.request_timeout = Duration::from_millis(50);

        run_driver(&ctx, payload("r1", &["a"], "zarr")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let outcome = run_driver(&ctx, payload("r2", &["a"], "zarr")).await.unwrap();
        assert_eq!(outcome, DriverOutcome::Started { mappers: 1 });
        assert_eq!(ctx.ledger.entry("r2").await.unwrap().reused_from, None);
        assert_eq!(
            ctx.cache
                .lookup_by_hash(&ctx.cache.hash_for_request("r2").await.unwrap().unwrap())
                .await
                .unwrap()
                .as_deref(),
            Some("r2")
        );
    }

    #[tokio::test]
    async fn test_aborted_request_is_not_reused() {
        let TestHarness { ctx, .. } = recording_context();

        run_driver(&ctx, payload("r1", &["a"], "zarr")).await.unwrap();
        ctx.ledger.abort("r1").await.unwrap();

        let outcome = run_driver(&ctx, payload("r2", &["a"], "zarr")).await.unwrap();
        assert_eq!(outcome, DriverOutcome::Started { mappers: 1 });
    }

    #[tokio::test]
    async fn test_non_native_format_expects_conversion() {
        let TestHarness { ctx, .. } = recording_context();

        run_driver(&ctx, payload("r1", &["a"], "loom")).await.unwrap();
        let entry = ctx.ledger.entry("r1").await.unwrap();
        assert_eq!(entry.progress(Stage::Converter).expected, Some(1));
    }
}
