//! End-to-end runs of the Driver/Mapper/Worker/Reducer pipeline

mod common;

use common::{fast_config, TestStores};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;

use cellmatrix::array::ColumnData;
use cellmatrix::ledger::Stage;
use cellmatrix::orchestrator::{
    complete_conversion, get_status, DriverPayload, Reconciler, RequestState,
};
use cellmatrix::storage::ObjectStore;

fn driver(request_id: &str, inputs: &[&str], format: &str) -> DriverPayload {
    DriverPayload {
        request_id: request_id.to_string(),
        input_refs: inputs.iter().map(|s| s.to_string()).collect(),
        format: format.to_string(),
        params: Value::Null,
    }
}

#[tokio::test]
async fn test_csv_bundles_merge_into_one_array() {
    let stores = TestStores::new();
    stores.put_bundle("bundles/a.csv", 1, 13).await;
    stores.put_bundle("bundles/b.csv", 100, 7).await;
    stores.put_bundle("bundles/c.csv", 500, 0).await;

    let config = fast_config();
    let mut runtime = stores.runtime(&config);
    runtime
        .submit(&driver(
            "r1",
            &["bundles/a.csv", "bundles/b.csv", "bundles/c.csv"],
            "zarr",
        ))
        .await
        .unwrap();
    let report = runtime.run_until_idle().await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);

    let ctx = runtime.context();
    let status = get_status(ctx, "r1").await.unwrap();
    assert_eq!(status.state, RequestState::Complete);
    assert_eq!(status.result_location.as_deref(), Some("results/r1.zarr"));

    let writer = ctx.arrays.open("results/r1.zarr").await.unwrap();
    assert_eq!(writer.row_count().await.unwrap(), 20);

    // Row order depends on worker interleaving; the set of cells does not
    let ColumnData::I64(cells) = writer.read_rows("cell_id", 0..20).await.unwrap() else {
        panic!("cell ids should be i64");
    };
    let cells: BTreeSet<i64> = cells.into_iter().collect();
    let expected: BTreeSet<i64> = (1..14).chain(100..107).collect();
    assert_eq!(cells, expected);

    let ColumnData::F32(values) = writer.read_rows("expression", 0..20).await.unwrap() else {
        panic!("expression should be f32");
    };
    let ColumnData::I64(order) = writer.read_rows("cell_id", 0..20).await.unwrap() else {
        panic!("cell ids should be i64");
    };
    for (row, cell) in order.iter().enumerate() {
        assert_eq!(values[row * 2], *cell as f32);
        assert_eq!(values[row * 2 + 1], *cell as f32 * 2.0);
    }

    let zattrs = stores.objects.get("results/r1.zarr/.zattrs").await.unwrap();
    let zattrs: Value = serde_json::from_slice(&zattrs.unwrap()).unwrap();
    assert_eq!(zattrs["row_count"], json!(20));
    assert!(stores
        .objects
        .exists("results/r1.zarr/expression/.zarray")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_identical_submission_reuses_result() {
    let stores = TestStores::new();
    stores.put_bundle("a.csv", 0, 6).await;
    stores.put_bundle("b.csv", 6, 6).await;

    let config = fast_config();
    let mut runtime = stores.runtime(&config);
    runtime
        .submit(&driver("first", &["a.csv", "b.csv"], "zarr"))
        .await
        .unwrap();
    let first = runtime.run_until_idle().await;

    runtime
        .submit(&driver("second", &["b.csv", "a.csv"], "zarr"))
        .await
        .unwrap();
    let second = runtime.run_until_idle().await;

    assert_eq!(second.invocations, 1, "reuse should not fan out");
    assert!(first.invocations > second.invocations);

    let ctx = runtime.context();
    let status = get_status(ctx, "second").await.unwrap();
    assert_eq!(status.request_id, "second");
    assert_eq!(status.state, RequestState::Complete);
    assert_eq!(status.result_location.as_deref(), Some("results/first.zarr"));
    assert!(ctx.arrays.open("results/second.zarr").await.is_err());
}

#[tokio::test]
async fn test_bad_bundle_fails_request() {
    let stores = TestStores::new();
    stores.put_bundle("good.csv", 0, 4).await;
    stores
        .objects
        .put("bad.csv", b"cell_id,GENE_A\nx,1\n".to_vec())
        .await
        .unwrap();

    let config = fast_config();
    let mut runtime = stores.runtime(&config);
    runtime
        .submit(&driver("r1", &["good.csv", "bad.csv"], "zarr"))
        .await
        .unwrap();
    let report = runtime.run_until_idle().await;
    assert_eq!(report.failures.len(), 1);

    let status = get_status(runtime.context(), "r1").await.unwrap();
    assert_eq!(status.state, RequestState::Failed);
    assert!(status.error.unwrap().contains("bad.csv"));
    assert_eq!(status.result_location, None);
}

#[tokio::test]
async fn test_non_native_format_waits_for_conversion() {
    let stores = TestStores::new();
    stores.put_bundle("a.csv", 0, 9).await;

    let config = fast_config();
    let mut runtime = stores.runtime(&config);
    runtime
        .submit(&driver("r1", &["a.csv"], "h5ad"))
        .await
        .unwrap();
    let report = runtime.run_until_idle().await;

    assert_eq!(report.conversions.len(), 1);
    let job = &report.conversions[0].payload;
    assert_eq!(job["source_location"], "results/r1.zarr");
    assert_eq!(job["format"], "h5ad");

    let ctx = runtime.context();
    assert_eq!(
        get_status(ctx, "r1").await.unwrap().state,
        RequestState::AwaitingConversion
    );

    let job_id = job["job_id"].as_str().unwrap();
    complete_conversion(ctx, "r1", job_id, "converted/r1.h5ad")
        .await
        .unwrap();
    let status = get_status(ctx, "r1").await.unwrap();
    assert_eq!(status.state, RequestState::Complete);
    assert_eq!(status.result_location.as_deref(), Some("converted/r1.h5ad"));
}

#[tokio::test]
async fn test_stale_request_times_out() {
    let stores = TestStores::new();
    let mut config = fast_config();
    config.orchestrator.request_timeout = Duration::from_millis(50);

    let runtime = stores.runtime(&config);
    let ctx = runtime.context();
    ctx.ledger
        .create_entry("stuck", "zarr", &[(Stage::Driver, 1)], Value::Null)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    let status = get_status(ctx, "stuck").await.unwrap();
    assert_eq!(status.state, RequestState::Failed);
    assert!(status.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_reconciler_completes_request_after_lost_trigger() {
    let stores = TestStores::new();
    stores.put_bundle("a.csv", 0, 3).await;
    let mut config = fast_config();
    config.orchestrator.reconcile_grace = Duration::ZERO;

    let mut runtime = stores.runtime(&config);
    runtime.submit(&driver("r1", &["a.csv"], "zarr")).await.unwrap();
    runtime.run_until_idle().await;

    // A finished request has nothing to reconcile
    let ctx = runtime.context().clone();
    assert!(ctx.ledger.is_stage_complete("r1", Stage::Reducer).await.unwrap());
    let reconciler = Reconciler::new(ctx.clone());
    assert!(reconciler.reconcile_once().await.unwrap().retriggered.is_empty());

    ctx.ledger
        .create_entry(
            "r2",
            "zarr",
            &[(Stage::Mapper, 0), (Stage::Worker, 0), (Stage::Reducer, 1)],
            Value::Null,
        )
        .await
        .unwrap();
    ctx.arrays
        .create(
            "results/r2.zarr",
            ctx.arrays.open("results/r1.zarr").await.unwrap().schema().clone(),
        )
        .await
        .unwrap();

    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.retriggered, vec!["r2".to_string()]);
    runtime.run_until_idle().await;

    assert_eq!(
        get_status(&ctx, "r2").await.unwrap().state,
        RequestState::Complete
    );
}
