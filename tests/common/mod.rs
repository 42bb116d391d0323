//! Common test utilities and helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cellmatrix::config::ServiceConfig;
use cellmatrix::orchestrator::{LocalRuntime, StageContext};
use cellmatrix::retry::RetryPolicy;
use cellmatrix::source::CsvSource;
use cellmatrix::storage::backends::{MemoryKeyValueStore, MemoryObjectStore};
use cellmatrix::storage::{KeyValueStore, ObjectStore};

/// In-memory config with small chunks and fast retries
pub fn fast_config() -> ServiceConfig {
    let mut config = ServiceConfig::in_memory();
    config.array.rows_per_chunk = 8;
    config.orchestrator.worker_chunk_rows = 5;
    config.lock.poll_interval = Duration::from_millis(2);
    config.retry = RetryPolicy {
        max_retries: 500,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        ..RetryPolicy::default()
    };
    config
}

/// Store clients shared by every context built in one test
#[derive(Clone)]
pub struct TestStores {
    pub kv: Arc<dyn KeyValueStore>,
    pub objects: Arc<dyn ObjectStore>,
}

impl TestStores {
    pub fn new() -> Self {
        Self {
            kv: Arc::new(MemoryKeyValueStore::new()),
            objects: Arc::new(MemoryObjectStore::new()),
        }
    }

    /// Local runtime reading CSV bundles from these stores
    pub fn runtime(&self, config: &ServiceConfig) -> LocalRuntime {
        let stores = self.clone();
        let config = config.clone();
        LocalRuntime::new(move |invoker| {
            StageContext::new(
                stores.kv.clone(),
                stores.objects.clone(),
                Arc::new(CsvSource::new(stores.objects.clone())),
                invoker,
                &config,
            )
        })
    }

    /// Upload a CSV bundle of `cells` numbered from `first_cell`
    pub async fn put_bundle(&self, key: &str, first_cell: i64, cells: usize) {
        self.objects
            .put(key, csv_bundle(first_cell, cells).into_bytes())
            .await
            .unwrap();
    }
}

/// `cell_id,GENE_A,GENE_B` rows whose values are derived from the cell id
pub fn csv_bundle(first_cell: i64, cells: usize) -> String {
    let mut body = String::from("cell_id,GENE_A,GENE_B\n");
    for cell in first_cell..first_cell + cells as i64 {
        body.push_str(&format!("{},{},{}\n", cell, cell as f32, cell as f32 * 2.0));
    }
    body
}
