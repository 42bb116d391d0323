//! # cellmatrix
//!
//! Distributed orchestration for merging per-cell gene-expression bundles into
//! one chunked output array, on behalf of many concurrent requests.
//!
//! ## Modules
//!
//! - `storage` - Store client traits (key-value, object, queue, invoker) and backends
//! - `config` - Service configuration loaded from TOML/YAML and the environment
//! - `retry` - Bounded exponential backoff with jitter
//! - `lock` - Lease-based distributed mutual exclusion
//! - `ledger` - Per-request stage counters with compare-and-swap updates
//! - `cache` - Content-hash cache letting identical requests share one result
//! - `array` - Chunked output arrays written concurrently by many workers
//! - `source` - Row sources for input bundles
//! - `orchestrator` - Driver / Mapper / Worker / Reducer stages and their runtimes
pub mod array;
pub mod cache;
pub mod config;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod storage;

pub use config::ServiceConfig;
pub use orchestrator::{OrchestratorError, StageContext};
