//! Store clients consumed by the coordination layer
//!
//! Every component receives its clients as `Arc<dyn Trait>` built by
//! `StorageFactory`; tests wire the in-memory backends directly.

pub mod backends;
pub mod error;
pub mod factory;
pub mod traits;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use factory::{StorageFactory, StoreClients};
pub use traits::{Invoker, KeyValueStore, MessageQueue, ObjectStore};
pub use types::{record, Condition, QueueMessage, Record, RecordExt, Table, TableField};
