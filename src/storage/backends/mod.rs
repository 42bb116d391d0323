//! Store client implementations

pub mod file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "s3")]
pub mod s3;

pub use file::FileObjectStore;
pub use memory::{MemoryKeyValueStore, MemoryObjectStore, MemoryQueue, RecordingInvoker};
#[cfg(feature = "redis")]
pub use redis::{RedisKeyValueStore, RedisQueue};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
