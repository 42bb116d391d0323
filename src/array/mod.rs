//! Concurrently written chunked output arrays
//!
//! An array is a set of column families, each stored as fixed-shape row
//! chunks in the object store. Row ranges are handed out by a CAS counter in
//! the `arrays` table; chunk contents are only ever modified under the
//! chunk's distributed lock.

pub mod codec;
pub mod grid;
pub mod metadata;
pub mod schema;
pub mod writer;

pub use codec::ChunkCodec;
pub use grid::{ChunkGrid, ChunkSpan};
pub use metadata::{ArrayMetadata, GroupMetadata};
pub use schema::{ArraySchema, ColumnData, ColumnFamily, Dtype, RowBlock};
pub use writer::{ArrayField, ArrayStore, ChunkedArrayWriter};

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::lock::LockError;
use crate::storage::StorageError;

/// Errors from array operations
#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("Array {0} not found")]
    NotFound(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Chunk codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
