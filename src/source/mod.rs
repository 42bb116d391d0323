//! Row sources for input bundles
//!
//! The Mapper asks a source how many rows a bundle has; each Worker asks it
//! for one contiguous slice of those rows.

pub mod csv_source;
pub mod static_source;

pub use csv_source::CsvSource;
pub use static_source::StaticSource;

use async_trait::async_trait;
use thiserror::Error;

use crate::array::{ColumnFamily, RowBlock};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Input {0} not found")]
    NotFound(String),

    #[error("Failed to parse input {source_ref}: {message}")]
    Parse { source_ref: String, message: String },

    #[error("Rows {start}..{end} out of range for input {source_ref} with {rows} rows")]
    OutOfRange {
        source_ref: String,
        start: u64,
        end: u64,
        rows: u64,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Yields expression rows for one input bundle
#[async_trait]
pub trait ExpressionSource: Send + Sync {
    /// Column families every block from this input carries
    async fn families(&self, source_ref: &str) -> Result<Vec<ColumnFamily>, SourceError>;

    async fn row_count(&self, source_ref: &str) -> Result<u64, SourceError>;

    /// Rows `start..start + rows`
    async fn read_rows(
        &self,
        source_ref: &str,
        start: u64,
        rows: u64,
    ) -> Result<RowBlock, SourceError>;
}

/// Bounds-check a read against a row count
pub(crate) fn check_range(
    source_ref: &str,
    start: u64,
    rows: u64,
    available: u64,
) -> Result<std::ops::Range<usize>, SourceError> {
    let end = start.saturating_add(rows);
    if end > available {
        return Err(SourceError::OutOfRange {
            source_ref: source_ref.to_string(),
            start,
            end,
            rows: available,
        });
    }
    Ok(start as usize..end as usize)
}
