//! In-memory source for tests and embedding

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{check_range, ExpressionSource, SourceError};
use crate::array::{ColumnFamily, RowBlock};

#[derive(Clone)]
struct Bundle {
    families: Vec<ColumnFamily>,
    block: RowBlock,
}

/// Serves preloaded row blocks by reference
#[derive(Default, Clone)]
pub struct StaticSource {
    bundles: Arc<RwLock<HashMap<String, Bundle>>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        source_ref: impl Into<String>,
        families: Vec<ColumnFamily>,
        block: RowBlock,
    ) {
        self.bundles
            .write()
            .await
            .insert(source_ref.into(), Bundle { families, block });
    }

    async fn bundle(&self, source_ref: &str) -> Result<Bundle, SourceError> {
        self.bundles
            .read()
            .await
            .get(source_ref)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(source_ref.to_string()))
    }
}

#[async_trait]
impl ExpressionSource for StaticSource {
    async fn families(&self, source_ref: &str) -> Result<Vec<ColumnFamily>, SourceError> {
        Ok(self.bundle(source_ref).await?.families)
    }

    async fn row_count(&self, source_ref: &str) -> Result<u64, SourceError> {
        Ok(self.bundle(source_ref).await?.block.row_count() as u64)
    }

    async fn read_rows(
        &self,
        source_ref: &str,
        start: u64,
        rows: u64,
    ) -> Result<RowBlock, SourceError> {
        let bundle = self.bundle(source_ref).await?;
        let range = check_range(source_ref, start, rows, bundle.block.row_count() as u64)?;
        Ok(bundle.block.slice_rows(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ColumnData, Dtype};

    #[tokio::test]
    async fn test_static_source_slices() {
        let source = StaticSource::new();
        source
            .insert(
                "bundle-1",
                vec![ColumnFamily::new("x", Dtype::U32, 1)],
                RowBlock::new(4).with_column("x", ColumnData::U32(vec![1, 2, 3, 4])),
            )
            .await;

        assert_eq!(source.row_count("bundle-1").await.unwrap(), 4);
        let block = source.read_rows("bundle-1", 1, 2).await.unwrap();
        assert_eq!(block.column("x"), Some(&ColumnData::U32(vec![2, 3])));

        assert!(matches!(
            source.read_rows("bundle-1", 3, 2).await,
            Err(SourceError::OutOfRange { .. })
        ));
        assert!(matches!(
            source.row_count("missing").await,
            Err(SourceError::NotFound(_))
        ));
    }
}
