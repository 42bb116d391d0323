//! CSV bundles read from the object store
//!
//! One object per bundle. The header is `cell_id` followed by one column per
//! gene; every data row is an integer cell id and that cell's expression
//! values. Bundles feeding one request must share the same gene columns.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_range, ExpressionSource, SourceError};
use crate::array::{ColumnData, ColumnFamily, Dtype, RowBlock};
use crate::storage::ObjectStore;

pub const CELL_ID_FAMILY: &str = "cell_id";
pub const EXPRESSION_FAMILY: &str = "expression";

#[derive(Debug)]
struct ParsedBundle {
    genes: Vec<String>,
    cell_ids: Vec<i64>,
    expression: Vec<f32>,
}

impl ParsedBundle {
    fn rows(&self) -> usize {
        self.cell_ids.len()
    }

    fn families(&self) -> Vec<ColumnFamily> {
        vec![
            ColumnFamily::new(CELL_ID_FAMILY, Dtype::I64, 1),
            ColumnFamily::new(EXPRESSION_FAMILY, Dtype::F32, self.genes.len()),
        ]
    }
}

/// Reads `cell_id,gene...` CSV objects
#[derive(Clone)]
pub struct CsvSource {
    objects: Arc<dyn ObjectStore>,
    parsed: Arc<RwLock<HashMap<String, Arc<ParsedBundle>>>>,
}

impl CsvSource {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            parsed: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Gene column names of a bundle
    pub async fn genes(&self, source_ref: &str) -> Result<Vec<String>, SourceError> {
        Ok(self.load(source_ref).await?.genes.clone())
    }

    async fn load(&self, source_ref: &str) -> Result<Arc<ParsedBundle>, SourceError> {
        if let Some(bundle) = self.parsed.read().await.get(source_ref) {
            return Ok(bundle.clone());
        }

        let bytes = self
            .objects
            .get(source_ref)
            .await?
            .ok_or_else(|| SourceError::NotFound(source_ref.to_string()))?;
        let bundle = Arc::new(parse_bundle(source_ref, &bytes)?);
        debug!(
            "Parsed {} with {} cells x {} genes",
            source_ref,
            bundle.rows(),
            bundle.genes.len()
        );

        self.parsed
            .write()
            .await
            .insert(source_ref.to_string(), bundle.clone());
        Ok(bundle)
    }
}

fn parse_bundle(source_ref: &str, bytes: &[u8]) -> Result<ParsedBundle, SourceError> {
    let parse_error = |message: String| SourceError::Parse {
        source_ref: source_ref.to_string(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| parse_error(e.to_string()))?
        .clone();
    let mut columns = headers.iter();
    if columns.next() != Some(CELL_ID_FAMILY) {
        return Err(parse_error(format!(
            "first column must be '{}'",
            CELL_ID_FAMILY
        )));
    }
    let genes: Vec<String> = columns.map(str::to_string).collect();
    if genes.is_empty() {
        return Err(parse_error("no gene columns".to_string()));
    }

    let mut cell_ids = Vec::new();
    let mut expression = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let row = result.map_err(|e| parse_error(e.to_string()))?;
        let mut fields = row.iter();

        let cell_id = fields
            .next()
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| parse_error(format!("row {}: invalid cell_id", line + 1)))?;
        cell_ids.push(cell_id);

        for (gene, value) in genes.iter().zip(fields) {
            let value = value.parse::<f32>().map_err(|_| {
                parse_error(format!(
                    "row {}: invalid value '{}' for gene {}",
                    line + 1,
                    value,
                    gene
                ))
            })?;
            expression.push(value);
        }
    }

    Ok(ParsedBundle {
        genes,
        cell_ids,
        expression,
    })
}

#[async_trait]
impl ExpressionSource for CsvSource {
    async fn families(&self, source_ref: &str) -> Result<Vec<ColumnFamily>, SourceError> {
        Ok(self.load(source_ref).await?.families())
    }

    async fn row_count(&self, source_ref: &str) -> Result<u64, SourceError> {
        Ok(self.load(source_ref).await?.rows() as u64)
    }

    async fn read_rows(
        &self,
        source_ref: &str,
        start: u64,
        rows: u64,
    ) -> Result<RowBlock, SourceError> {
        let bundle = self.load(source_ref).await?;
        let range = check_range(source_ref, start, rows, bundle.rows() as u64)?;
        let width = bundle.genes.len();

        Ok(RowBlock::new(range.len())
            .with_column(
                CELL_ID_FAMILY,
                ColumnData::I64(bundle.cell_ids[range.clone()].to_vec()),
            )
            .with_column(
                EXPRESSION_FAMILY,
                ColumnData::F32(bundle.expression[range.start * width..range.end * width].to_vec()),
            ))
    }
}
