//! `.zarray` / `.zgroup` style metadata blobs

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::ColumnFamily;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compressor {
    pub id: String,
    pub level: u32,
}

/// Descriptor of one column family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub zarr_format: u32,
    pub shape: [u64; 2],
    pub chunks: [u64; 2],
    pub dtype: String,
    pub compressor: Compressor,
    pub fill_value: Value,
    pub order: String,
    pub filters: Option<Value>,
}

impl ArrayMetadata {
    pub fn new(family: &ColumnFamily, row_count: u64, rows_per_chunk: u64, level: u32) -> Self {
        Self {
            zarr_format: 2,
            shape: [row_count, family.width as u64],
            chunks: [rows_per_chunk, family.width as u64],
            dtype: family.dtype.typestr().to_string(),
            compressor: Compressor {
                id: "zlib".to_string(),
                level,
            },
            fill_value: Value::from(0),
            order: "C".to_string(),
            filters: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub zarr_format: u32,
}

impl Default for GroupMetadata {
    fn default() -> Self {
        Self { zarr_format: 2 }
    }
}
