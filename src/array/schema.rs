//! Column families, element types, and row blocks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ArrayError;

/// Element type of a column family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F32,
    F64,
    I32,
    I64,
    U32,
}

impl Dtype {
    /// Bytes per element
    pub fn size(&self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
        }
    }

    /// Little-endian typestr as written into `.zarray`
    pub fn typestr(&self) -> &'static str {
        match self {
            Dtype::F32 => "<f4",
            Dtype::F64 => "<f8",
            Dtype::I32 => "<i4",
            Dtype::I64 => "<i8",
            Dtype::U32 => "<u4",
        }
    }
}

/// One named group of columns sharing a dtype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamily {
    pub name: String,
    pub dtype: Dtype,
    /// Columns per row
    pub width: usize,
}

impl ColumnFamily {
    pub fn new(name: impl Into<String>, dtype: Dtype, width: usize) -> Self {
        Self {
            name: name.into(),
            dtype,
            width,
        }
    }

    pub fn row_bytes(&self) -> usize {
        self.width * self.dtype.size()
    }
}

/// Layout of an output array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySchema {
    pub rows_per_chunk: u64,
    pub families: Vec<ColumnFamily>,
}

impl ArraySchema {
    pub fn new(rows_per_chunk: u64, families: Vec<ColumnFamily>) -> Self {
        Self {
            rows_per_chunk,
            families,
        }
    }

    pub fn family(&self, name: &str) -> Option<&ColumnFamily> {
        self.families.iter().find(|f| f.name == name)
    }

    pub fn validate(&self) -> Result<(), ArrayError> {
        if self.rows_per_chunk == 0 {
            return Err(ArrayError::Schema("rows_per_chunk must be positive".into()));
        }
        if self.families.is_empty() {
            return Err(ArrayError::Schema("no column families".into()));
        }
        for (i, family) in self.families.iter().enumerate() {
            let valid_name = !family.name.is_empty()
                && !family.name.starts_with('.')
                && family
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_name {
                return Err(ArrayError::Schema(format!(
                    "invalid column family name '{}'",
                    family.name
                )));
            }
            if family.width == 0 {
                return Err(ArrayError::Schema(format!(
                    "column family '{}' has zero width",
                    family.name
                )));
            }
            if self.families[..i].iter().any(|f| f.name == family.name) {
                return Err(ArrayError::Schema(format!(
                    "duplicate column family '{}'",
                    family.name
                )));
            }
        }
        Ok(())
    }
}

macro_rules! encode_le {
    ($values:expr) => {
        $values.iter().flat_map(|v| v.to_le_bytes()).collect()
    };
}

macro_rules! decode_le {
    ($bytes:expr, $ty:ty) => {{
        const N: usize = std::mem::size_of::<$ty>();
        $bytes
            .chunks_exact(N)
            .map(|b| {
                let mut raw = [0u8; N];
                raw.copy_from_slice(b);
                <$ty>::from_le_bytes(raw)
            })
            .collect()
    }};
}

/// Row-major values of one column family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U32(Vec<u32>),
}

impl ColumnData {
    pub fn dtype(&self) -> Dtype {
        match self {
            ColumnData::F32(_) => Dtype::F32,
            ColumnData::F64(_) => Dtype::F64,
            ColumnData::I32(_) => Dtype::I32,
            ColumnData::I64(_) => Dtype::I64,
            ColumnData::U32(_) => Dtype::U32,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            ColumnData::F32(v) => v.len(),
            ColumnData::F64(v) => v.len(),
            ColumnData::I32(v) => v.len(),
            ColumnData::I64(v) => v.len(),
            ColumnData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn empty(dtype: Dtype) -> Self {
        match dtype {
            Dtype::F32 => ColumnData::F32(Vec::new()),
            Dtype::F64 => ColumnData::F64(Vec::new()),
            Dtype::I32 => ColumnData::I32(Vec::new()),
            Dtype::I64 => ColumnData::I64(Vec::new()),
            Dtype::U32 => ColumnData::U32(Vec::new()),
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            ColumnData::F32(v) => encode_le!(v),
            ColumnData::F64(v) => encode_le!(v),
            ColumnData::I32(v) => encode_le!(v),
            ColumnData::I64(v) => encode_le!(v),
            ColumnData::U32(v) => encode_le!(v),
        }
    }

    pub fn from_le_bytes(dtype: Dtype, bytes: &[u8]) -> Result<Self, ArrayError> {
        if bytes.len() % dtype.size() != 0 {
            return Err(ArrayError::Codec(format!(
                "{} bytes is not a whole number of {:?} elements",
                bytes.len(),
                dtype
            )));
        }
        Ok(match dtype {
            Dtype::F32 => ColumnData::F32(decode_le!(bytes, f32)),
            Dtype::F64 => ColumnData::F64(decode_le!(bytes, f64)),
            Dtype::I32 => ColumnData::I32(decode_le!(bytes, i32)),
            Dtype::I64 => ColumnData::I64(decode_le!(bytes, i64)),
            Dtype::U32 => ColumnData::U32(decode_le!(bytes, u32)),
        })
    }

    /// Elements `range` as a new column
    pub fn slice(&self, range: std::ops::Range<usize>) -> ColumnData {
        match self {
            ColumnData::F32(v) => ColumnData::F32(v[range].to_vec()),
            ColumnData::F64(v) => ColumnData::F64(v[range].to_vec()),
            ColumnData::I32(v) => ColumnData::I32(v[range].to_vec()),
            ColumnData::I64(v) => ColumnData::I64(v[range].to_vec()),
            ColumnData::U32(v) => ColumnData::U32(v[range].to_vec()),
        }
    }

    /// Append another column of the same dtype
    pub fn extend(&mut self, other: ColumnData) -> Result<(), ArrayError> {
        match (self, other) {
            (ColumnData::F32(a), ColumnData::F32(b)) => a.extend(b),
            (ColumnData::F64(a), ColumnData::F64(b)) => a.extend(b),
            (ColumnData::I32(a), ColumnData::I32(b)) => a.extend(b),
            (ColumnData::I64(a), ColumnData::I64(b)) => a.extend(b),
            (ColumnData::U32(a), ColumnData::U32(b)) => a.extend(b),
            (a, b) => {
                return Err(ArrayError::Schema(format!(
                    "cannot append {:?} to {:?}",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }
}

/// A block of rows, one `ColumnData` per column family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBlock {
    rows: usize,
    columns: BTreeMap<String, ColumnData>,
}

impl RowBlock {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, family: impl Into<String>, data: ColumnData) -> Self {
        self.columns.insert(family.into(), data);
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column(&self, family: &str) -> Option<&ColumnData> {
        self.columns.get(family)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &ColumnData)> {
        self.columns.iter()
    }

    /// Copy out rows `range`; panics if the range exceeds the block
    pub fn slice_rows(&self, range: std::ops::Range<usize>) -> RowBlock {
        let rows = range.len();
        let columns = self
            .columns
            .iter()
            .map(|(name, data)| {
                let width = if self.rows == 0 { 0 } else { data.len() / self.rows };
                (
                    name.clone(),
                    data.slice(range.start * width..range.end * width),
                )
            })
            .collect();
        RowBlock { rows, columns }
    }

    /// Check that the block carries exactly the schema's families with
    /// matching dtypes and `rows * width` values each
    pub fn validate(&self, schema: &ArraySchema) -> Result<(), ArrayError> {
        for family in &schema.families {
            let column = self.columns.get(&family.name).ok_or_else(|| {
                ArrayError::Schema(format!("row block is missing family '{}'", family.name))
            })?;
            if column.dtype() != family.dtype {
                return Err(ArrayError::Schema(format!(
                    "family '{}' expects {:?}, got {:?}",
                    family.name,
                    family.dtype,
                    column.dtype()
                )));
            }
            if column.len() != self.rows * family.width {
                return Err(ArrayError::Schema(format!(
                    "family '{}' expects {} values for {} rows, got {}",
                    family.name,
                    self.rows * family.width,
                    self.rows,
                    column.len()
                )));
            }
        }
        if let Some(extra) = self
            .columns
            .keys()
            .find(|name| schema.family(name).is_none())
        {
            return Err(ArrayError::Schema(format!(
                "row block has unknown family '{}'",
                extra
            )));
        }
        Ok(())
    }
}
