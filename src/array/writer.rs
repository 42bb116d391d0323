//! Row allocation and locked chunk read-modify-write

use futures::future::try_join_all;
use serde_json::{json, Value};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ArrayError, ArrayMetadata, ArraySchema, ChunkCodec, ChunkGrid, ChunkSpan, ColumnData,
    ColumnFamily, GroupMetadata, RowBlock,
};
use crate::config::ArrayConfig;
use crate::ledger::{now_millis, CasCounter};
use crate::lock::DistributedLock;
use crate::retry::RetryPolicy;
use crate::storage::{
    record, KeyValueStore, ObjectStore, Record, RecordExt, StorageError, Table, TableField,
};

/// Fields of the `arrays` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayField {
    RowCount,
    Schema,
    CreatedAt,
}

impl TableField for ArrayField {
    const TABLE: Table = Table::Arrays;

    fn name(self) -> &'static str {
        match self {
            ArrayField::RowCount => "row_count",
            ArrayField::Schema => "schema",
            ArrayField::CreatedAt => "created_at_ms",
        }
    }
}

/// Shared clients for creating and opening arrays
#[derive(Clone)]
pub struct ArrayStore {
    kv: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
    lock: DistributedLock,
    counter: CasCounter,
    retry: RetryPolicy,
    codec: ChunkCodec,
    config: ArrayConfig,
}

impl ArrayStore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        objects: Arc<dyn ObjectStore>,
        lock: DistributedLock,
        retry: RetryPolicy,
        config: ArrayConfig,
    ) -> Self {
        Self {
            counter: CasCounter::new(kv.clone(), retry.clone()),
            codec: ChunkCodec::new(config.compression_level),
            kv,
            objects,
            lock,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    /// Create an array, or open it if it already exists with the same schema
    pub async fn create(
        &self,
        name: &str,
        schema: ArraySchema,
    ) -> Result<ChunkedArrayWriter, ArrayError> {
        schema.validate()?;

        let initial = record([
            (ArrayField::RowCount, json!(0)),
            (
                ArrayField::Schema,
                serde_json::to_value(&schema).map_err(StorageError::from)?,
            ),
            (ArrayField::CreatedAt, json!(now_millis())),
        ]);

        match self
            .kv
            .put_if_absent(Table::Arrays, name, initial, None)
            .await
        {
            Ok(()) => {
                info!(
                    "Created array {} with {} column families",
                    name,
                    schema.families.len()
                );
                Ok(self.writer(name, schema))
            }
            Err(e) if e.is_conflict() => {
                let existing = self.open(name).await?;
                if existing.schema != schema {
                    return Err(ArrayError::Schema(format!(
                        "array {} already exists with a different schema",
                        name
                    )));
                }
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open an existing array
    pub async fn open(&self, name: &str) -> Result<ChunkedArrayWriter, ArrayError> {
        let stored = self
            .kv
            .get(Table::Arrays, name)
            .await?
            .ok_or_else(|| ArrayError::NotFound(name.to_string()))?;
        let schema: ArraySchema = stored
            .field(ArrayField::Schema)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(StorageError::from)?
            .ok_or_else(|| ArrayError::Schema(format!("array {} has no schema", name)))?;
        Ok(self.writer(name, schema))
    }

    fn writer(&self, name: &str, schema: ArraySchema) -> ChunkedArrayWriter {
        ChunkedArrayWriter {
            name: name.to_string(),
            grid: ChunkGrid::new(schema.rows_per_chunk),
            schema,
            store: self.clone(),
        }
    }
}

/// Handle on one output array
#[derive(Clone)]
pub struct ChunkedArrayWriter {
    name: String,
    schema: ArraySchema,
    grid: ChunkGrid,
    store: ArrayStore,
}

impl ChunkedArrayWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub fn chunk_key(&self, family: &str, chunk_index: u64) -> String {
        format!("{}/{}/{}", self.name, family, chunk_index)
    }

    pub async fn row_count(&self) -> Result<u64, ArrayError> {
        let stored = self
            .store
            .kv
            .get(Table::Arrays, &self.name)
            .await?
            .ok_or_else(|| ArrayError::NotFound(self.name.clone()))?;
        Ok(stored.u64_field(ArrayField::RowCount))
    }

    /// Reserve `rows` rows at the end of the array
    pub async fn allocate_rows(&self, rows: u64) -> Result<Range<u64>, ArrayError> {
        let (before, _) = self
            .store
            .counter
            .increment(
                &self.name,
                &[(ArrayField::RowCount, rows)],
                &Record::new(),
                |_| Ok(()),
            )
            .await
            .map_err(|e| match e {
                crate::ledger::LedgerError::NotFound(_) => ArrayError::NotFound(self.name.clone()),
                other => other.into(),
            })?;
        let start = before.u64_field(ArrayField::RowCount);
        Ok(start..start + rows)
    }

    /// Append a block of rows, returning the rows it occupies
    pub async fn write_rows(&self, block: &RowBlock) -> Result<Range<u64>, ArrayError> {
        block.validate(&self.schema)?;

        let rows = block.row_count() as u64;
        if rows == 0 {
            let end = self.row_count().await?;
            return Ok(end..end);
        }

        let range = self.allocate_rows(rows).await?;
        let spans = self.grid.spans(range.clone());
        debug!(
            "Writing rows {:?} of {} across {} chunk(s)",
            range,
            self.name,
            spans.len()
        );

        let encoded = self
            .schema
            .families
            .iter()
            .map(|family| {
                block
                    .column(&family.name)
                    .map(|column| (family, column.to_le_bytes()))
                    .ok_or_else(|| {
                        ArrayError::Schema(format!("missing family '{}'", family.name))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let updates = encoded.iter().flat_map(|(family, bytes)| {
            spans
                .iter()
                .map(move |span| self.update_chunk(family, span, bytes))
        });
        try_join_all(updates).await?;

        Ok(range)
    }

    async fn update_chunk(
        &self,
        family: &ColumnFamily,
        span: &ChunkSpan,
        block_bytes: &[u8],
    ) -> Result<(), ArrayError> {
        let key = self.chunk_key(&family.name, span.chunk_index);
        let lock_key = format!("chunk:{}", key);
        let row_bytes = family.row_bytes();
        let source = &block_bytes[span.block_rows.start * row_bytes..span.block_rows.end * row_bytes];

        self.store
            .lock
            .with_lock(&lock_key, Some(self.store.config.chunk_lock_ttl), || async {
                let mut chunk = self.load_chunk(family, &key).await?;
                chunk[span.chunk_rows.start * row_bytes..span.chunk_rows.end * row_bytes]
                    .copy_from_slice(source);

                let encoded = self.store.codec.encode(&chunk)?;
                self.store
                    .retry
                    .retry(
                        "chunk write",
                        || self.store.objects.put(&key, encoded.clone()),
                        StorageError::is_retryable,
                    )
                    .await?;
                debug!(
                    "Updated rows {:?} of chunk {}",
                    span.chunk_rows, key
                );
                Ok::<(), ArrayError>(())
            })
            .await
    }

    /// Fetch and decode a chunk; a missing chunk is a fill-value buffer
    async fn load_chunk(&self, family: &ColumnFamily, key: &str) -> Result<Vec<u8>, ArrayError> {
        let expected_len = self.grid.rows_per_chunk() as usize * family.row_bytes();
        let mut attempt = 0;

        loop {
            let stored = self
                .store
                .retry
                .retry(
                    "chunk read",
                    || self.store.objects.get(key),
                    StorageError::is_retryable,
                )
                .await?;

            let Some(encoded) = stored else {
                return Ok(vec![0u8; expected_len]);
            };

            match self.store.codec.decode(&encoded, expected_len) {
                Ok(raw) => return Ok(raw),
                Err(e) if attempt < self.store.config.decode_retries => {
                    attempt += 1;
                    warn!(
                        "Chunk {} failed to decode (attempt {}/{}): {}",
                        key, attempt, self.store.config.decode_retries, e
                    );
                    tokio::time::sleep(self.store.config.decode_retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write per-family `.zarray` blobs plus `.zgroup` and `.zattrs` from the
    /// current row count. Only call once the row count is final.
    pub async fn write_group_metadata(&self, attributes: Value) -> Result<u64, ArrayError> {
        let row_count = self.row_count().await?;

        for family in &self.schema.families {
            let metadata = ArrayMetadata::new(
                family,
                row_count,
                self.schema.rows_per_chunk,
                self.store.codec.level(),
            );
            self.put_json(&format!("{}/{}/.zarray", self.name, family.name), &metadata)
                .await?;
        }

        self.put_json(&format!("{}/.zgroup", self.name), &GroupMetadata::default())
            .await?;

        let mut attrs = match attributes {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("attributes".to_string(), other);
                map
            }
        };
        attrs.insert("row_count".to_string(), json!(row_count));
        attrs.insert(
            "column_families".to_string(),
            json!(self
                .schema
                .families
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()),
        );
        self.put_json(&format!("{}/.zattrs", self.name), &Value::Object(attrs))
            .await?;

        info!("Wrote metadata for {} ({} rows)", self.name, row_count);
        Ok(row_count)
    }

    /// Read back the `.zarray` descriptor of a family, if written
    pub async fn read_metadata(&self, family: &str) -> Result<Option<ArrayMetadata>, ArrayError> {
        let key = format!("{}/{}/.zarray", self.name, family);
        match self.store.objects.get(&key).await? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Read rows `range` of one family
    pub async fn read_rows(&self, family: &str, range: Range<u64>) -> Result<ColumnData, ArrayError> {
        let family = self
            .schema
            .family(family)
            .ok_or_else(|| ArrayError::Schema(format!("unknown family '{}'", family)))?;

        let row_count = self.row_count().await?;
        if range.end > row_count || range.start > range.end {
            return Err(ArrayError::Schema(format!(
                "rows {:?} out of bounds for {} rows",
                range, row_count
            )));
        }

        let row_bytes = family.row_bytes();
        let mut out = Vec::with_capacity((range.end - range.start) as usize * row_bytes);
        for span in self.grid.spans(range) {
            let key = self.chunk_key(&family.name, span.chunk_index);
            let chunk = self.load_chunk(family, &key).await?;
            out.extend_from_slice(
                &chunk[span.chunk_rows.start * row_bytes..span.chunk_rows.end * row_bytes],
            );
        }
        ColumnData::from_le_bytes(family.dtype, &out)
    }

    async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), ArrayError> {
        let body = serde_json::to_vec_pretty(value).map_err(StorageError::from)?;
        self.store
            .retry
            .retry(
                "metadata write",
                || self.store.objects.put(key, body.clone()),
                StorageError::is_retryable,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dtype;
    use crate::config::LockConfig;
    use crate::storage::backends::{MemoryKeyValueStore, MemoryObjectStore};
    use crate::storage::StorageResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_lock_config() -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(1),
            max_wait: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    fn store_with(objects: Arc<dyn ObjectStore>) -> ArrayStore {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        ArrayStore::new(
            kv.clone(),
            objects,
            DistributedLock::new(kv, test_lock_config()),
            RetryPolicy::immediate(50),
            ArrayConfig {
                decode_retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    fn schema(rows_per_chunk: u64) -> ArraySchema {
        ArraySchema::new(
            rows_per_chunk,
            vec![
                ColumnFamily::new("cell_id", Dtype::I64, 1),
                ColumnFamily::new("expression", Dtype::F32, 2),
            ],
        )
    }

    fn block(first_id: i64, rows: usize) -> RowBlock {
        let ids: Vec<i64> = (0..rows as i64).map(|i| first_id + i).collect();
        let values: Vec<f32> = ids
            .iter()
            .flat_map(|id| [*id as f32, *id as f32 + 0.5])
            .collect();
        RowBlock::new(rows)
            .with_column("cell_id", ColumnData::I64(ids))
            .with_column("expression", ColumnData::F32(values))
    }

    #[tokio::test]
    async fn test_writes_land_in_expected_chunks() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = store_with(objects.clone());
        let array = store.create("results/r1.zarr", schema(3000)).await.unwrap();

        assert_eq!(array.write_rows(&block(0, 3000)).await.unwrap(), 0..3000);
        assert_eq!(array.write_rows(&block(3000, 2000)).await.unwrap(), 3000..5000);

        let keys = objects.list("results/r1.zarr/cell_id/").await.unwrap();
        assert_eq!(
            keys,
            vec!["results/r1.zarr/cell_id/0", "results/r1.zarr/cell_id/1"]
        );

        let first = array.read_rows("cell_id", 0..3000).await.unwrap();
        assert_eq!(first, ColumnData::I64((0..3000).collect()));
        let second = array.read_rows("cell_id", 3000..5000).await.unwrap();
        assert_eq!(second, ColumnData::I64((3000..5000).collect()));

        assert_eq!(array.write_group_metadata(Value::Null).await.unwrap(), 5000);
        let meta = array.read_metadata("expression").await.unwrap().unwrap();
        assert_eq!(meta.shape, [5000, 2]);
        assert_eq!(meta.chunks, [3000, 2]);
        assert!(objects.exists("results/r1.zarr/.zgroup").await.unwrap());
        assert!(objects.exists("results/r1.zarr/.zattrs").await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_chunk_writes_preserve_neighbours() {
        let store = store_with(Arc::new(MemoryObjectStore::new()));
        let array = store.create("a", schema(10)).await.unwrap();

        array.write_rows(&block(100, 4)).await.unwrap();
        array.write_rows(&block(200, 9)).await.unwrap();

        let ids = array.read_rows("cell_id", 0..13).await.unwrap();
        let mut expected: Vec<i64> = (100..104).collect();
        expected.extend(200..209);
        assert_eq!(ids, ColumnData::I64(expected));

        let expression = array.read_rows("expression", 4..5).await.unwrap();
        assert_eq!(expression, ColumnData::F32(vec![200.0, 200.5]));
    }

    #[tokio::test]
    async fn test_create_is_idempotent_for_same_schema() {
        let store = store_with(Arc::new(MemoryObjectStore::new()));
        let first = store.create("a", schema(10)).await.unwrap();
        first.write_rows(&block(0, 3)).await.unwrap();

        let again = store.create("a", schema(10)).await.unwrap();
        assert_eq!(again.row_count().await.unwrap(), 3);

        assert!(matches!(
            store.create("a", schema(20)).await,
            Err(ArrayError::Schema(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_array() {
        let store = store_with(Arc::new(MemoryObjectStore::new()));
        assert!(matches!(
            store.open("nope").await,
            Err(ArrayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_mismatched_block() {
        let store = store_with(Arc::new(MemoryObjectStore::new()));
        let array = store.create("a", schema(10)).await.unwrap();
        let bad = RowBlock::new(2).with_column("cell_id", ColumnData::I64(vec![1, 2]));
        assert!(matches!(
            array.write_rows(&bad).await,
            Err(ArrayError::Schema(_))
        ));
        assert_eq!(array.row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let store = store_with(Arc::new(MemoryObjectStore::new()));
        let array = store.create("a", schema(10)).await.unwrap();
        array.write_rows(&block(0, 3)).await.unwrap();
        assert!(array.read_rows("cell_id", 0..4).await.is_err());
    }

    /// Object store whose first reads of existing chunks return torn bytes
    struct TornReads {
        inner: MemoryObjectStore,
        torn_reads_left: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for TornReads {
        async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            let value = self.inner.get(key).await?;
            if value.is_some()
                && self
                    .torn_reads_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Ok(value.map(|bytes| bytes[..bytes.len() / 2].to_vec()));
            }
            Ok(value)
        }

        async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
            self.inner.put(key, body).await
        }

        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_decode_failures_are_retried() {
        let objects = Arc::new(TornReads {
            inner: MemoryObjectStore::new(),
            torn_reads_left: AtomicUsize::new(0),
        });
        let store = store_with(objects.clone());
        let array = store.create("a", schema(10)).await.unwrap();
        array.write_rows(&block(0, 2)).await.unwrap();

        objects.torn_reads_left.store(2, Ordering::SeqCst);
        array.write_rows(&block(2, 2)).await.unwrap();

        let ids = array.read_rows("cell_id", 0..4).await.unwrap();
        assert_eq!(ids, ColumnData::I64(vec![0, 1, 2, 3]));
    }

    #[tokio::test]
    async fn test_persistent_corruption_surfaces_codec_error() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = store_with(objects.clone());
        let array = store.create("a", schema(10)).await.unwrap();
        objects.put("a/cell_id/0", vec![1, 2, 3]).await.unwrap();

        assert!(matches!(
            array.write_rows(&block(0, 1)).await,
            Err(ArrayError::Codec(_))
        ));
        // The chunk lock was released despite the failure
        array
            .store
            .lock
            .try_acquire("chunk:a/cell_id/0", None)
            .await
            .unwrap()
            .unwrap();
    }
}
