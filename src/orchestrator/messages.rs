//! Trigger payloads exchanged between stages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPayload {
    pub request_id: String,
    pub input_refs: Vec<String>,
    pub format: String,
    #[serde(default)]
    pub params: Value,
}

/// One input bundle assigned to a Mapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperPayload {
    pub request_id: String,
    pub work_unit: WorkUnit,
}

/// A contiguous slice of one bundle's rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub source_ref: String,
    pub start_row: u64,
    pub num_rows: u64,
}

impl ChunkSpec {
    /// Split `total_rows` of a bundle into slices of at most `chunk_rows`
    pub fn split(source_ref: &str, total_rows: u64, chunk_rows: u64) -> Vec<ChunkSpec> {
        let chunk_rows = chunk_rows.max(1);
        (0..total_rows.div_ceil(chunk_rows))
            .map(|i| {
                let start_row = i * chunk_rows;
                ChunkSpec {
                    source_ref: source_ref.to_string(),
                    start_row,
                    num_rows: chunk_rows.min(total_rows - start_row),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub request_id: String,
    pub chunk_spec: ChunkSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerPayload {
    pub request_id: String,
}

/// Emitted to the external format converter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterPayload {
    pub request_id: String,
    pub job_id: String,
    pub source_location: String,
    pub format: String,
}

/// Queue message wrapping a trigger for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEnvelope {
    pub stage: Stage,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_covers_all_rows() {
        let specs = ChunkSpec::split("b", 7001, 3000);
        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs.iter().map(|s| (s.start_row, s.num_rows)).collect::<Vec<_>>(),
            vec![(0, 3000), (3000, 3000), (6000, 1001)]
        );
        assert!(ChunkSpec::split("b", 0, 3000).is_empty());
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = WorkerPayload {
            request_id: "r1".to_string(),
            chunk_spec: ChunkSpec {
                source_ref: "bundles/a.csv".to_string(),
                start_row: 0,
                num_rows: 10,
            },
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "request_id": "r1",
                "chunk_spec": {"source_ref": "bundles/a.csv", "start_row": 0, "num_rows": 10}
            })
        );

        let driver: DriverPayload = serde_json::from_value(json!({
            "request_id": "r1",
            "input_refs": ["a"],
            "format": "zarr"
        }))
        .unwrap();
        assert_eq!(driver.params, Value::Null);

        let envelope: TriggerEnvelope =
            serde_json::from_str(r#"{"stage":"reducer","payload":{"request_id":"r1"}}"#).unwrap();
        assert_eq!(envelope.stage, Stage::Reducer);
    }
}
