//! Request ledger: per-request stage counters and terminal state
//!
//! Every counter update goes through `CasCounter`, a read / conditional-update
//! loop. Ledger updates also bump a `revision` field, so the pre-image a
//! caller sees is exactly the state its own update replaced. That is what
//! makes "the increment that completes a stage triggers the next one" hold
//! for exactly one caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::storage::{
    record, types::merge_changes, Condition, KeyValueStore, Record, RecordExt, StorageError,
    Table, TableField,
};

/// Errors from ledger and counter operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Request {0} not found")]
    NotFound(String),

    #[error("Invalid ledger update: {0}")]
    Validation(String),

    #[error("Gave up updating {key} after {attempts} attempts: {last_error}")]
    TransientBackend {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pipeline stages, named as their trigger functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Driver,
    Mapper,
    Worker,
    Reducer,
    Converter,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Driver,
        Stage::Mapper,
        Stage::Worker,
        Stage::Reducer,
        Stage::Converter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Driver => "driver",
            Stage::Mapper => "mapper",
            Stage::Worker => "worker",
            Stage::Reducer => "reducer",
            Stage::Converter => "converter",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Fields of the `requests` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestField {
    Format,
    Params,
    Expected(Stage),
    Completed(Stage),
    ErrorMessage,
    ResultLocation,
    ConversionJobId,
    ConvertedLocation,
    ReusedFrom,
    Aborted,
    Revision,
    CreatedAt,
    UpdatedAt,
}

impl TableField for RequestField {
    const TABLE: Table = Table::Requests;

    fn name(self) -> &'static str {
        match self {
            RequestField::Format => "format",
            RequestField::Params => "params",
            RequestField::Expected(stage) => match stage {
                Stage::Driver => "expected_driver",
                Stage::Mapper => "expected_mapper",
                Stage::Worker => "expected_worker",
                Stage::Reducer => "expected_reducer",
                Stage::Converter => "expected_converter",
            },
            RequestField::Completed(stage) => match stage {
                Stage::Driver => "complete_driver",
                Stage::Mapper => "complete_mapper",
                Stage::Worker => "complete_worker",
                Stage::Reducer => "complete_reducer",
                Stage::Converter => "complete_converter",
            },
            RequestField::ErrorMessage => "error_message",
            RequestField::ResultLocation => "result_location",
            RequestField::ConversionJobId => "conversion_job_id",
            RequestField::ConvertedLocation => "converted_location",
            RequestField::ReusedFrom => "reused_from",
            RequestField::Aborted => "aborted",
            RequestField::Revision => "revision",
            RequestField::CreatedAt => "created_at_ms",
            RequestField::UpdatedAt => "updated_at_ms",
        }
    }
}

/// Progress of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// `None` until the stage's expected count has been recorded
    pub expected: Option<u64>,
    pub completed: u64,
}

impl StageProgress {
    pub fn is_complete(&self) -> bool {
        self.expected.is_some_and(|expected| self.completed >= expected)
    }
}

/// Typed view of a ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub request_id: String,
    pub format: String,
    pub params: Value,
    pub stages: BTreeMap<Stage, StageProgress>,
    pub error_message: Option<String>,
    pub result_location: Option<String>,
    pub conversion_job_id: Option<String>,
    pub converted_location: Option<String>,
    pub reused_from: Option<String>,
    pub aborted: bool,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestEntry {
    pub fn from_record(request_id: &str, stored: &Record) -> Self {
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| {
                let expected = stored
                    .field(RequestField::Expected(stage))
                    .and_then(Value::as_u64);
                let completed = stored.u64_field(RequestField::Completed(stage));
                (stage, StageProgress { expected, completed })
            })
            .collect();
        let timestamp = |field| {
            stored
                .i64_field(field)
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or_default()
        };
        let text = |field| stored.str_field(field).map(str::to_string);

        Self {
            request_id: request_id.to_string(),
            format: text(RequestField::Format).unwrap_or_default(),
            params: decode_params(stored.field(RequestField::Params)),
            stages,
            error_message: text(RequestField::ErrorMessage),
            result_location: text(RequestField::ResultLocation),
            conversion_job_id: text(RequestField::ConversionJobId),
            converted_location: text(RequestField::ConvertedLocation),
            reused_from: text(RequestField::ReusedFrom),
            aborted: stored.bool_field(RequestField::Aborted),
            revision: stored.u64_field(RequestField::Revision),
            created_at: timestamp(RequestField::CreatedAt),
            updated_at: timestamp(RequestField::UpdatedAt),
        }
    }

    pub fn progress(&self, stage: Stage) -> StageProgress {
        self.stages.get(&stage).copied().unwrap_or(StageProgress {
            expected: None,
            completed: 0,
        })
    }

    pub fn expected(&self, stage: Stage) -> u64 {
        self.progress(stage).expected.unwrap_or(0)
    }

    pub fn completed(&self, stage: Stage) -> u64 {
        self.progress(stage).completed
    }

    pub fn is_stage_complete(&self, stage: Stage) -> bool {
        self.progress(stage).is_complete()
    }

    /// All mappers reported and every worker they announced has finished
    pub fn map_work_complete(&self) -> bool {
        self.is_stage_complete(Stage::Mapper) && self.is_stage_complete(Stage::Worker)
    }

    /// Failed or aborted
    pub fn is_terminal(&self) -> bool {
        self.aborted || self.error_message.is_some()
    }
}

/// Result of an atomic multi-field increment
#[derive(Debug, Clone)]
pub struct CounterUpdate {
    /// State replaced by this update
    pub before: RequestEntry,
    /// State written by this update
    pub after: RequestEntry,
}

impl CounterUpdate {
    /// True for exactly the update that moved map work from incomplete to complete
    pub fn completed_map_work(&self) -> bool {
        !self.before.map_work_complete() && self.after.map_work_complete()
    }

    /// True for exactly the update that completed `stage`
    pub fn completed_stage(&self, stage: Stage) -> bool {
        !self.before.is_stage_complete(stage) && self.after.is_stage_complete(stage)
    }
}

/// Compare-and-swap increment over numeric fields of one record
#[derive(Clone)]
pub struct CasCounter {
    kv: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl CasCounter {
    pub fn new(kv: Arc<dyn KeyValueStore>, retry: RetryPolicy) -> Self {
        Self { kv, retry }
    }

    /// Add every delta in one conditional update, retrying on conflict.
    ///
    /// `extra` is merged alongside the new counter values. `validate` sees the
    /// prospective record and may reject it before anything is written.
    /// Returns the record before and after the update.
    pub async fn increment<F, V>(
        &self,
        key: &str,
        deltas: &[(F, u64)],
        extra: &Record,
        validate: V,
    ) -> Result<(Record, Record), LedgerError>
    where
        F: TableField,
        V: Fn(&Record) -> Result<(), String>,
    {
        let mut attempt = 0;

        loop {
            let outcome = match self.kv.get(F::TABLE, key).await {
                Ok(Some(current)) => {
                    let mut changes = extra.clone();
                    let mut conditions = Vec::with_capacity(deltas.len());
                    for (field, delta) in deltas {
                        let stored = current.get(field.name()).cloned().unwrap_or(Value::Null);
                        let old = current.u64_field(*field);
                        let new = old.checked_add(*delta).ok_or_else(|| {
                            LedgerError::Validation(format!(
                                "{}.{} would overflow",
                                key,
                                field.name()
                            ))
                        })?;
                        conditions.push(Condition::FieldEquals {
                            field: field.name().to_string(),
                            value: stored,
                        });
                        changes.insert(field.name().to_string(), json!(new));
                    }

                    let mut prospective = current.clone();
                    merge_changes(&mut prospective, &changes);
                    validate(&prospective).map_err(LedgerError::Validation)?;

                    self.kv
                        .update_if(F::TABLE, key, changes, Condition::all(conditions), None)
                        .await
                        .map(|stored| (current, stored))
                }
                Ok(None) => Err(StorageError::not_found(key)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(update) => return Ok(update),
                Err(e) if e.is_not_found() => {
                    return Err(LedgerError::NotFound(key.to_string()));
                }
                Err(e) if e.is_conflict() || e.is_retryable() => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        warn!("CAS on {}/{} exhausted retries: {}", F::TABLE, key, e);
                        return Err(LedgerError::TransientBackend {
                            key: key.to_string(),
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    debug!("CAS on {}/{} retrying ({}): {}", F::TABLE, key, attempt, e);
                    self.retry.backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Durable record of every request's expected and completed work
#[derive(Clone)]
pub struct RequestLedger {
    kv: Arc<dyn KeyValueStore>,
    counter: CasCounter,
    retry: RetryPolicy,
}

impl RequestLedger {
    pub fn new(kv: Arc<dyn KeyValueStore>, retry: RetryPolicy) -> Self {
        Self {
            counter: CasCounter::new(kv.clone(), retry.clone()),
            kv,
            retry,
        }
    }

    /// Create the entry for `request_id` unless one already exists.
    ///
    /// Returns `false` when an entry was already present; its counters are
    /// left untouched.
    pub async fn create_entry(
        &self,
        request_id: &str,
        format: &str,
        expected: &[(Stage, u64)],
        params: Value,
    ) -> Result<bool, LedgerError> {
        if request_id.is_empty() {
            return Err(LedgerError::Validation("empty request id".to_string()));
        }

        let now = now_millis();
        let mut entry = record([
            (RequestField::Format, json!(format)),
            (RequestField::Params, json!(params.to_string())),
            (RequestField::Revision, json!(0)),
            (RequestField::CreatedAt, json!(now)),
            (RequestField::UpdatedAt, json!(now)),
        ]);
        for (stage, count) in expected {
            entry.insert(
                RequestField::Expected(*stage).name().to_string(),
                json!(count),
            );
            entry.insert(
                RequestField::Completed(*stage).name().to_string(),
                json!(0),
            );
        }

        let result = self
            .retry
            .retry(
                "create ledger entry",
                || {
                    self.kv
                        .put_if_absent(Table::Requests, request_id, entry.clone(), None)
                },
                StorageError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => {
                info!("Created ledger entry for request {}", request_id);
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!("Ledger entry for {} already exists", request_id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_entry(&self, request_id: &str) -> Result<Option<RequestEntry>, LedgerError> {
        let stored = self
            .retry
            .retry(
                "read ledger entry",
                || self.kv.get(Table::Requests, request_id),
                StorageError::is_retryable,
            )
            .await?;
        Ok(stored.map(|r| RequestEntry::from_record(request_id, &r)))
    }

    /// Like `get_entry`, but a missing entry is an error
    pub async fn entry(&self, request_id: &str) -> Result<RequestEntry, LedgerError> {
        self.get_entry(request_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(request_id.to_string()))
    }

    /// Add `amount` to one counter, returning `(old, new)`
    pub async fn increment(
        &self,
        request_id: &str,
        field: RequestField,
        amount: u64,
    ) -> Result<(u64, u64), LedgerError> {
        let update = self.increment_fields(request_id, &[(field, amount)]).await?;
        let read = |entry: &RequestEntry| match field {
            RequestField::Expected(stage) => entry.expected(stage),
            RequestField::Completed(stage) => entry.completed(stage),
            RequestField::Revision => entry.revision,
            _ => 0,
        };
        Ok((read(&update.before), read(&update.after)))
    }

    /// Apply several counter deltas in a single atomic update
    pub async fn increment_fields(
        &self,
        request_id: &str,
        deltas: &[(RequestField, u64)],
    ) -> Result<CounterUpdate, LedgerError> {
        if let Some((field, _)) = deltas.iter().find(|(field, _)| {
            !matches!(field, RequestField::Expected(_) | RequestField::Completed(_))
        }) {
            return Err(LedgerError::Validation(format!(
                "{} is not a counter",
                field.name()
            )));
        }

        let mut all = deltas.to_vec();
        all.push((RequestField::Revision, 1));
        let extra = record([(RequestField::UpdatedAt, json!(now_millis()))]);

        let (before, after) = self
            .counter
            .increment(request_id, &all, &extra, |prospective| {
                for stage in Stage::ALL {
                    let Some(expected) = prospective
                        .field(RequestField::Expected(stage))
                        .and_then(Value::as_u64)
                    else {
                        continue;
                    };
                    let completed = prospective.u64_field(RequestField::Completed(stage));
                    if completed > expected {
                        return Err(format!(
                            "{} completed count {} would exceed expected {}",
                            stage, completed, expected
                        ));
                    }
                }
                Ok(())
            })
            .await
            .map_err(|e| match e {
                LedgerError::NotFound(_) => LedgerError::NotFound(request_id.to_string()),
                other => other,
            })?;

        Ok(CounterUpdate {
            before: RequestEntry::from_record(request_id, &before),
            after: RequestEntry::from_record(request_id, &after),
        })
    }

    pub async fn is_stage_complete(
        &self,
        request_id: &str,
        stage: Stage,
    ) -> Result<bool, LedgerError> {
        Ok(self.entry(request_id).await?.is_stage_complete(stage))
    }

    /// Record a failure. Last write wins; in-flight work is not interrupted.
    pub async fn log_error(&self, request_id: &str, message: &str) -> Result<(), LedgerError> {
        warn!("Request {} failed: {}", request_id, message);
        self.update(
            request_id,
            record([(RequestField::ErrorMessage, json!(message))]),
            Condition::Exists,
        )
        .await
        .map(|_| ())
    }

    pub async fn set_result_location(
        &self,
        request_id: &str,
        location: &str,
    ) -> Result<(), LedgerError> {
        self.update(
            request_id,
            record([(RequestField::ResultLocation, json!(location))]),
            Condition::Exists,
        )
        .await
        .map(|_| ())
    }

    /// Claim the conversion slot for `job_id`. Returns `false` if another job
    /// id was recorded first.
    pub async fn set_conversion_job(
        &self,
        request_id: &str,
        job_id: &str,
    ) -> Result<bool, LedgerError> {
        let result = self
            .update(
                request_id,
                record([(RequestField::ConversionJobId, json!(job_id))]),
                Condition::all(vec![
                    Condition::Exists,
                    Condition::field_equals(RequestField::ConversionJobId, Value::Null),
                ]),
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(LedgerError::Storage(e)) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_converted_location(
        &self,
        request_id: &str,
        location: &str,
    ) -> Result<(), LedgerError> {
        self.update(
            request_id,
            record([(RequestField::ConvertedLocation, json!(location))]),
            Condition::Exists,
        )
        .await
        .map(|_| ())
    }

    /// Point a duplicate request at the request whose result it reuses
    pub async fn set_reused_from(
        &self,
        request_id: &str,
        source_request_id: &str,
    ) -> Result<(), LedgerError> {
        self.update(
            request_id,
            record([(RequestField::ReusedFrom, json!(source_request_id))]),
            Condition::Exists,
        )
        .await
        .map(|_| ())
    }

    /// Mark a request aborted, clearing its error and output
    pub async fn abort(&self, request_id: &str) -> Result<(), LedgerError> {
        info!("Aborting request {}", request_id);
        self.update(
            request_id,
            record([
                (RequestField::Aborted, json!(true)),
                (RequestField::ErrorMessage, Value::Null),
                (RequestField::ResultLocation, Value::Null),
                (RequestField::ConvertedLocation, Value::Null),
            ]),
            Condition::Exists,
        )
        .await
        .map(|_| ())
    }

    /// Every tracked request id
    pub async fn list_request_ids(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self.kv.scan_keys(Table::Requests).await?)
    }

    async fn update(
        &self,
        request_id: &str,
        mut changes: Record,
        condition: Condition,
    ) -> Result<RequestEntry, LedgerError> {
        changes.insert(
            RequestField::UpdatedAt.name().to_string(),
            json!(now_millis()),
        );

        let result = self
            .retry
            .retry(
                "update ledger entry",
                || {
                    self.kv.update_if(
                        Table::Requests,
                        request_id,
                        changes.clone(),
                        condition.clone(),
                        None,
                    )
                },
                StorageError::is_retryable,
            )
            .await;

        match result {
            Ok(stored) => Ok(RequestEntry::from_record(request_id, &stored)),
            Err(e) if e.is_not_found() => Err(LedgerError::NotFound(request_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Params are stored as encoded JSON text. The Redis update script
/// re-encodes whole records with cjson, which turns `[]` into `{}`.
fn decode_params(stored: Option<&Value>) -> Value {
    match stored {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
