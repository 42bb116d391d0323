//! Request status derived from the ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{OrchestratorError, StageContext};
use crate::cache::CacheStatus;
use crate::config::OrchestratorConfig;
use crate::ledger::{RequestEntry, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Initialized,
    Running,
    AwaitingConversion,
    Complete,
    Aborted,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Complete | RequestState::Aborted | RequestState::Failed
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Initialized => "INITIALIZED",
            RequestState::Running => "RUNNING",
            RequestState::AwaitingConversion => "AWAITING_CONVERSION",
            RequestState::Complete => "COMPLETE",
            RequestState::Aborted => "ABORTED",
            RequestState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub request_id: String,
    pub state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
}

impl RequestStatus {
    fn new(request_id: &str, state: RequestState) -> Self {
        Self {
            request_id: request_id.to_string(),
            state,
            error: None,
            result_location: None,
        }
    }
}

/// Status of `request_id` for the API layer
pub async fn get_status(
    ctx: &StageContext,
    request_id: &str,
) -> Result<RequestStatus, OrchestratorError> {
    let Some(entry) = ctx.ledger.get_entry(request_id).await? else {
        // Submitted but the Driver has not created the entry yet
        return match ctx.cache.status(request_id).await? {
            CacheStatus::Missing => Err(OrchestratorError::NotFound(request_id.to_string())),
            _ => Ok(RequestStatus::new(request_id, RequestState::Initialized)),
        };
    };

    if let (Some(source_id), false) = (entry.reused_from.as_deref(), entry.aborted) {
        if let Some(source) = ctx.ledger.get_entry(source_id).await? {
            let mut status = derive_status(&source, &ctx.config, Utc::now());
            status.request_id = request_id.to_string();
            return Ok(status);
        }
    }

    Ok(derive_status(&entry, &ctx.config, Utc::now()))
}

/// Map a ledger entry onto a status as of `now`
pub fn derive_status(
    entry: &RequestEntry,
    config: &OrchestratorConfig,
    now: DateTime<Utc>,
) -> RequestStatus {
    let mut status = RequestStatus::new(&entry.request_id, RequestState::Initialized);

    if entry.aborted {
        status.state = RequestState::Aborted;
        return status;
    }
    if let Some(error) = &entry.error_message {
        status.state = RequestState::Failed;
        status.error = Some(error.clone());
        return status;
    }

    if entry.is_stage_complete(Stage::Reducer) {
        if entry.format == config.native_format {
            status.state = RequestState::Complete;
            status.result_location = entry.result_location.clone();
            return status;
        }
        if entry.is_stage_complete(Stage::Converter) && entry.converted_location.is_some() {
            status.state = RequestState::Complete;
            status.result_location = entry.converted_location.clone();
            return status;
        }
        status.state = RequestState::AwaitingConversion;
    } else if entry.is_stage_complete(Stage::Driver) {
        status.state = RequestState::Running;
    }

    let age = now
        .signed_duration_since(entry.created_at)
        .to_std()
        .unwrap_or_default();
    if age > config.request_timeout {
        status.state = RequestState::Failed;
        status.error = Some(format!(
            "Request timed out after {}",
            humantime_serde::re::humantime::format_duration(config.request_timeout)
        ));
    }
    status
}
