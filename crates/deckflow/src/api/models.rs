// crates/deckflow/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::jobs::error_codes::suggested_action;
use crate::jobs::model::{Job, JobResultItem};
use crate::jobs::store::StatusCount;

/// A job as shown by the admin API. Payload bytes are summarized by size.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: i64,
    pub client_uid: String,
    pub kind: String,
    pub name: String,
    pub params: Value,
    pub extra_data: String,
    pub status: String,
    pub status_message: Option<String>,
    pub error_code: Option<String>,
    pub suggested_action: Option<&'static str>,
    pub attempt_count: i32,
    pub child_job_id: Option<i64>,
    pub payload_bytes: usize,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            client_uid: job.client_uid,
            kind: job.kind.as_str().to_string(),
            name: job.name,
            params: job.params,
            extra_data: job.extra_data,
            status: job.status.as_str().to_string(),
            status_message: job.status_message,
            suggested_action: job.error_code.as_deref().map(suggested_action),
            error_code: job.error_code,
            attempt_count: job.attempt_count,
            child_job_id: job.child_job_id,
            payload_bytes: job.payload.len(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultItemView {
    pub position: i32,
    pub size_bytes: usize,
}

impl From<&JobResultItem> for ResultItemView {
    fn from(item: &JobResultItem) -> Self {
        Self {
            position: item.position,
            size_bytes: item.content.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsView {
    pub status_counts: Vec<StatusCount>,
    pub total: i64,
}
