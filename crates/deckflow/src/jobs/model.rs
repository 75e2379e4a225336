use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::fingerprint::fingerprint;

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Top-level: build a deck from a template and slide texts.
    Render,
    /// Top-level: capture one image per sheet/slide of a document.
    Snapshot,
    Duplicate,
    Compose,
    Capture,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Render,
        JobKind::Snapshot,
        JobKind::Duplicate,
        JobKind::Compose,
        JobKind::Capture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Render => "render",
            JobKind::Snapshot => "snapshot",
            JobKind::Duplicate => "duplicate",
            JobKind::Compose => "compose",
            JobKind::Capture => "capture",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Stage kinds are served by a stage worker; the others by the pipeline.
    pub fn is_stage(&self) -> bool {
        matches!(self, JobKind::Duplicate | JobKind::Compose | JobKind::Capture)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub client_uid: String,
    pub kind: JobKind,
    pub name: String,
    pub params: Value,
    /// String-encoded correlation payload, see [`crate::jobs::correlation`].
    pub extra_data: String,
    pub content_fingerprint: String,
    pub status: JobStatus,
    pub status_message: Option<String>,
    pub error_code: Option<String>,
    pub attempt_count: i32,
    pub child_job_id: Option<JobId>,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw row as stored; kind/status are text columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub client_uid: String,
    pub kind: String,
    pub name: String,
    pub params: Value,
    pub extra_data: String,
    pub content_fingerprint: String,
    pub status: String,
    pub status_message: Option<String>,
    pub error_code: Option<String>,
    pub attempt_count: i32,
    pub child_job_id: Option<i64>,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| anyhow::anyhow!("job {} has unknown kind {:?}", row.id, row.kind))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("job {} has unknown status {:?}", row.id, row.status))?;

        Ok(Job {
            id: row.id,
            client_uid: row.client_uid,
            kind,
            name: row.name,
            params: row.params,
            extra_data: row.extra_data,
            content_fingerprint: row.content_fingerprint,
            status,
            status_message: row.status_message,
            error_code: row.error_code,
            attempt_count: row.attempt_count,
            child_job_id: row.child_job_id,
            payload: row.payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub client_uid: String,
    pub kind: JobKind,
    pub name: String,
    pub params: Value,
    pub extra_data: String,
    pub content_fingerprint: String,
    pub payload: Vec<u8>,
}

impl NewJob {
    /// Build a job record; the fingerprint is derived from `params` and `payload`.
    pub fn new(
        kind: JobKind,
        client_uid: impl Into<String>,
        name: impl Into<String>,
        params: Value,
        extra_data: String,
        payload: Vec<u8>,
    ) -> Self {
        let content_fingerprint = fingerprint(&params, &payload);
        Self {
            client_uid: client_uid.into(),
            kind,
            name: name.into(),
            params,
            extra_data,
            content_fingerprint,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct JobResultItem {
    pub job_id: JobId,
    pub position: i32,
    pub content: Vec<u8>,
}

/// Result of a guarded update. `Stale` means the guard did not match and
/// nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Stale,
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}
