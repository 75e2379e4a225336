//! Typed correlation payload stored in `jobs.extra_data`.
//!
//! Top-level jobs carry an opaque requester reference. Stage jobs carry the
//! parent they belong to and the parent attempt they were spawned for; the
//! tag must match the stage job's kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::model::{Job, JobId, JobKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub parent_job_id: JobId,
    pub parent_attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Correlation {
    Request {
        #[serde(default)]
        reference: Option<Value>,
    },
    Duplicate(ParentLink),
    Compose(ParentLink),
    Capture(ParentLink),
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("job {job_id}: malformed correlation payload: {source}")]
    Malformed {
        job_id: JobId,
        #[source]
        source: serde_json::Error,
    },
    #[error("job {job_id}: correlation tagged {tag} does not match job kind {kind}")]
    KindMismatch {
        job_id: JobId,
        tag: &'static str,
        kind: JobKind,
    },
    #[error("job {job_id}: expected a parent link, found a request correlation")]
    MissingParent { job_id: JobId },
}

impl Correlation {
    pub fn request(reference: Option<Value>) -> Self {
        Correlation::Request { reference }
    }

    /// Link for a stage job of `kind`. Returns None for top-level kinds.
    pub fn for_stage(kind: JobKind, link: ParentLink) -> Option<Self> {
        match kind {
            JobKind::Duplicate => Some(Correlation::Duplicate(link)),
            JobKind::Compose => Some(Correlation::Compose(link)),
            JobKind::Capture => Some(Correlation::Capture(link)),
            JobKind::Render | JobKind::Snapshot => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Correlation::Request { .. } => "request",
            Correlation::Duplicate(_) => "duplicate",
            Correlation::Compose(_) => "compose",
            Correlation::Capture(_) => "capture",
        }
    }

    pub fn parent(&self) -> Option<ParentLink> {
        match self {
            Correlation::Request { .. } => None,
            Correlation::Duplicate(l) | Correlation::Compose(l) | Correlation::Capture(l) => {
                Some(*l)
            }
        }
    }

    pub fn encode(&self) -> String {
        // serializing a plain enum of ints/values cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse and validate the payload of `job` against its kind.
    pub fn decode(job: &Job) -> Result<Self, CorrelationError> {
        let corr: Correlation =
            serde_json::from_str(&job.extra_data).map_err(|source| CorrelationError::Malformed {
                job_id: job.id,
                source,
            })?;

        let matches = match (&corr, job.kind) {
            (Correlation::Request { .. }, k) => !k.is_stage(),
            (Correlation::Duplicate(_), JobKind::Duplicate) => true,
            (Correlation::Compose(_), JobKind::Compose) => true,
            (Correlation::Capture(_), JobKind::Capture) => true,
            _ => false,
        };
        if !matches {
            return Err(CorrelationError::KindMismatch {
                job_id: job.id,
                tag: corr.tag(),
                kind: job.kind,
            });
        }

        Ok(corr)
    }

    /// Decode a stage job's payload and return its parent link.
    pub fn decode_parent(job: &Job) -> Result<ParentLink, CorrelationError> {
        Self::decode(job)?
            .parent()
            .ok_or(CorrelationError::MissingParent { job_id: job.id })
    }
}
