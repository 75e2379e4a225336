//! Top-level pipelines and the pure step function that chains their stages.

use serde_json::Value;

use crate::jobs::correlation::Correlation;
use crate::jobs::model::{JobId, JobKind, JobStatus, NewJob};
use crate::jobs::store::JobStore;
use crate::queue::{push_id, request_queue, Broker};

pub mod orchestrator;

pub use orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// duplicate -> compose -> capture
    Render,
    /// capture
    Snapshot,
}

impl Pipeline {
    pub const ALL: [Pipeline; 2] = [Pipeline::Render, Pipeline::Snapshot];

    pub fn for_kind(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::Render => Some(Pipeline::Render),
            JobKind::Snapshot => Some(Pipeline::Snapshot),
            _ => None,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Pipeline::Render => JobKind::Render,
            Pipeline::Snapshot => JobKind::Snapshot,
        }
    }

    pub fn stages(&self) -> &'static [JobKind] {
        match self {
            Pipeline::Render => &[JobKind::Duplicate, JobKind::Compose, JobKind::Capture],
            Pipeline::Snapshot => &[JobKind::Capture],
        }
    }

    pub fn first_stage(&self) -> JobKind {
        self.stages()[0]
    }
}

/// What happens after a stage job of a pipeline reaches `outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Spawn the next stage.
    Enqueue(JobKind),
    /// Last stage done; write the final results and notify the requester.
    Finalize,
    /// Stage failed; the retry supervisor decides.
    Supervise,
    /// The stage is not part of this pipeline, or the outcome is not terminal.
    Ignore,
}

pub fn next_step(pipeline: Pipeline, stage: JobKind, outcome: JobStatus) -> Step {
    let stages = pipeline.stages();
    let Some(pos) = stages.iter().position(|s| *s == stage) else {
        return Step::Ignore;
    };
    match outcome {
        JobStatus::Pending => Step::Ignore,
        JobStatus::Failed => Step::Supervise,
        JobStatus::Completed => match stages.get(pos + 1) {
            Some(next) => Step::Enqueue(*next),
            None => Step::Finalize,
        },
    }
}

/// A top-level request as handed over by the web layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub pipeline: Pipeline,
    pub client_uid: String,
    pub name: String,
    pub params: Value,
    pub reference: Option<Value>,
    pub payload: Vec<u8>,
}

/// Create the top-level job and push it onto its request queue.
pub async fn submit(
    store: &dyn JobStore,
    broker: &dyn Broker,
    submission: Submission,
    max_payload_bytes: usize,
) -> anyhow::Result<JobId> {
    if submission.payload.len() > max_payload_bytes {
        anyhow::bail!(
            "payload of {} bytes exceeds the limit of {} bytes",
            submission.payload.len(),
            max_payload_bytes
        );
    }
    if submission.client_uid.trim().is_empty() {
        anyhow::bail!("client_uid must not be empty");
    }

    let kind = submission.pipeline.kind();
    let job = NewJob::new(
        kind,
        submission.client_uid,
        submission.name,
        submission.params,
        Correlation::request(submission.reference).encode(),
        submission.payload,
    );
    let id = store.create(job).await?;
    push_id(broker, &request_queue(kind), id).await?;
    tracing::info!(job_id = id, kind = %kind, "submitted");
    Ok(id)
}
