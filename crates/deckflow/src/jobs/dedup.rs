//! Result reuse for stage jobs whose input was already processed.

use tracing::info;

use crate::jobs::model::{Job, JobId, TransitionOutcome};
use crate::jobs::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    /// No prior COMPLETED job with the same input; run the processor.
    Miss,
    /// Results of `source` were copied and the job is now COMPLETED.
    Copied { source: JobId },
    /// A prior job matched, but the job left PENDING before the copy landed.
    Stale { source: JobId },
}

impl Reuse {
    /// True when the job no longer needs processing.
    pub fn handled(&self) -> bool {
        !matches!(self, Reuse::Miss)
    }
}

pub fn provenance_message(source: JobId) -> String {
    format!("OK. Copied from {source}")
}

/// Look up a prior COMPLETED job of the same kind and fingerprint and copy its
/// results onto `job`.
pub async fn try_reuse(store: &dyn JobStore, job: &Job) -> anyhow::Result<Reuse> {
    let Some(source) = store
        .find_completed_by_fingerprint(job.kind, &job.content_fingerprint)
        .await?
    else {
        return Ok(Reuse::Miss);
    };

    if source == job.id {
        // only possible if the job is already COMPLETED itself
        return Ok(Reuse::Stale { source });
    }

    match store
        .copy_results(source, job.id, &provenance_message(source))
        .await?
    {
        TransitionOutcome::Applied => {
            info!(job_id = job.id, source, kind = %job.kind, "reused results");
            Ok(Reuse::Copied { source })
        }
        TransitionOutcome::Stale => Ok(Reuse::Stale { source }),
    }
}
