use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jobs::model::{Job, JobId, JobKind, JobResultItem, JobStatus, NewJob, TransitionOutcome};

/// Count of jobs per (kind, status), used by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StatusCount {
    pub kind: String,
    pub status: String,
    pub count: i64,
}

/// Durable job records plus their result items.
///
/// Every mutation is guarded: it applies only when the stored row still
/// matches what the caller last observed, and reports `Stale` (not an error)
/// when it does not. The guards are the only concurrency control between
/// workers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job with `attempt_count = 1`.
    async fn create(&self, job: NewJob) -> anyhow::Result<JobId>;

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    /// Result items ordered by position.
    async fn results(&self, id: JobId) -> anyhow::Result<Vec<JobResultItem>>;

    /// Conditional status update: applied only if the stored status equals
    /// `expected`.
    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome>;

    /// PENDING -> FAILED, recording an error code alongside the message.
    async fn fail(&self, id: JobId, code: &str, message: &str)
        -> anyhow::Result<TransitionOutcome>;

    /// PENDING -> COMPLETED and write `items` at positions 0..n, atomically.
    async fn complete_with_results(
        &self,
        id: JobId,
        items: Vec<Vec<u8>>,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome>;

    /// Copy the result items of `from` onto `to` and complete `to`, atomically.
    async fn copy_results(
        &self,
        from: JobId,
        to: JobId,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome>;

    /// Newest COMPLETED job of `kind` with this fingerprint.
    ///
    /// Ordered by `updated_at` descending; ties go to the highest id.
    async fn find_completed_by_fingerprint(
        &self,
        kind: JobKind,
        fingerprint: &str,
    ) -> anyhow::Result<Option<JobId>>;

    /// Create `child` and point the parent at it, only if the parent is
    /// PENDING, on attempt `parent_attempt`, and its current child is
    /// `expected_child`. Returns the new child id, or None when stale.
    async fn spawn_child(
        &self,
        parent_id: JobId,
        expected_child: Option<JobId>,
        parent_attempt: i32,
        child: NewJob,
    ) -> anyhow::Result<Option<JobId>>;

    /// Restart a job from scratch: status PENDING, attempt + 1, child cleared.
    /// Guarded on the attempt counter so a duplicated failure signal cannot
    /// restart twice.
    async fn restart(
        &self,
        id: JobId,
        expected_attempt: i32,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome>;

    /// Progress note on a PENDING job; no-op otherwise.
    async fn set_message(&self, id: JobId, message: &str) -> anyhow::Result<TransitionOutcome>;

    /// PENDING jobs whose last update is older than `older_than`, oldest first.
    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>>;

    /// Bump `updated_at` on a PENDING job.
    async fn touch(&self, id: JobId) -> anyhow::Result<()>;

    async fn status_counts(&self) -> anyhow::Result<Vec<StatusCount>>;
}
