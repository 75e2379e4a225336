use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jobs::model::{
    Job, JobId, JobKind, JobResultItem, JobStatus, NewJob, TransitionOutcome,
};
use crate::jobs::store::{JobStore, StatusCount};

#[derive(Default)]
struct Inner {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    results: BTreeMap<JobId, Vec<Vec<u8>>>,
}

impl Inner {
    fn insert(&mut self, job: NewJob) -> JobId {
        self.next_id += 1;
        let id = self.next_id;
        let now = Utc::now();
        self.jobs.insert(
            id,
            Job {
                id,
                client_uid: job.client_uid,
                kind: job.kind,
                name: job.name,
                params: job.params,
                extra_data: job.extra_data,
                content_fingerprint: job.content_fingerprint,
                status: JobStatus::Pending,
                status_message: None,
                error_code: None,
                attempt_count: 1,
                child_job_id: None,
                payload: job.payload,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn pending_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Pending)
    }
}

/// In-process [`JobStore`] with the same guard semantics as [`crate::jobs::JobsRepo`].
///
/// Each operation runs under one lock, which gives the same atomicity the
/// Postgres store gets from single statements and transactions.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overwrite `updated_at`, for aging jobs in housekeeping tests.
    pub fn set_updated_at(&self, id: JobId, at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(&id) {
            job.updated_at = at;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All jobs of `kind`, by id.
    pub fn jobs_of_kind(&self, kind: JobKind) -> Vec<Job> {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob) -> anyhow::Result<JobId> {
        Ok(self.lock().insert(job))
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn results(&self, id: JobId) -> anyhow::Result<Vec<JobResultItem>> {
        let inner = self.lock();
        let items = inner
            .results
            .get(&id)
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .map(|(position, content)| JobResultItem {
                        job_id: id,
                        position: position as i32,
                        content: content.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == expected => {
                job.status = new_status;
                job.status_message = Some(message.to_string());
                job.error_code = None;
                job.updated_at = Utc::now();
                Ok(TransitionOutcome::Applied)
            }
            _ => Ok(TransitionOutcome::Stale),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        code: &str,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.lock();
        let Some(job) = inner.pending_mut(id) else {
            return Ok(TransitionOutcome::Stale);
        };
        job.status = JobStatus::Failed;
        job.status_message = Some(message.to_string());
        job.error_code = Some(code.to_string());
        job.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied)
    }

    async fn complete_with_results(
        &self,
        id: JobId,
        items: Vec<Vec<u8>>,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.lock();
        let Some(job) = inner.pending_mut(id) else {
            return Ok(TransitionOutcome::Stale);
        };
        job.status = JobStatus::Completed;
        job.status_message = Some(message.to_string());
        job.error_code = None;
        job.updated_at = Utc::now();
        inner.results.insert(id, items);
        Ok(TransitionOutcome::Applied)
    }

    async fn copy_results(
        &self,
        from: JobId,
        to: JobId,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.lock();
        let items = inner.results.get(&from).cloned().unwrap_or_default();
        let Some(job) = inner.pending_mut(to) else {
            return Ok(TransitionOutcome::Stale);
        };
        job.status = JobStatus::Completed;
        job.status_message = Some(message.to_string());
        job.error_code = None;
        job.updated_at = Utc::now();
        inner.results.insert(to, items);
        Ok(TransitionOutcome::Applied)
    }

    async fn find_completed_by_fingerprint(
        &self,
        kind: JobKind,
        fingerprint: &str,
    ) -> anyhow::Result<Option<JobId>> {
        let inner = self.lock();
        let found = inner
            .jobs
            .values()
            .filter(|j| {
                j.kind == kind
                    && j.status == JobStatus::Completed
                    && j.content_fingerprint == fingerprint
            })
            .max_by_key(|j| (j.updated_at, j.id))
            .map(|j| j.id);
        Ok(found)
    }

    async fn spawn_child(
        &self,
        parent_id: JobId,
        expected_child: Option<JobId>,
        parent_attempt: i32,
        child: NewJob,
    ) -> anyhow::Result<Option<JobId>> {
        let mut inner = self.lock();
        let guard_holds = inner.pending_mut(parent_id).is_some_and(|p| {
            p.attempt_count == parent_attempt && p.child_job_id == expected_child
        });
        if !guard_holds {
            return Ok(None);
        }

        let child_id = inner.insert(child);
        if let Some(parent) = inner.jobs.get_mut(&parent_id) {
            parent.child_job_id = Some(child_id);
            parent.updated_at = Utc::now();
        }
        Ok(Some(child_id))
    }

    async fn restart(
        &self,
        id: JobId,
        expected_attempt: i32,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.attempt_count == expected_attempt
                    && job.status != JobStatus::Completed =>
            {
                job.status = JobStatus::Pending;
                job.attempt_count += 1;
                job.child_job_id = None;
                job.error_code = None;
                job.status_message = Some(message.to_string());
                job.updated_at = Utc::now();
                Ok(TransitionOutcome::Applied)
            }
            _ => Ok(TransitionOutcome::Stale),
        }
    }

    async fn set_message(&self, id: JobId, message: &str) -> anyhow::Result<TransitionOutcome> {
        let mut inner = self.lock();
        let Some(job) = inner.pending_mut(id) else {
            return Ok(TransitionOutcome::Stale);
        };
        job.status_message = Some(message.to_string());
        job.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied)
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.updated_at < older_than)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.updated_at, j.id));
        jobs.truncate(limit.clamp(1, 1000) as usize);
        Ok(jobs)
    }

    async fn touch(&self, id: JobId) -> anyhow::Result<()> {
        if let Some(job) = self.lock().pending_mut(id) {
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn status_counts(&self) -> anyhow::Result<Vec<StatusCount>> {
        let inner = self.lock();
        let mut counts: BTreeMap<(&'static str, &'static str), i64> = BTreeMap::new();
        for job in inner.jobs.values() {
            *counts
                .entry((job.kind.as_str(), job.status.as_str()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((kind, status), count)| StatusCount {
                kind: kind.to_string(),
                status: status.to_string(),
                count,
            })
            .collect())
    }
}
