// crates/deckflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::jobs::model::{
    Job, JobId, JobKind, JobResultItem, JobRow, JobStatus, NewJob, TransitionOutcome,
};
use crate::jobs::store::{JobStore, StatusCount};

/// Postgres-backed [`JobStore`].
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn outcome(rows_affected: u64) -> TransitionOutcome {
    if rows_affected > 0 {
        TransitionOutcome::Applied
    } else {
        TransitionOutcome::Stale
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    // ----------------------------
    // Create / reads
    // ----------------------------

    async fn create(&self, job: NewJob) -> anyhow::Result<JobId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                client_uid, kind, name, params, extra_data,
                content_fingerprint, status, attempt_count, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8)
            RETURNING id
            "#,
        )
        .bind(&job.client_uid)
        .bind(job.kind.as_str())
        .bind(&job.name)
        .bind(&job.params)
        .bind(&job.extra_data)
        .bind(&job.content_fingerprint)
        .bind(JobStatus::Pending.as_str())
        .bind(&job.payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn results(&self, id: JobId) -> anyhow::Result<Vec<JobResultItem>> {
        let items = sqlx::query_as::<_, JobResultItem>(
            r#"
            SELECT job_id, position, content
            FROM job_results
            WHERE job_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                status_message = $4,
                error_code = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    async fn fail(
        &self,
        id: JobId,
        code: &str,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED',
                status_message = $2,
                error_code = $3,
                updated_at = now()
            WHERE id = $1
              AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(code)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// Status flip first: if it loses the race nothing else is written.
    async fn complete_with_results(
        &self,
        id: JobId,
        items: Vec<Vec<u8>>,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED',
                status_message = $2,
                error_code = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Stale);
        }

        for (position, content) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO job_results (job_id, position, content)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id)
            .bind(position as i32)
            .bind(content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }

    async fn copy_results(
        &self,
        from: JobId,
        to: JobId,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED',
                status_message = $2,
                error_code = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'PENDING'
            "#,
        )
        .bind(to)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Stale);
        }

        sqlx::query(
            r#"
            INSERT INTO job_results (job_id, position, content)
            SELECT $2, position, content
            FROM job_results
            WHERE job_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }

    // ----------------------------
    // Dedup
    // ----------------------------

    async fn find_completed_by_fingerprint(
        &self,
        kind: JobKind,
        fingerprint: &str,
    ) -> anyhow::Result<Option<JobId>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE kind = $1
              AND content_fingerprint = $2
              AND status = 'COMPLETED'
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Parent / child bookkeeping
    // ----------------------------

    async fn spawn_child(
        &self,
        parent_id: JobId,
        expected_child: Option<JobId>,
        parent_attempt: i32,
        child: NewJob,
    ) -> anyhow::Result<Option<JobId>> {
        let mut tx = self.pool.begin().await?;

        let child_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                client_uid, kind, name, params, extra_data,
                content_fingerprint, status, attempt_count, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 1, $7)
            RETURNING id
            "#,
        )
        .bind(&child.client_uid)
        .bind(child.kind.as_str())
        .bind(&child.name)
        .bind(&child.params)
        .bind(&child.extra_data)
        .bind(&child.content_fingerprint)
        .bind(&child.payload)
        .fetch_one(&mut *tx)
        .await?;

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET child_job_id = $4,
                updated_at = now()
            WHERE id = $1
              AND status = 'PENDING'
              AND attempt_count = $2
              AND child_job_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(parent_id)
        .bind(parent_attempt)
        .bind(expected_child)
        .bind(child_id)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            // someone else advanced the parent; drop the child we just made
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(child_id))
    }

    async fn restart(
        &self,
        id: JobId,
        expected_attempt: i32,
        message: &str,
    ) -> anyhow::Result<TransitionOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PENDING',
                attempt_count = attempt_count + 1,
                child_job_id = NULL,
                error_code = NULL,
                status_message = $3,
                updated_at = now()
            WHERE id = $1
              AND attempt_count = $2
              AND status <> 'COMPLETED'
            "#,
        )
        .bind(id)
        .bind(expected_attempt)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    async fn set_message(&self, id: JobId, message: &str) -> anyhow::Result<TransitionOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status_message = $2,
                updated_at = now()
            WHERE id = $1
              AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    // ----------------------------
    // Housekeeping / admin
    // ----------------------------

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE status = 'PENDING'
              AND updated_at < $1
            ORDER BY updated_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn touch(&self, id: JobId) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET updated_at = now()
            WHERE id = $1
              AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn status_counts(&self) -> anyhow::Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT kind, status, COUNT(*)
            FROM jobs
            GROUP BY kind, status
            ORDER BY kind, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(kind, status, count)| StatusCount {
                kind,
                status,
                count,
            })
            .collect())
    }
}
