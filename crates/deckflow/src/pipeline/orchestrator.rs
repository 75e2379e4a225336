//! Completion handling for top-level jobs.
//!
//! There is no scheduler: the pipeline consumer pops a top-level request and
//! spawns the first stage; each stage response then either spawns the next
//! stage, finalizes the parent, or hands the failure to the retry policy.
//! Every advance goes through a guarded store call, so a duplicated or late
//! signal changes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::jobs::correlation::{Correlation, ParentLink};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{Job, JobId, JobKind, NewJob, TransitionOutcome};
use crate::jobs::retry::{RetryDecision, RetryPolicy};
use crate::jobs::store::JobStore;
use crate::queue::{push_id, request_queue, response_queue, Broker};
use crate::runner::Dispatch;
use crate::stage::{parse_params, DeckParams, StageError, COMPOSED_DECK_NAME};

use super::{next_step, Pipeline, Step};

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    client_uid: String,
}

impl Orchestrator {
    /// `client_uid` is the identity stage jobs are created under; stage
    /// responses come back on `<stage>:response:<client_uid>`.
    pub fn new(store: Arc<dyn JobStore>, policy: RetryPolicy, client_uid: impl Into<String>) -> Self {
        Self {
            store,
            policy,
            client_uid: client_uid.into(),
        }
    }

    pub fn client_uid(&self) -> &str {
        &self.client_uid
    }

    // ----------------------------
    // Intake
    // ----------------------------

    /// A top-level job was popped from its request queue: start its first stage.
    pub async fn on_request(&self, broker: &dyn Broker, id: JobId) -> anyhow::Result<()> {
        let Some(job) = self.store.get(id).await? else {
            warn!(job_id = id, "request for missing job, dropping");
            return Ok(());
        };
        let Some(pipeline) = Pipeline::for_kind(job.kind) else {
            warn!(job_id = id, kind = %job.kind, "not a pipeline job, dropping");
            return Ok(());
        };

        if job.status.is_terminal() {
            debug!(job_id = id, status = %job.status, "already terminal, re-signalling");
            return self.notify(broker, &job).await;
        }
        if let Some(child) = job.child_job_id {
            debug!(job_id = id, child, "already running, ignoring duplicate request");
            return Ok(());
        }

        let stage = pipeline.first_stage();
        let params = match first_params(pipeline, &job) {
            Ok(params) => params,
            Err(e) => {
                warn!(job_id = id, code = e.code, error = %e.message, "rejecting request");
                if self.store.fail(id, e.code, &e.message).await?.applied() {
                    self.notify(broker, &job).await?;
                }
                return Ok(());
            }
        };
        let child = self.stage_job(stage, &job, job.name.clone(), params, job.payload.clone());
        self.advance(broker, &job, None, stage, child).await
    }

    // ----------------------------
    // Completion
    // ----------------------------

    /// A stage job signalled completion on our response queue.
    pub async fn on_stage_done(&self, broker: &dyn Broker, child_id: JobId) -> anyhow::Result<()> {
        let Some(child) = self.store.get(child_id).await? else {
            warn!(job_id = child_id, "response for missing job, dropping");
            return Ok(());
        };
        if !child.status.is_terminal() {
            warn!(job_id = child_id, "response for a job that is still pending, dropping");
            return Ok(());
        }

        let link = match Correlation::decode_parent(&child) {
            Ok(link) => link,
            Err(e) => {
                error!(job_id = child_id, error = %e, "cannot route stage response");
                return Ok(());
            }
        };

        let Some(parent) = self.store.get(link.parent_job_id).await? else {
            warn!(job_id = child_id, parent = link.parent_job_id, "parent missing, dropping");
            return Ok(());
        };
        if parent.status.is_terminal() && self.is_last_child(&parent, &child, link) {
            // the parent settled but its requester may never have heard
            debug!(job_id = child_id, parent = parent.id, "parent already terminal, re-signalling");
            return self.notify(broker, &parent).await;
        }
        if !self.is_current(&parent, &child, link) {
            debug!(
                job_id = child_id,
                parent = parent.id,
                parent_status = %parent.status,
                "stale stage signal, ignoring"
            );
            return Ok(());
        }
        let Some(pipeline) = Pipeline::for_kind(parent.kind) else {
            warn!(job_id = child_id, parent = parent.id, "parent is not a pipeline job");
            return Ok(());
        };

        match next_step(pipeline, child.kind, child.status) {
            Step::Enqueue(next) => self.enqueue_next(broker, &parent, &child, next).await,
            Step::Finalize => self.finalize(broker, pipeline, &parent, &child).await,
            Step::Supervise => {
                self.supervise(broker, &parent, &child, child.error_code.as_deref())
                    .await
            }
            Step::Ignore => {
                warn!(job_id = child_id, stage = %child.kind, pipeline = ?pipeline, "stage not in pipeline");
                Ok(())
            }
        }
    }

    fn is_last_child(&self, parent: &Job, child: &Job, link: ParentLink) -> bool {
        parent.child_job_id == Some(child.id) && parent.attempt_count == link.parent_attempt
    }

    fn is_current(&self, parent: &Job, child: &Job, link: ParentLink) -> bool {
        !parent.status.is_terminal() && self.is_last_child(parent, child, link)
    }

    async fn enqueue_next(
        &self,
        broker: &dyn Broker,
        parent: &Job,
        child: &Job,
        next: JobKind,
    ) -> anyhow::Result<()> {
        let Some(artifact) = self.single_result(child).await? else {
            warn!(job_id = child.id, "completed stage has no result item");
            return self
                .supervise(broker, parent, child, Some(ErrorCode::Processing.as_str()))
                .await;
        };

        let (name, params) = match next {
            JobKind::Compose => (parent.name.clone(), parent.params.clone()),
            JobKind::Capture => (COMPOSED_DECK_NAME.to_string(), json!({})),
            _ => (parent.name.clone(), json!({})),
        };
        let job = self.stage_job(next, parent, name, params, artifact);
        self.advance(broker, parent, Some(child.id), next, job).await
    }

    async fn single_result(&self, job: &Job) -> anyhow::Result<Option<Vec<u8>>> {
        let mut items = self.store.results(job.id).await?;
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(items.swap_remove(0).content))
    }

    async fn advance(
        &self,
        broker: &dyn Broker,
        parent: &Job,
        expected_child: Option<JobId>,
        stage: JobKind,
        job: NewJob,
    ) -> anyhow::Result<()> {
        match self
            .store
            .spawn_child(parent.id, expected_child, parent.attempt_count, job)
            .await?
        {
            Some(child_id) => {
                push_id(broker, &request_queue(stage), child_id).await?;
                let note = format!("Running {stage} (attempt {})", parent.attempt_count);
                self.store.set_message(parent.id, &note).await?;
                info!(
                    job_id = parent.id,
                    child = child_id,
                    stage = %stage,
                    attempt = parent.attempt_count,
                    "stage enqueued"
                );
            }
            None => debug!(job_id = parent.id, stage = %stage, "parent moved on, not enqueueing"),
        }
        Ok(())
    }

    async fn finalize(
        &self,
        broker: &dyn Broker,
        pipeline: Pipeline,
        parent: &Job,
        capture: &Job,
    ) -> anyhow::Result<()> {
        let mut items: Vec<Vec<u8>> = Vec::new();
        if pipeline == Pipeline::Render {
            // the capture job's input is the composed deck
            items.push(capture.payload.clone());
        }
        items.extend(
            self.store
                .results(capture.id)
                .await?
                .into_iter()
                .map(|item| item.content),
        );

        let outcome = self
            .store
            .complete_with_results(parent.id, items, "OK")
            .await?;
        if outcome == TransitionOutcome::Applied {
            info!(job_id = parent.id, kind = %parent.kind, "pipeline completed");
            self.notify(broker, parent).await?;
        }
        Ok(())
    }

    // ----------------------------
    // Retry supervision
    // ----------------------------

    async fn supervise(
        &self,
        broker: &dyn Broker,
        parent: &Job,
        child: &Job,
        child_code: Option<&str>,
    ) -> anyhow::Result<()> {
        let attempt = parent.attempt_count;
        let reason = child.status_message.as_deref().unwrap_or("stage failed");

        match self.policy.decide(child_code, attempt) {
            RetryDecision::Restart => {
                let message = format!(
                    "Retrying after {} job {} failed: {reason}",
                    child.kind, child.id
                );
                let outcome = self.store.restart(parent.id, attempt, &message).await?;
                if outcome.applied() {
                    push_id(broker, &request_queue(parent.kind), parent.id).await?;
                    warn!(
                        job_id = parent.id,
                        child = child.id,
                        attempt = attempt + 1,
                        bound = self.policy.bound,
                        "sub-pipeline restarted"
                    );
                }
            }
            RetryDecision::Fail(code) => {
                let message = match code {
                    ErrorCode::RetriesExhausted => format!(
                        "{} failed after {attempt} attempts: {reason}",
                        child.kind
                    ),
                    _ => reason.to_string(),
                };
                let outcome = self.store.fail(parent.id, code.as_str(), &message).await?;
                if outcome.applied() {
                    error!(job_id = parent.id, child = child.id, code = %code, "pipeline failed");
                    self.notify(broker, parent).await?;
                }
            }
        }
        Ok(())
    }

    // ----------------------------
    // Helpers
    // ----------------------------

    fn stage_job(
        &self,
        stage: JobKind,
        parent: &Job,
        name: String,
        params: Value,
        payload: Vec<u8>,
    ) -> NewJob {
        let link = ParentLink {
            parent_job_id: parent.id,
            parent_attempt: parent.attempt_count,
        };
        let extra_data = Correlation::for_stage(stage, link)
            .map(|c| c.encode())
            .unwrap_or_default();
        NewJob::new(stage, self.client_uid.clone(), name, params, extra_data, payload)
    }

    async fn notify(&self, broker: &dyn Broker, job: &Job) -> anyhow::Result<()> {
        push_id(broker, &response_queue(job.kind, &job.client_uid), job.id).await
    }
}

/// Parameters of the first stage, derived from the request.
fn first_params(pipeline: Pipeline, job: &Job) -> Result<Value, StageError> {
    match pipeline {
        Pipeline::Render => {
            let deck: DeckParams = parse_params(&job.params)?;
            // one copy per slide plus the title slide
            Ok(json!({ "target_count": deck.slides.len() + 1 }))
        }
        Pipeline::Snapshot => Ok(job.params.clone()),
    }
}

#[async_trait]
impl Dispatch for Orchestrator {
    fn role(&self) -> &str {
        "pipeline"
    }

    /// Stage responses first so in-flight pipelines drain before new ones start.
    fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = [JobKind::Duplicate, JobKind::Compose, JobKind::Capture]
            .into_iter()
            .map(|k| response_queue(k, &self.client_uid))
            .collect();
        queues.extend(Pipeline::ALL.iter().map(|p| request_queue(p.kind())));
        queues
    }

    async fn dispatch(&self, broker: &dyn Broker, queue: &str, id: JobId) -> anyhow::Result<()> {
        if Pipeline::ALL
            .iter()
            .any(|p| request_queue(p.kind()) == queue)
        {
            self.on_request(broker, id).await
        } else {
            self.on_stage_done(broker, id).await
        }
    }
}
