use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::jobs::dedup::{try_reuse, Reuse};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{Job, JobId, JobKind, TransitionOutcome};
use crate::jobs::store::JobStore;
use crate::queue::{push_id, request_queue, response_queue, Broker};
use crate::runner::Dispatch;

use super::{check_output, validate, StageError, StageInput, StageProcessor};

/// Consumer of one stage's request queue.
#[derive(Clone)]
pub struct StageWorker {
    kind: JobKind,
    store: Arc<dyn JobStore>,
    processor: Arc<dyn StageProcessor>,
}

impl StageWorker {
    pub fn new(
        kind: JobKind,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn StageProcessor>,
    ) -> anyhow::Result<Self> {
        if !kind.is_stage() {
            anyhow::bail!("{kind} is not a stage kind");
        }
        Ok(Self {
            kind,
            store,
            processor,
        })
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Handle one popped id: bring the job to a terminal status if it is not
    /// already, then signal its requester exactly once for this delivery.
    pub async fn handle_one(&self, broker: &dyn Broker, id: JobId) -> anyhow::Result<()> {
        let Some(job) = self.store.get(id).await? else {
            warn!(job_id = id, "job not found, dropping");
            return Ok(());
        };
        if job.kind != self.kind {
            warn!(job_id = id, kind = %job.kind, "job does not belong to this stage, dropping");
            return Ok(());
        }

        if job.status.is_terminal() {
            debug!(job_id = id, status = %job.status, "already terminal, re-signalling");
        } else {
            self.settle(&job).await?;
        }

        push_id(broker, &response_queue(job.kind, &job.client_uid), job.id).await
    }

    async fn settle(&self, job: &Job) -> anyhow::Result<()> {
        match try_reuse(self.store.as_ref(), job).await? {
            Reuse::Copied { .. } => return Ok(()),
            Reuse::Stale { source } => {
                debug!(job_id = job.id, source, "job settled elsewhere during reuse");
                return Ok(());
            }
            Reuse::Miss => {}
        }

        let outcome = match self.execute(job).await {
            Ok(items) => {
                info!(job_id = job.id, items = items.len(), "stage completed");
                self.store.complete_with_results(job.id, items, "OK").await?
            }
            Err(e) => {
                warn!(job_id = job.id, code = e.code, error = %e.message, "stage failed");
                self.store.fail(job.id, e.code, &e.message).await?
            }
        };

        if outcome == TransitionOutcome::Stale {
            info!(job_id = job.id, "another worker settled the job first");
        }
        Ok(())
    }

    /// Validation plus the processor, with panics contained in a task.
    async fn execute(&self, job: &Job) -> Result<Vec<Vec<u8>>, StageError> {
        let input = StageInput::from(job);
        validate(&input)?;

        let processor = self.processor.clone();
        let handle = tokio::spawn(async move { processor.process(input).await });

        let items = match handle.await {
            Ok(res) => res?,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "processor task cancelled".to_string()
                };
                error!(job_id = job.id, error = %message, "processor panicked");
                return Err(StageError::new(ErrorCode::Panic, message));
            }
        };

        check_output(job.kind, &items)?;
        Ok(items)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "processor panicked".to_string()
    }
}

#[async_trait]
impl Dispatch for StageWorker {
    fn role(&self) -> &str {
        self.kind.as_str()
    }

    fn queues(&self) -> Vec<String> {
        vec![request_queue(self.kind)]
    }

    async fn dispatch(&self, broker: &dyn Broker, _queue: &str, id: JobId) -> anyhow::Result<()> {
        self.handle_one(broker, id).await
    }
}
