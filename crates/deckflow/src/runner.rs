//! The queue-consuming loop shared by stage workers and the pipeline.
//!
//! Pop with a bounded timeout; on an id, dispatch it; on timeout, run due
//! housekeeping and poll again. Any error escaping a dispatch or the broker
//! drops the connection, backs off and reconnects; an id whose dispatch failed
//! is pushed back onto its queue once connected again. The loop never returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::jobs::model::JobId;
use crate::jobs::retry::{Backoff, RetryConfig};
use crate::queue::{parse_job_id, Broker, BrokerConnector};
use crate::sweep::Housekeeping;

#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Role name for logs (`capture`, `pipeline`, ...).
    fn role(&self) -> &str;

    /// Queues this consumer pops from, highest priority first.
    fn queues(&self) -> Vec<String>;

    async fn dispatch(&self, broker: &dyn Broker, queue: &str, id: JobId) -> anyhow::Result<()>;
}

pub struct Runner<D> {
    dispatch: D,
    connector: Arc<dyn BrokerConnector>,
    worker_id: String,
    poll_timeout: Duration,
    reconnect: RetryConfig,
    housekeeping: Option<Housekeeping>,
    /// Popped value whose dispatch failed; pushed back after reconnecting.
    unfinished: Option<(String, String)>,
}

impl<D: Dispatch> Runner<D> {
    pub fn new(
        dispatch: D,
        connector: Arc<dyn BrokerConnector>,
        worker_id: impl Into<String>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            dispatch,
            connector,
            worker_id: worker_id.into(),
            poll_timeout,
            reconnect: RetryConfig::default(),
            housekeeping: None,
            unfinished: None,
        }
    }

    pub fn with_reconnect(mut self, cfg: RetryConfig) -> Self {
        self.reconnect = cfg;
        self
    }

    pub fn with_housekeeping(mut self, housekeeping: Housekeeping) -> Self {
        self.housekeeping = Some(housekeeping);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let span = tracing::info_span!(
            "worker",
            stage = %self.dispatch.role(),
            worker_id = %self.worker_id
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> anyhow::Result<()> {
        let queues = self.dispatch.queues();
        let mut backoff = Backoff::new(self.reconnect.clone());
        info!(?queues, poll_timeout_secs = self.poll_timeout.as_secs(), "worker starting");

        loop {
            let broker = match self.connector.connect().await {
                Ok(broker) => broker,
                Err(e) => {
                    let delay = backoff.next();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "broker connect failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            if let Err(e) = self.requeue_unfinished(broker.as_ref()).await {
                let delay = backoff.next();
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "requeue after reconnect failed");
                drop(broker);
                tokio::time::sleep(delay).await;
                continue;
            }

            if let Err(e) = self.serve(broker.as_ref(), &queues, &mut backoff).await {
                let delay = backoff.next();
                warn!(
                    error = %e,
                    failures = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "worker loop error, reconnecting"
                );
                // close the old handle before opening a new one
                drop(broker);
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn serve(
        &mut self,
        broker: &dyn Broker,
        queues: &[String],
        backoff: &mut Backoff,
    ) -> anyhow::Result<()> {
        loop {
            let Some((queue, raw)) = broker.pop(queues, self.poll_timeout).await? else {
                self.idle(broker).await;
                continue;
            };
            backoff.reset();

            let Some(id) = parse_job_id(&raw) else {
                warn!(queue = %queue, value = %raw, "dropping value that is not a job id");
                continue;
            };

            debug!(queue = %queue, job_id = id, "popped");
            if let Err(e) = self.dispatch.dispatch(broker, &queue, id).await {
                self.unfinished = Some((queue, raw));
                return Err(e);
            }
        }
    }

    async fn requeue_unfinished(&mut self, broker: &dyn Broker) -> anyhow::Result<()> {
        let Some((queue, raw)) = self.unfinished.take() else {
            return Ok(());
        };
        if let Err(e) = broker.push(&queue, &raw).await {
            self.unfinished = Some((queue, raw));
            return Err(e);
        }
        info!(queue = %queue, value = %raw, "requeued value whose dispatch failed");
        Ok(())
    }

    async fn idle(&mut self, broker: &dyn Broker) {
        let Some(housekeeping) = self.housekeeping.as_mut() else {
            return;
        };
        if !housekeeping.due(Instant::now()) {
            return;
        }
        if let Err(e) = housekeeping.run(broker).await {
            warn!(error = %e, "housekeeping failed");
        }
    }
}
