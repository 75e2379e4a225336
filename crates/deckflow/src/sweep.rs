//! Redelivery sweep for ids whose push was lost.
//!
//! A job can be written to the store and then never reach the broker (crash
//! in between, broker outage). Any PENDING job untouched for `stale_after`
//! is re-pushed: a top-level job with no child back onto its request queue,
//! a top-level job whose child already settled gets the child's response
//! re-pushed, and a stage job goes back onto its stage's request queue. The
//! job is touched afterwards so it is not re-pushed again within the window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::jobs::model::Job;
use crate::jobs::store::JobStore;
use crate::lease::{run_exclusive, LeaseBackend};
use crate::queue::{push_id, request_queue, response_queue, Broker};

pub const SWEEP_LEASE_KEY: &str = "deckflow:sweep";

const SWEEP_BATCH: i64 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub resignalled: usize,
    pub waiting: usize,
}

pub async fn sweep(
    store: &dyn JobStore,
    broker: &dyn Broker,
    stale_after: Duration,
) -> anyhow::Result<SweepReport> {
    let stale_after = chrono::Duration::from_std(stale_after)?;
    let cutoff = Utc::now() - stale_after;
    let mut report = SweepReport::default();

    for job in store.stale_pending(cutoff, SWEEP_BATCH).await? {
        redeliver(store, broker, &job, &mut report).await?;
        store.touch(job.id).await?;
    }

    if report != SweepReport::default() {
        info!(
            requeued = report.requeued,
            resignalled = report.resignalled,
            waiting = report.waiting,
            "sweep redelivered stale jobs"
        );
    }
    Ok(report)
}

async fn redeliver(
    store: &dyn JobStore,
    broker: &dyn Broker,
    job: &Job,
    report: &mut SweepReport,
) -> anyhow::Result<()> {
    let child_id = match job.child_job_id {
        Some(child_id) if !job.kind.is_stage() => child_id,
        _ => {
            push_id(broker, &request_queue(job.kind), job.id).await?;
            report.requeued += 1;
            debug!(job_id = job.id, kind = %job.kind, "requeued stale job");
            return Ok(());
        }
    };

    match store.get(child_id).await? {
        Some(child) if child.status.is_terminal() => {
            push_id(broker, &response_queue(child.kind, &child.client_uid), child.id).await?;
            report.resignalled += 1;
            debug!(job_id = job.id, child = child.id, "re-signalled settled child");
        }
        Some(_) => {
            // the child is pending itself and gets swept on its own
            report.waiting += 1;
        }
        None => {
            push_id(broker, &request_queue(job.kind), job.id).await?;
            report.requeued += 1;
        }
    }
    Ok(())
}

/// Periodic sweep run under a cross-worker lease, driven from a worker's idle
/// polls.
pub struct Housekeeping {
    store: Arc<dyn JobStore>,
    lease: Arc<dyn LeaseBackend>,
    lease_ttl: Duration,
    interval: Duration,
    stale_after: Duration,
    last_run: Option<Instant>,
}

impl Housekeeping {
    pub fn new(
        store: Arc<dyn JobStore>,
        lease: Arc<dyn LeaseBackend>,
        lease_ttl: Duration,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            lease,
            lease_ttl,
            interval,
            stale_after,
            last_run: None,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.last_run
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    /// Sweep if no other worker holds the lease. Returns None when skipped.
    pub async fn run(&mut self, broker: &dyn Broker) -> anyhow::Result<Option<SweepReport>> {
        self.last_run = Some(Instant::now());
        let store = self.store.clone();
        let stale_after = self.stale_after;

        let report = run_exclusive(
            self.lease.clone(),
            SWEEP_LEASE_KEY,
            self.lease_ttl,
            || async move { sweep(store.as_ref(), broker, stale_after).await },
        )
        .await?;

        if report.is_none() {
            debug!("sweep lease held elsewhere, skipping");
        }
        Ok(report)
    }
}
