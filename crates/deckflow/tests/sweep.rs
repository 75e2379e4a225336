mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{deck_params, Harness, ScriptedProcessor, PIPELINE_CLIENT};
use deckflow::jobs::{JobKind, JobStatus, JobStore};
use deckflow::lease::{LeaseBackend, MemoryLease};
use deckflow::pipeline::Pipeline;
use deckflow::queue::{request_queue, response_queue, Broker};
use deckflow::runner::Dispatch;
use deckflow::sweep::{sweep, Housekeeping, SweepReport, SWEEP_LEASE_KEY};

const STALE_AFTER: Duration = Duration::from_secs(60);

fn age(h: &Harness, id: i64) {
    h.store
        .set_updated_at(id, Utc::now() - chrono::Duration::minutes(10));
}

/// Pop one id off `queue` and hand it to `consumer`.
async fn deliver(h: &Harness, consumer: &dyn Dispatch, queue: &str) {
    let (q, raw) = h
        .broker
        .pop(&[queue.to_string()], Duration::ZERO)
        .await
        .unwrap()
        .expect("queue empty");
    consumer
        .dispatch(&h.broker, &q, raw.parse().unwrap())
        .await
        .unwrap();
}

async fn drop_one(h: &Harness, queue: &str) {
    h.broker
        .pop(&[queue.to_string()], Duration::ZERO)
        .await
        .unwrap()
        .expect("queue empty");
}

#[tokio::test]
async fn lost_request_is_pushed_again_once_per_window() {
    let h = Harness::new(vec![]);
    let id = h
        .submit(Pipeline::Snapshot, "deck.pptx", serde_json::json!({}), b"PK")
        .await;
    let request = request_queue(JobKind::Snapshot);
    drop_one(&h, &request).await;

    // fresh jobs are left alone
    let report = sweep(&h.store, &h.broker, STALE_AFTER).await.unwrap();
    assert_eq!(report, SweepReport::default());

    age(&h, id);
    let report = sweep(&h.store, &h.broker, STALE_AFTER).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(h.broker.pending(&request), vec![id.to_string()]);

    // touched by the first sweep
    let report = sweep(&h.store, &h.broker, STALE_AFTER).await.unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(h.broker.pushes_to(&request).len(), 2);
}

#[tokio::test]
async fn lost_completion_signal_is_re_signalled() {
    let duplicate = ScriptedProcessor::returning(vec![b"PK-duplicated".to_vec()]);
    let h = Harness::new(vec![(JobKind::Duplicate, duplicate.clone())]);
    let id = h
        .submit(Pipeline::Render, "template.pptx", deck_params(2), b"PK-template")
        .await;

    deliver(&h, &h.orchestrator, &request_queue(JobKind::Render)).await;
    deliver(&h, &h.workers[0], &request_queue(JobKind::Duplicate)).await;
    let child_response = response_queue(JobKind::Duplicate, PIPELINE_CLIENT);
    drop_one(&h, &child_response).await;

    let parent = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(
        parent.status_message.as_deref(),
        Some("Running duplicate (attempt 1)")
    );
    let child_id = parent.child_job_id.unwrap();
    assert_eq!(
        h.store.get(child_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    age(&h, id);
    let report = sweep(&h.store, &h.broker, STALE_AFTER).await.unwrap();
    assert_eq!(report.resignalled, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(h.broker.pending(&child_response), vec![child_id.to_string()]);

    // the orchestrator picks up where it stopped
    deliver(&h, &h.orchestrator, &child_response).await;
    let parent = h.store.get(id).await.unwrap().unwrap();
    assert_ne!(parent.child_job_id, Some(child_id));
    assert_eq!(h.broker.pending(&request_queue(JobKind::Compose)).len(), 1);
    assert_eq!(duplicate.calls(), 1);
}

#[tokio::test]
async fn parent_of_a_pending_child_keeps_waiting() {
    let h = Harness::new(vec![]);
    let id = h
        .submit(Pipeline::Snapshot, "deck.pptx", serde_json::json!({}), b"PK")
        .await;
    deliver(&h, &h.orchestrator, &request_queue(JobKind::Snapshot)).await;
    let child_request = request_queue(JobKind::Capture);
    drop_one(&h, &child_request).await;

    let child_id = h.store.get(id).await.unwrap().unwrap().child_job_id.unwrap();
    age(&h, id);
    age(&h, child_id);

    let report = sweep(&h.store, &h.broker, STALE_AFTER).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            requeued: 1,
            resignalled: 0,
            waiting: 1,
        }
    );
    // only the stranded stage job went back on a queue
    assert_eq!(h.broker.pending(&child_request), vec![child_id.to_string()]);
    assert!(h.broker.pending(&request_queue(JobKind::Snapshot)).is_empty());
}

#[tokio::test]
async fn settled_jobs_are_never_swept() {
    let h = Harness::new(vec![(
        JobKind::Capture,
        ScriptedProcessor::returning(common::images(2)),
    )]);
    let id = h
        .submit(Pipeline::Snapshot, "deck.pptx", serde_json::json!({}), b"PK")
        .await;
    h.pump().await;
    assert_eq!(
        h.store.get(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    for job in h.store.jobs_of_kind(JobKind::Capture) {
        age(&h, job.id);
    }
    age(&h, id);
    let report = sweep(&h.store, &h.broker, STALE_AFTER).await.unwrap();
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn housekeeping_skips_while_another_worker_holds_the_lease() {
    let h = Harness::new(vec![]);
    let id = h
        .submit(Pipeline::Snapshot, "deck.pptx", serde_json::json!({}), b"PK")
        .await;
    drop_one(&h, &request_queue(JobKind::Snapshot)).await;
    age(&h, id);

    let lease = MemoryLease::new();
    let mut housekeeping = Housekeeping::new(
        Arc::new(h.store.clone()),
        Arc::new(lease.clone()),
        Duration::from_secs(30),
        Duration::from_secs(60),
        STALE_AFTER,
    );

    assert!(lease
        .try_acquire(SWEEP_LEASE_KEY, "other-worker", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(housekeeping.due(tokio::time::Instant::now()));
    assert_eq!(housekeeping.run(&h.broker).await.unwrap(), None);
    assert!(!housekeeping.due(tokio::time::Instant::now()));

    lease.release(SWEEP_LEASE_KEY, "other-worker").await.unwrap();
    let report = housekeeping.run(&h.broker).await.unwrap().unwrap();
    assert_eq!(report.requeued, 1);
    assert!(!lease.is_held(SWEEP_LEASE_KEY));
}
