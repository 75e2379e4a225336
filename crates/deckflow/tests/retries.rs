mod common;

use common::{Harness, ScriptedProcessor, CLIENT};
use deckflow::jobs::{JobKind, JobStatus, JobStore, RetryPolicy};
use deckflow::pipeline::Pipeline;
use deckflow::queue::{request_queue, response_queue};
use deckflow::stage::StageError;
use serde_json::json;

#[tokio::test]
async fn sub_pipeline_failing_every_time_stops_at_the_bound() {
    let capture = ScriptedProcessor::flaky(usize::MAX, vec![]);
    let h = Harness::new(vec![(JobKind::Capture, capture.clone())]);

    let id = h
        .submit(Pipeline::Snapshot, "book.xlsx", json!({}), b"PK-book")
        .await;
    h.pump().await;

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("RETRIES_EXHAUSTED"));
    assert_eq!(job.attempt_count, 5);

    // no 6th attempt: the initial push plus 4 restarts
    assert_eq!(capture.calls(), 5);
    assert_eq!(
        h.broker.pushes_to(&request_queue(JobKind::Snapshot)).len(),
        5
    );
    assert_eq!(h.store.jobs_of_kind(JobKind::Capture).len(), 5);

    assert_eq!(
        h.broker
            .pushes_to(&response_queue(JobKind::Snapshot, CLIENT)),
        vec![id.to_string()]
    );
}

#[tokio::test]
async fn three_item_capture_succeeds_on_third_attempt() {
    let capture = ScriptedProcessor::flaky(2, common::images(3));
    let h = Harness::new(vec![(JobKind::Capture, capture.clone())]);

    let id = h
        .submit(Pipeline::Snapshot, "book.xlsx", json!({}), b"PK-book")
        .await;
    h.pump().await;

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(capture.calls(), 3);

    let results = h.store.results(id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].content, b"image-0");

    assert_eq!(
        h.broker
            .pushes_to(&response_queue(JobKind::Snapshot, CLIENT)),
        vec![id.to_string()]
    );
}

#[tokio::test]
async fn bound_is_configurable() {
    let capture = ScriptedProcessor::flaky(usize::MAX, vec![]);
    let h = Harness::with_policy(vec![(JobKind::Capture, capture.clone())], RetryPolicy::new(2));

    let id = h
        .submit(Pipeline::Snapshot, "book.xlsx", json!({}), b"PK-book")
        .await;
    h.pump().await;

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(capture.calls(), 2);
}

#[tokio::test]
async fn validation_failure_is_not_retried() {
    let capture = ScriptedProcessor::returning(common::images(1));
    let h = Harness::new(vec![(JobKind::Capture, capture.clone())]);

    let id = h
        .submit(Pipeline::Snapshot, "notes.txt", json!({}), b"plain")
        .await;
    h.pump().await;

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("STAGE_FAILED"));
    assert_eq!(job.status_message.as_deref(), Some("Unknown file type"));
    assert_eq!(job.attempt_count, 1);
    assert_eq!(capture.calls(), 0);
}

#[tokio::test]
async fn duplicated_failure_signal_restarts_only_once() {
    let capture = ScriptedProcessor::new(|_, call| {
        if call == 0 {
            Err(StageError::processing("first run dies"))
        } else {
            Ok(common::images(2))
        }
    });
    let h = Harness::new(vec![(JobKind::Capture, capture.clone())]);

    let id = h
        .submit(Pipeline::Snapshot, "deck.pptx", json!({}), b"PK-deck")
        .await;

    // request -> capture job
    h.orchestrator
        .on_request(&h.broker, id)
        .await
        .unwrap();
    let first_child = h.store.get(id).await.unwrap().unwrap().child_job_id.unwrap();
    h.workers[0].handle_one(&h.broker, first_child).await.unwrap();

    // the failure signal arrives twice
    h.orchestrator.on_stage_done(&h.broker, first_child).await.unwrap();
    h.orchestrator.on_stage_done(&h.broker, first_child).await.unwrap();

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 2);

    h.pump().await;
    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(capture.calls(), 2);
}
