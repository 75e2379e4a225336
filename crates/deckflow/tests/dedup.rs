mod common;

use std::sync::Arc;

use common::ScriptedProcessor;
use deckflow::jobs::{JobKind, JobStatus, JobStore, MemoryJobStore, NewJob};
use deckflow::queue::{response_queue, MemoryBroker};
use deckflow::stage::StageWorker;
use serde_json::json;

fn capture_job(payload: &[u8], parent: i64) -> NewJob {
    NewJob::new(
        JobKind::Capture,
        "pipeline",
        "deck.pptx",
        json!({}),
        format!(r#"{{"stage":"capture","parent_job_id":{parent},"parent_attempt":1}}"#),
        payload.to_vec(),
    )
}

#[tokio::test]
async fn identical_input_reuses_results_without_processing() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let processor = ScriptedProcessor::returning(common::images(3));
    let worker = StageWorker::new(
        JobKind::Capture,
        Arc::new(store.clone()),
        Arc::new(processor.clone()),
    )
    .unwrap();

    let first = store.create(capture_job(b"PK-deck", 100)).await.unwrap();
    worker.handle_one(&broker, first).await.unwrap();
    assert_eq!(processor.calls(), 1);

    // different correlation, same content
    let second = store.create(capture_job(b"PK-deck", 200)).await.unwrap();
    worker.handle_one(&broker, second).await.unwrap();
    assert_eq!(processor.calls(), 1, "second job must not invoke the processor");

    let job = store.get(second).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.status_message.as_deref(),
        Some(format!("OK. Copied from {first}").as_str())
    );

    let copied: Vec<_> = store
        .results(second)
        .await
        .unwrap()
        .into_iter()
        .map(|i| (i.position, i.content))
        .collect();
    let original: Vec<_> = store
        .results(first)
        .await
        .unwrap()
        .into_iter()
        .map(|i| (i.position, i.content))
        .collect();
    assert_eq!(copied, original);
    assert_eq!(copied.len(), 3);

    // both deliveries signalled their requester
    assert_eq!(
        broker.pushes_to(&response_queue(JobKind::Capture, "pipeline")),
        vec![first.to_string(), second.to_string()]
    );
}

#[tokio::test]
async fn failed_jobs_are_never_reused() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let processor = ScriptedProcessor::flaky(1, common::images(1));
    let worker = StageWorker::new(
        JobKind::Capture,
        Arc::new(store.clone()),
        Arc::new(processor.clone()),
    )
    .unwrap();

    let first = store.create(capture_job(b"PK-deck", 1)).await.unwrap();
    worker.handle_one(&broker, first).await.unwrap();
    assert_eq!(
        store.get(first).await.unwrap().unwrap().status,
        JobStatus::Failed
    );

    let second = store.create(capture_job(b"PK-deck", 1)).await.unwrap();
    worker.handle_one(&broker, second).await.unwrap();
    assert_eq!(processor.calls(), 2);
    let job = store.get(second).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.status_message.as_deref(), Some("OK"));
}

#[tokio::test]
async fn params_are_part_of_the_input() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let processor = ScriptedProcessor::returning(vec![b"dup".to_vec()]);
    let worker = StageWorker::new(
        JobKind::Duplicate,
        Arc::new(store.clone()),
        Arc::new(processor.clone()),
    )
    .unwrap();

    let dup = |n: u32| {
        NewJob::new(
            JobKind::Duplicate,
            "pipeline",
            "template.pptx",
            json!({"target_count": n}),
            r#"{"stage":"duplicate","parent_job_id":1,"parent_attempt":1}"#.to_string(),
            b"PK-template".to_vec(),
        )
    };

    let a = store.create(dup(3)).await.unwrap();
    let b = store.create(dup(4)).await.unwrap();
    worker.handle_one(&broker, a).await.unwrap();
    worker.handle_one(&broker, b).await.unwrap();

    assert_eq!(processor.calls(), 2);
}
