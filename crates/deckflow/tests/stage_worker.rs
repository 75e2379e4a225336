mod common;

use std::sync::Arc;

use common::ScriptedProcessor;
use deckflow::jobs::{JobKind, JobStatus, JobStore, MemoryJobStore, NewJob};
use deckflow::queue::{response_queue, MemoryBroker};
use deckflow::stage::{StageError, StageWorker};
use serde_json::{json, Value};

fn stage_job(kind: JobKind, name: &str, params: Value, payload: &[u8]) -> NewJob {
    NewJob::new(
        kind,
        "pipeline",
        name,
        params,
        format!(
            r#"{{"stage":"{}","parent_job_id":1,"parent_attempt":1}}"#,
            kind.as_str()
        ),
        payload.to_vec(),
    )
}

fn worker(store: &MemoryJobStore, kind: JobKind, p: &ScriptedProcessor) -> StageWorker {
    StageWorker::new(kind, Arc::new(store.clone()), Arc::new(p.clone())).unwrap()
}

#[tokio::test]
async fn success_writes_ordered_results_and_signals_once() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::returning(common::images(3));
    let w = worker(&store, JobKind::Capture, &p);

    let id = store
        .create(stage_job(JobKind::Capture, "deck.pptx", json!({}), b"PK"))
        .await
        .unwrap();
    w.handle_one(&broker, id).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let results = store.results(id).await.unwrap();
    assert_eq!(
        results.iter().map(|r| r.position).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(results[2].content, b"image-2");

    assert_eq!(
        broker.pushes_to(&response_queue(JobKind::Capture, "pipeline")),
        vec![id.to_string()]
    );
    assert_eq!(p.inputs()[0].name, "deck.pptx");
}

#[tokio::test]
async fn redelivered_terminal_job_only_resignals() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::returning(common::images(1));
    let w = worker(&store, JobKind::Capture, &p);

    let id = store
        .create(stage_job(JobKind::Capture, "deck.pptx", json!({}), b"PK"))
        .await
        .unwrap();
    w.handle_one(&broker, id).await.unwrap();
    w.handle_one(&broker, id).await.unwrap();

    assert_eq!(p.calls(), 1);
    assert_eq!(
        broker.pushes_to(&response_queue(JobKind::Capture, "pipeline")),
        vec![id.to_string(), id.to_string()]
    );
}

#[tokio::test]
async fn processing_error_fails_the_job_with_its_message() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::new(|_, _| Err(StageError::processing("soffice exited with 1")));
    let w = worker(&store, JobKind::Capture, &p);

    let id = store
        .create(stage_job(JobKind::Capture, "deck.pptx", json!({}), b"PK"))
        .await
        .unwrap();
    w.handle_one(&broker, id).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("PROCESSING"));
    assert_eq!(job.status_message.as_deref(), Some("soffice exited with 1"));
    assert!(store.results(id).await.unwrap().is_empty());
    assert_eq!(
        broker.pushes_to(&response_queue(JobKind::Capture, "pipeline")).len(),
        1
    );
}

#[tokio::test]
async fn panics_are_contained_and_fail_the_job() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::new(|_, _| panic!("renderer blew up"));
    let w = worker(&store, JobKind::Capture, &p);

    let id = store
        .create(stage_job(JobKind::Capture, "deck.pptx", json!({}), b"PK"))
        .await
        .unwrap();
    w.handle_one(&broker, id).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("PANIC"));
    assert_eq!(job.status_message.as_deref(), Some("renderer blew up"));
}

#[tokio::test]
async fn validation_runs_before_the_processor() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::returning(common::images(1));
    let w = worker(&store, JobKind::Capture, &p);

    let id = store
        .create(stage_job(JobKind::Capture, "notes.docx", json!({}), b"PK"))
        .await
        .unwrap();
    w.handle_one(&broker, id).await.unwrap();

    assert_eq!(p.calls(), 0);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.error_code.as_deref(), Some("VALIDATION"));
    assert_eq!(job.status_message.as_deref(), Some("Unknown file type"));
}

#[tokio::test]
async fn single_output_stages_reject_extra_items() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::returning(vec![b"a".to_vec(), b"b".to_vec()]);
    let w = worker(&store, JobKind::Compose, &p);

    let id = store
        .create(stage_job(
            JobKind::Compose,
            "t.pptx",
            common::deck_params(2),
            b"PK-dup",
        ))
        .await
        .unwrap();
    w.handle_one(&broker, id).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("PROCESSING"));
    assert!(store.results(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_and_foreign_ids_are_dropped() {
    let store = MemoryJobStore::new();
    let broker = MemoryBroker::new();
    let p = ScriptedProcessor::returning(common::images(1));
    let w = worker(&store, JobKind::Capture, &p);

    w.handle_one(&broker, 999).await.unwrap();

    let dup = store
        .create(stage_job(
            JobKind::Duplicate,
            "t.pptx",
            json!({"target_count": 2}),
            b"PK",
        ))
        .await
        .unwrap();
    w.handle_one(&broker, dup).await.unwrap();

    assert_eq!(p.calls(), 0);
    assert_eq!(
        store.get(dup).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
    assert!(broker
        .pushes_to(&response_queue(JobKind::Capture, "pipeline"))
        .is_empty());
}

#[test]
fn top_level_kinds_are_not_stages() {
    let store = MemoryJobStore::new();
    let p = ScriptedProcessor::returning(vec![]);
    assert!(StageWorker::new(JobKind::Render, Arc::new(store), Arc::new(p)).is_err());
}
