#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deckflow::jobs::{JobKind, JobStore, MemoryJobStore, RetryPolicy};
use deckflow::pipeline::{submit, Orchestrator, Pipeline, Submission};
use deckflow::queue::{Broker, MemoryBroker};
use deckflow::runner::Dispatch;
use deckflow::stage::{StageError, StageInput, StageProcessor, StageWorker};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const CLIENT: &str = "web-1";
pub const PIPELINE_CLIENT: &str = "pipeline";

/// Postgres for store tests. None when TEST_DATABASE_URL is not set, so the
/// memory-backed suites still run without a database.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            job_results,
            jobs
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

// ----------------------------
// Processors
// ----------------------------

type Script = dyn Fn(&StageInput, usize) -> Result<Vec<Vec<u8>>, StageError> + Send + Sync;

/// Processor driven by a closure that also sees the 0-based call number.
#[derive(Clone)]
pub struct ScriptedProcessor {
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<StageInput>>>,
    script: Arc<Script>,
}

impl ScriptedProcessor {
    pub fn new(
        script: impl Fn(&StageInput, usize) -> Result<Vec<Vec<u8>>, StageError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        }
    }

    /// Always returns `items`.
    pub fn returning(items: Vec<Vec<u8>>) -> Self {
        Self::new(move |_, _| Ok(items.clone()))
    }

    /// Fails the first `failures` calls, then returns `items`.
    pub fn flaky(failures: usize, items: Vec<Vec<u8>>) -> Self {
        Self::new(move |_, call| {
            if call < failures {
                Err(StageError::processing(format!("converter crashed (call {call})")))
            } else {
                Ok(items.clone())
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<StageInput> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageProcessor for ScriptedProcessor {
    async fn process(&self, input: StageInput) -> Result<Vec<Vec<u8>>, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());
        (self.script)(&input, call)
    }
}

// ----------------------------
// Harness
// ----------------------------

pub struct Harness {
    pub store: MemoryJobStore,
    pub broker: MemoryBroker,
    pub orchestrator: Orchestrator,
    pub workers: Vec<StageWorker>,
}

impl Harness {
    pub fn new(stages: Vec<(JobKind, ScriptedProcessor)>) -> Self {
        Self::with_policy(stages, RetryPolicy::default())
    }

    pub fn with_policy(stages: Vec<(JobKind, ScriptedProcessor)>, policy: RetryPolicy) -> Self {
        let store = MemoryJobStore::new();
        let shared: Arc<dyn JobStore> = Arc::new(store.clone());
        let orchestrator = Orchestrator::new(shared.clone(), policy, PIPELINE_CLIENT);
        let workers = stages
            .into_iter()
            .map(|(kind, p)| StageWorker::new(kind, shared.clone(), Arc::new(p)).unwrap())
            .collect();

        Self {
            store,
            broker: MemoryBroker::new(),
            orchestrator,
            workers,
        }
    }

    pub async fn submit(&self, pipeline: Pipeline, name: &str, params: Value, payload: &[u8]) -> i64 {
        submit(
            &self.store,
            &self.broker,
            Submission {
                pipeline,
                client_uid: CLIENT.to_string(),
                name: name.to_string(),
                params,
                reference: Some(json!({"request": "r-1"})),
                payload: payload.to_vec(),
            },
            64 * 1024 * 1024,
        )
        .await
        .unwrap()
    }

    /// Deliver queued ids to their consumers until every queue they listen
    /// on is empty. Returns the number of deliveries.
    pub async fn pump(&self) -> usize {
        let mut consumers: Vec<&dyn Dispatch> = vec![&self.orchestrator];
        consumers.extend(self.workers.iter().map(|w| w as &dyn Dispatch));

        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for consumer in &consumers {
                let queues = consumer.queues();
                while let Some((queue, raw)) =
                    self.broker.pop(&queues, Duration::ZERO).await.unwrap()
                {
                    let id = raw.parse().unwrap();
                    consumer.dispatch(&self.broker, &queue, id).await.unwrap();
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return delivered;
            }
        }
    }
}

pub fn deck_params(slides: usize) -> Value {
    let slides: Vec<Value> = (0..slides)
        .map(|i| json!({"title": format!("Slide {i}"), "body": "text"}))
        .collect();
    json!({"title": "Quarterly", "subtitle": "Q3", "slides": slides})
}

pub fn images(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("image-{i}").into_bytes()).collect()
}
