use std::sync::Arc;

use deckflow::api;
use deckflow::config::Config;
use deckflow::db;
use deckflow::jobs::{JobKind, JobStore, JobsRepo, RetryPolicy};
use deckflow::lease::{LeaseBackend, RedisLease};
use deckflow::pipeline::Orchestrator;
use deckflow::queue::{BrokerConnector, RedisConnector};
use deckflow::runner::Runner;
use deckflow::stage::StageWorker;
use deckflow::sweep::Housekeeping;
use deckflow::telemetry;
use tracing::{info, warn};

mod handlers;
use handlers::build_registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Pipeline,
    Stage(JobKind),
}

const STAGES: [JobKind; 3] = [JobKind::Duplicate, JobKind::Compose, JobKind::Capture];

/// Roles from the command line; no arguments means `all`.
fn parse_roles(args: &[String]) -> anyhow::Result<(Vec<Role>, bool)> {
    if args.is_empty() || args.iter().any(|a| a == "all") {
        let mut roles = vec![Role::Pipeline];
        roles.extend(STAGES.map(Role::Stage));
        return Ok((roles, true));
    }

    let mut roles = Vec::new();
    for arg in args {
        let role = match arg.as_str() {
            "pipeline" => Role::Pipeline,
            other => match JobKind::parse(other).filter(JobKind::is_stage) {
                Some(kind) => Role::Stage(kind),
                None => anyhow::bail!(
                    "unknown role {other:?}; expected capture, duplicate, compose, pipeline or all"
                ),
            },
        };
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    Ok((roles, false))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    telemetry::init(cfg.log_json);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (roles, all) = parse_roles(&args)?;

    info!(
        worker_id = %cfg.worker_id,
        roles = ?roles,
        poll_timeout_secs = cfg.poll_timeout_secs,
        retry_bound = cfg.retry_bound,
        pipeline_client = %cfg.pipeline_client,
        lease_ttl_secs = cfg.lease_ttl_secs,
        sweep_interval_secs = cfg.sweep_interval_secs,
        stale_after_secs = cfg.stale_after_secs,
        api = %cfg.admin_addr.clone().unwrap_or_else(|| "disabled".to_string()),
        migrate_on_startup = cfg.migrate_on_startup,
        "deckflow worker starting"
    );

    let pool = db::make_pool(&cfg).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(JobsRepo::new(pool.clone()));
    let redis = RedisConnector::new(&cfg.redis_url)?;
    let lease: Arc<dyn LeaseBackend> = Arc::new(RedisLease::new(redis.client().clone()));
    let connector: Arc<dyn BrokerConnector> = Arc::new(redis);
    let registry = build_registry(&cfg)?;

    let housekeeping = || {
        Housekeeping::new(
            store.clone(),
            lease.clone(),
            cfg.lease_ttl(),
            cfg.sweep_interval(),
            cfg.stale_after(),
        )
    };

    let mut tasks = tokio::task::JoinSet::new();

    // ---- API task ----
    if let Some(addr) = cfg.admin_addr.clone() {
        let app = api::router(api::ApiState {
            store: store.clone(),
        });
        tasks.spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
            Ok::<(), anyhow::Error>(())
        });
    }

    // ---- Consumer tasks ----
    for role in roles {
        match role {
            Role::Pipeline => {
                let orchestrator = Orchestrator::new(
                    store.clone(),
                    RetryPolicy::new(cfg.retry_bound),
                    cfg.pipeline_client.clone(),
                );
                let runner = Runner::new(
                    orchestrator,
                    connector.clone(),
                    cfg.worker_id.clone(),
                    cfg.poll_timeout(),
                )
                .with_housekeeping(housekeeping());
                tasks.spawn(runner.run());
            }
            Role::Stage(kind) => {
                let Some(processor) = registry.processor_for(kind) else {
                    if all {
                        warn!(stage = %kind, "no command configured, stage not started");
                        continue;
                    }
                    anyhow::bail!(
                        "no command configured for {kind}; set DECKFLOW_{}_CMD",
                        kind.as_str().to_uppercase()
                    );
                };
                let worker = StageWorker::new(kind, store.clone(), processor)?;
                let runner = Runner::new(
                    worker,
                    connector.clone(),
                    cfg.worker_id.clone(),
                    cfg.poll_timeout(),
                )
                .with_housekeeping(housekeeping());
                tasks.spawn(runner.run());
            }
        }
    }

    while let Some(res) = tasks.join_next().await {
        res??;
    }

    Ok(())
}
