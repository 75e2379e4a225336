use std::env;
use std::path::Path;
use std::time::Duration;

use deckflow::config::Config;
use deckflow::db;
use deckflow::jobs::{JobKind, JobStore, JobsRepo};
use deckflow::pipeline::{submit, Pipeline, Submission};
use deckflow::queue::{parse_job_id, response_queue, Broker, BrokerConnector, RedisConnector};
use serde_json::Value;
use sqlx::PgPool;

const USAGE: &str = "deckflowctl <command>\n\
    Commands:\n\
    - submit-render <template.pptx> <params.json> [client_uid]\n\
    - submit-snapshot <document> [client_uid]\n\
    - wait <render|snapshot> <client_uid> [timeout_secs]\n\
    - show <job_id>\n\
    - results <job_id> <out_dir>\n\
    - counts\n\
    - reset\n\
    \n\
    Uses DATABASE_URL and DECKFLOW_REDIS_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    deckflow::telemetry::init(cfg.log_json);

    let pool = db::make_pool(&cfg).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }
    let repo = JobsRepo::new(pool.clone());

    match args[1].as_str() {
        "submit-render" => {
            let (Some(template), Some(params)) = (args.get(2), args.get(3)) else {
                usage_exit("submit-render <template.pptx> <params.json> [client_uid]");
            };
            let params: Value = serde_json::from_slice(&tokio::fs::read(params).await?)?;
            let client = args.get(4).cloned().unwrap_or_else(|| "cli".to_string());
            let id = submit_file(&cfg, &repo, Pipeline::Render, template, params, client).await?;
            println!("submitted render job id={id}");
        }
        "submit-snapshot" => {
            let Some(document) = args.get(2) else {
                usage_exit("submit-snapshot <document> [client_uid]");
            };
            let client = args.get(3).cloned().unwrap_or_else(|| "cli".to_string());
            let id = submit_file(
                &cfg,
                &repo,
                Pipeline::Snapshot,
                document,
                Value::Object(Default::default()),
                client,
            )
            .await?;
            println!("submitted snapshot job id={id}");
        }
        "wait" => {
            let (Some(kind), Some(client)) = (args.get(2), args.get(3)) else {
                usage_exit("wait <render|snapshot> <client_uid> [timeout_secs]");
            };
            let Some(kind) = JobKind::parse(kind) else {
                usage_exit("wait <render|snapshot> <client_uid> [timeout_secs]");
            };
            let timeout: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(60);
            wait(&cfg, &repo, kind, client, Duration::from_secs(timeout)).await?;
        }
        "show" => {
            let Some(id) = args.get(2).and_then(|s| parse_job_id(s)) else {
                usage_exit("show <job_id>");
            };
            show(&repo, id).await?;
        }
        "results" => {
            let (Some(id), Some(out_dir)) = (args.get(2).and_then(|s| parse_job_id(s)), args.get(3))
            else {
                usage_exit("results <job_id> <out_dir>");
            };
            write_results(&repo, id, Path::new(out_dir)).await?;
        }
        "counts" => {
            for c in repo.status_counts().await? {
                println!("{:<10} {:<10} {}", c.kind, c.status, c.count);
            }
        }
        "reset" => reset(&pool).await?,
        other => {
            eprintln!("Unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn usage_exit(usage: &str) -> ! {
    eprintln!("usage: deckflowctl {usage}");
    std::process::exit(2);
}

async fn submit_file(
    cfg: &Config,
    repo: &JobsRepo,
    pipeline: Pipeline,
    path: &str,
    params: Value,
    client_uid: String,
) -> anyhow::Result<i64> {
    let payload = tokio::fs::read(path).await?;
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let broker = RedisConnector::new(&cfg.redis_url)?.connect().await?;
    submit(
        repo,
        broker.as_ref(),
        Submission {
            pipeline,
            client_uid,
            name,
            params,
            reference: None,
            payload,
        },
        cfg.max_payload_bytes,
    )
    .await
}

async fn wait(
    cfg: &Config,
    repo: &JobsRepo,
    kind: JobKind,
    client_uid: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let broker = RedisConnector::new(&cfg.redis_url)?.connect().await?;
    let queue = response_queue(kind, client_uid);
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        let Some((_, raw)) = broker.pop(&[queue.clone()], cfg.poll_timeout()).await? else {
            continue;
        };
        let Some(id) = parse_job_id(&raw) else {
            eprintln!("ignoring invalid value on {queue}: {raw:?}");
            continue;
        };
        return show(repo, id).await;
    }

    println!("no response on {queue} within {}s", timeout.as_secs());
    Ok(())
}

async fn show(repo: &JobsRepo, id: i64) -> anyhow::Result<()> {
    let Some(job) = repo.get(id).await? else {
        println!("job {id} not found");
        return Ok(());
    };

    println!(
        "JOB: id={} kind={} client={} name={} status={} attempt={} child={:?} code={:?} message={:?} updated_at={}",
        job.id,
        job.kind,
        job.client_uid,
        job.name,
        job.status,
        job.attempt_count,
        job.child_job_id,
        job.error_code,
        job.status_message,
        job.updated_at.to_rfc3339()
    );

    for item in repo.results(id).await? {
        println!("  result position={} bytes={}", item.position, item.content.len());
    }
    Ok(())
}

async fn write_results(repo: &JobsRepo, id: i64, out_dir: &Path) -> anyhow::Result<()> {
    let items = repo.results(id).await?;
    if items.is_empty() {
        println!("job {id} has no results");
        return Ok(());
    }

    tokio::fs::create_dir_all(out_dir).await?;
    for item in items {
        let path = out_dir.join(format!("{id}-{:03}.bin", item.position));
        tokio::fs::write(&path, &item.content).await?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            job_results,
            jobs
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}
