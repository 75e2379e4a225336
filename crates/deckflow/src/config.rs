use std::time::Duration;

// Runtime configuration for every deckflow process (workers, pipeline, ctl).
// Values come from environment variables; a .env file is honoured.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub db_disable_jit: bool,
    pub redis_url: String,
    pub worker_id: String,

    /// Bounded BLPOP wait. Clamped to 5..=10 seconds.
    pub poll_timeout_secs: u64,
    /// Number of attempts a top-level job gets before it is failed for good.
    pub retry_bound: i32,
    /// client_uid the pipeline uses for the stage jobs it spawns.
    pub pipeline_client: String,

    pub lease_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub stale_after_secs: i64,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub max_payload_bytes: usize,
    pub log_json: bool,

    pub capture_cmd: Option<String>,
    pub duplicate_cmd: Option<String>,
    pub compose_cmd: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        // single-threaded roles need very few connections each
        let db_max_connections = env_parse::<u32>("DECKFLOW_DB_MAX_CONNECTIONS")
            .unwrap_or(4)
            .clamp(1, 32);
        let db_acquire_timeout_secs = env_parse::<u64>("DECKFLOW_DB_ACQUIRE_TIMEOUT_SECS")
            .unwrap_or(10)
            .clamp(1, 60);
        let db_disable_jit = env_bool("DECKFLOW_DISABLE_JIT").unwrap_or(true);

        let redis_url = env_or_fallback("DECKFLOW_REDIS_URL", "REDIS_URL")
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let worker_id = env_or_fallback("DECKFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let poll_timeout_secs = clamp_poll_timeout(
            env_parse("DECKFLOW_POLL_TIMEOUT_SECS").unwrap_or(5),
        );

        let retry_bound = env_parse::<i32>("DECKFLOW_RETRY_BOUND")
            .unwrap_or(5)
            .max(1);

        let pipeline_client = env_or_fallback("DECKFLOW_PIPELINE_CLIENT", "PIPELINE_CLIENT")
            .unwrap_or_else(|| "pipeline".to_string());

        let lease_ttl_secs = env_parse::<u64>("DECKFLOW_LEASE_TTL_SECS")
            .unwrap_or(30)
            .max(3);
        let sweep_interval_secs = env_parse("DECKFLOW_SWEEP_INTERVAL_SECS").unwrap_or(60);
        let stale_after_secs = env_parse("DECKFLOW_STALE_AFTER_SECS").unwrap_or(600);

        let admin_addr = env_or_fallback("DECKFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("DECKFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let max_payload_bytes = env_or_fallback("DECKFLOW_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(64 * 1024 * 1024);

        let log_json = env_bool("DECKFLOW_LOG_JSON").unwrap_or(false);

        Ok(Self {
            database_url,
            db_max_connections,
            db_acquire_timeout_secs,
            db_disable_jit,
            redis_url,
            worker_id,
            poll_timeout_secs,
            retry_bound,
            pipeline_client,
            lease_ttl_secs,
            sweep_interval_secs,
            stale_after_secs,
            admin_addr,
            migrate_on_startup,
            max_payload_bytes,
            log_json,
            capture_cmd: env_nonempty("DECKFLOW_CAPTURE_CMD"),
            duplicate_cmd: env_nonempty("DECKFLOW_DUPLICATE_CMD"),
            compose_cmd: env_nonempty("DECKFLOW_COMPOSE_CMD"),
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs.max(1) as u64)
    }
}

pub fn clamp_poll_timeout(secs: u64) -> u64 {
    secs.clamp(5, 10)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|s| s.trim().parse().ok())
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    env_nonempty(primary).or_else(|| env_nonempty(fallback))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
