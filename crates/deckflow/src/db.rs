use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::Config;

/// Pool for one deckflow process. Connections are tagged with the worker id
/// so `pg_stat_activity` shows which worker holds them.
pub async fn make_pool(cfg: &Config) -> anyhow::Result<PgPool> {
    let connect = PgConnectOptions::from_str(&cfg.database_url)?.application_name(&cfg.worker_id);
    let disable_jit = cfg.db_disable_jit;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_secs(cfg.db_acquire_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(connect)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
