use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// One pool per shard. Sized from the env so every worker of every queue
/// on the shard can hold a transaction at once.
pub async fn make_pool(database_url: &str, workers: u32) -> anyhow::Result<PgPool> {
    let max_connections = std::env::var("DBQUEUE_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(workers + 2)
        .clamp(1, 64);

    let acquire_timeout_secs = std::env::var("DBQUEUE_DB_ACQUIRE_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10)
        .clamp(1, 60);

    let disable_jit = std::env::var("DBQUEUE_DISABLE_JIT")
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(true);

    let mut opts = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs));

    // the claim statement is short; planning it with jit costs more than it runs
    opts = opts.after_connect(move |conn, _meta| {
        Box::pin(async move {
            if disable_jit {
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
            }
            Ok(())
        })
    });

    let pool = opts.connect(database_url).await?;
    tracing::info!(max_connections, "database pool ready");

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
