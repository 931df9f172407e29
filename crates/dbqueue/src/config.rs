use std::time::Duration;

/// Process-level settings of a worker, loaded from the environment.
/// Per-queue tuning lives in [`crate::queue::settings::QueueSettings`].
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Additional shards beyond `database_url`, in order.
    pub shard_urls: Vec<String>,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub threads: u32,
    pub table: String,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let shard_urls = std::env::var("DBQUEUE_SHARDS")
            .map(|s| parse_list(&s))
            .unwrap_or_default();

        let admin_addr = env_or_fallback("DBQUEUE_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("DBQUEUE_MIGRATE_ON_STARTUP").unwrap_or(false);

        let threads = std::env::var("DBQUEUE_THREADS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(2)
            .clamp(1, 64);

        let table = std::env::var("DBQUEUE_TABLE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "queue_tasks".to_string());

        let shutdown_timeout = std::env::var("DBQUEUE_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10));

        Ok(Self {
            database_url,
            shard_urls,
            admin_addr,
            migrate_on_startup,
            threads,
            table,
            shutdown_timeout,
        })
    }

    /// `database_url` first, then the extra shards.
    pub fn all_shard_urls(&self) -> Vec<String> {
        std::iter::once(self.database_url.clone())
            .chain(self.shard_urls.iter().cloned())
            .collect()
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
