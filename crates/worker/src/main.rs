use dbqueue::api::{self, JsonProducer};
use dbqueue::config::Config;
use dbqueue::db;
use dbqueue::producer::{QueueShardRouter, RoundRobinShardRouter};
use dbqueue::queue::{JsonPayloadTransformer, QueueId, QueueShardId, QueueTableSchema};
use dbqueue::storage::PgQueueDatabase;
use dbqueue::{QueueService, QueueShard, ShardingQueueProducer};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod handlers;
use handlers::build_consumers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env()?;
    let api_addr = cfg.admin_addr.clone();

    tracing::info!(
        shards = cfg.all_shard_urls().len(),
        table = %cfg.table,
        threads = cfg.threads,
        api = api_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        shutdown_timeout_ms = cfg.shutdown_timeout.as_millis() as u64,
        "dbqueue worker starting"
    );

    let schema = QueueTableSchema::builder().extra_field("trace_id").build();
    let mut shards = Vec::new();
    for (i, url) in cfg.all_shard_urls().iter().enumerate() {
        // email workers plus the digest worker plus producers
        let pool = db::make_pool(url, cfg.threads + 1).await?;
        if cfg.migrate_on_startup {
            db::run_migrations(&pool).await?;
        }
        shards.push(QueueShard::new(
            QueueShardId::new(format!("shard-{i}")),
            Arc::new(PgQueueDatabase::with_schema(pool, schema.clone())),
        ));
    }

    let consumers = build_consumers(&cfg.table, cfg.threads);
    let service = Arc::new(QueueService::new(shards.clone()));
    service.register_queue(consumers.email.clone())?;
    service.register_queue(consumers.digest.clone())?;

    let router: Arc<dyn QueueShardRouter<Value>> = Arc::new(RoundRobinShardRouter::new(shards)?);
    let producers: HashMap<QueueId, JsonProducer> = consumers
        .locations()
        .into_iter()
        .map(|location| {
            let producer: JsonProducer = Arc::new(ShardingQueueProducer::new(
                location.clone(),
                Arc::new(JsonPayloadTransformer::<Value>::new()),
                router.clone(),
            ));
            (location.queue_id().clone(), producer)
        })
        .collect();

    service.start()?;

    // ---- API task ----
    let app = api::router(api::ApiState {
        service: service.clone(),
        producers: Arc::new(producers),
    });
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested");
        }
    }

    service.shutdown();
    let unterminated = service.await_termination(cfg.shutdown_timeout).await;
    if unterminated.is_empty() {
        tracing::info!("all queue pools terminated");
    } else {
        for (queue_id, shard_id) in &unterminated {
            tracing::warn!(%queue_id, %shard_id, "queue pool did not terminate in time");
        }
    }

    Ok(())
}
