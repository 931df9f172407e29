//! Enqueue side: payload serialization plus shard routing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::queue::model::{EnqueueParams, EnqueueResult, NewTask, QueueLocation};
use crate::queue::payload::PayloadTransformer;
use crate::storage::QueueShard;

#[async_trait]
pub trait QueueProducer<T: Send + Sync + 'static>: Send + Sync {
    async fn enqueue(&self, params: EnqueueParams<T>) -> Result<EnqueueResult>;
}

/// Picks the shard that receives one enqueue.
pub trait QueueShardRouter<T>: Send + Sync {
    fn resolve_shard(&self, params: &EnqueueParams<T>) -> &QueueShard;
}

#[derive(Debug, Clone)]
pub struct SingleShardRouter {
    shard: QueueShard,
}

impl SingleShardRouter {
    pub fn new(shard: QueueShard) -> Self {
        Self { shard }
    }
}

impl<T> QueueShardRouter<T> for SingleShardRouter {
    fn resolve_shard(&self, _params: &EnqueueParams<T>) -> &QueueShard {
        &self.shard
    }
}

#[derive(Debug)]
pub struct RoundRobinShardRouter {
    shards: Vec<QueueShard>,
    next: AtomicUsize,
}

impl RoundRobinShardRouter {
    pub fn new(shards: Vec<QueueShard>) -> Result<Self> {
        if shards.is_empty() {
            return Err(QueueError::InvalidSettings(
                "round robin router needs at least one shard".to_string(),
            ));
        }
        Ok(Self {
            shards,
            next: AtomicUsize::new(0),
        })
    }
}

impl<T> QueueShardRouter<T> for RoundRobinShardRouter {
    fn resolve_shard(&self, _params: &EnqueueParams<T>) -> &QueueShard {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        &self.shards[idx]
    }
}

/// Serializes the payload, routes to a shard and inserts in its own
/// transaction.
pub struct ShardingQueueProducer<T> {
    location: QueueLocation,
    transformer: Arc<dyn PayloadTransformer<T>>,
    router: Arc<dyn QueueShardRouter<T>>,
}

impl<T> ShardingQueueProducer<T> {
    pub fn new(
        location: QueueLocation,
        transformer: Arc<dyn PayloadTransformer<T>>,
        router: Arc<dyn QueueShardRouter<T>>,
    ) -> Self {
        Self {
            location,
            transformer,
            router,
        }
    }

    pub fn location(&self) -> &QueueLocation {
        &self.location
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> QueueProducer<T> for ShardingQueueProducer<T> {
    async fn enqueue(&self, params: EnqueueParams<T>) -> Result<EnqueueResult> {
        let task = NewTask {
            payload: self.transformer.from_object(params.payload.as_ref())?,
            execution_delay: params.execution_delay,
            ext_data: params.ext_data.clone(),
        };
        let shard = self.router.resolve_shard(&params);

        let mut tx = shard.begin().await?;
        let enqueue_id = tx.enqueue_task(&self.location, &task).await?;
        tx.commit().await?;

        tracing::debug!(
            queue_id = %self.location.queue_id(),
            shard_id = %shard.id(),
            task_id = enqueue_id,
            delay_ms = task.execution_delay.as_millis() as u64,
            "task enqueued"
        );
        Ok(EnqueueResult {
            shard_id: shard.id().clone(),
            enqueue_id,
        })
    }
}
