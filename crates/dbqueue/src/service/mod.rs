//! Registry of queues and their per-shard worker pools.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::consumer::QueueConsumer;
use crate::error::{QueueError, Result};
use crate::listener::{
    LoggingTaskLifecycleListener, LoggingThreadLifecycleListener, TaskLifecycleListener,
    ThreadLifecycleListener,
};
use crate::queue::model::{QueueId, QueueShardId};
use crate::queue::settings::{ProcessingMode, QueueSettings, SettingsHandle};
use crate::runner::{build_runner, QueueTaskExecutor};
use crate::storage::QueueShard;

pub mod pool;
pub mod queue_loop;
pub mod time_limiter;

pub use pool::QueueExecutionPool;
pub use queue_loop::{QueueLoop, WaitInterrupt};
pub use time_limiter::TimeLimiter;

struct RegisteredQueue {
    settings: SettingsHandle,
    pools: BTreeMap<QueueShardId, Arc<QueueExecutionPool>>,
}

pub struct QueueService {
    shards: Vec<QueueShard>,
    task_listener: Arc<dyn TaskLifecycleListener>,
    thread_listener: Arc<dyn ThreadLifecycleListener>,
    queues: RwLock<BTreeMap<QueueId, RegisteredQueue>>,
}

impl QueueService {
    /// Every registered queue gets one pool per shard given here.
    pub fn new(shards: Vec<QueueShard>) -> Self {
        Self {
            shards,
            task_listener: Arc::new(LoggingTaskLifecycleListener),
            thread_listener: Arc::new(LoggingThreadLifecycleListener),
            queues: RwLock::new(BTreeMap::new()),
        }
    }

    /// Applies to queues registered afterwards.
    pub fn with_task_listener(mut self, listener: Arc<dyn TaskLifecycleListener>) -> Self {
        self.task_listener = listener;
        self
    }

    pub fn with_thread_listener(mut self, listener: Arc<dyn ThreadLifecycleListener>) -> Self {
        self.thread_listener = listener;
        self
    }

    /// `Ok(false)` for a duplicate queue id or a queue with no workers.
    pub fn register_queue<C: QueueConsumer>(&self, consumer: Arc<C>) -> Result<bool> {
        self.register(consumer, None)
    }

    pub fn register_queue_with_executor<C: QueueConsumer>(
        &self,
        consumer: Arc<C>,
        executor: Arc<dyn QueueTaskExecutor>,
    ) -> Result<bool> {
        self.register(consumer, Some(executor))
    }

    fn register<C: QueueConsumer>(
        &self,
        consumer: Arc<C>,
        executor: Option<Arc<dyn QueueTaskExecutor>>,
    ) -> Result<bool> {
        let config = consumer.queue_config();
        let queue_id = config.location.queue_id().clone();
        let settings = config.settings.load();
        settings.validate()?;

        let mut queues = self.queues.write();
        if queues.contains_key(&queue_id) {
            tracing::warn!(queue_id = %queue_id, "queue is already registered");
            return Ok(false);
        }
        if settings.processing.thread_count == 0 {
            tracing::warn!(queue_id = %queue_id, "queue has zero threads, not registering");
            return Ok(false);
        }
        if settings.processing.processing_mode == ProcessingMode::UseExternalExecutor
            && executor.is_none()
        {
            return Err(QueueError::MissingExecutor(queue_id));
        }

        let mut pools = BTreeMap::new();
        for shard in &self.shards {
            let factory_consumer = consumer.clone();
            let factory_shard = shard.clone();
            let task_listener = self.task_listener.clone();
            let executor = executor.clone();
            let pool = QueueExecutionPool::new(
                config.location.clone(),
                shard.id().clone(),
                config.settings.clone(),
                self.thread_listener.clone(),
                Box::new(move || {
                    build_runner(
                        &factory_consumer,
                        &factory_shard,
                        &task_listener,
                        executor.as_ref(),
                    )
                }),
            );
            pools.insert(shard.id().clone(), Arc::new(pool));
        }

        tracing::info!(
            queue_id = %queue_id,
            location = %config.location,
            shards = pools.len(),
            "queue registered"
        );
        queues.insert(
            queue_id,
            RegisteredQueue {
                settings: config.settings.clone(),
                pools,
            },
        );
        Ok(true)
    }

    pub fn registered_queues(&self) -> Vec<QueueId> {
        self.queues.read().keys().cloned().collect()
    }

    fn all_pools(&self) -> Vec<(QueueId, Arc<QueueExecutionPool>)> {
        self.queues
            .read()
            .iter()
            .flat_map(|(id, queue)| queue.pools.values().map(move |p| (id.clone(), p.clone())))
            .collect()
    }

    fn queue_pools(&self, queue_id: &QueueId) -> Result<Vec<Arc<QueueExecutionPool>>> {
        self.queues
            .read()
            .get(queue_id)
            .map(|queue| queue.pools.values().cloned().collect())
            .ok_or_else(|| QueueError::UnknownQueue(queue_id.clone()))
    }

    pub fn start(&self) -> Result<()> {
        for (_, pool) in self.all_pools() {
            pool.start()?;
        }
        Ok(())
    }

    pub fn start_queue(&self, queue_id: &QueueId) -> Result<()> {
        for pool in self.queue_pools(queue_id)? {
            pool.start()?;
        }
        Ok(())
    }

    pub fn pause(&self) {
        for (_, pool) in self.all_pools() {
            pool.pause();
        }
    }

    pub fn pause_queue(&self, queue_id: &QueueId) -> Result<()> {
        self.queue_pools(queue_id)?.iter().for_each(|p| p.pause());
        Ok(())
    }

    pub fn unpause(&self) {
        for (_, pool) in self.all_pools() {
            pool.unpause();
        }
    }

    pub fn unpause_queue(&self, queue_id: &QueueId) -> Result<()> {
        self.queue_pools(queue_id)?.iter().for_each(|p| p.unpause());
        Ok(())
    }

    /// Interrupts every worker; call [`Self::await_termination`] to drain.
    pub fn shutdown(&self) {
        for (_, pool) in self.all_pools() {
            pool.shutdown();
        }
    }

    pub fn shutdown_queue(&self, queue_id: &QueueId) -> Result<()> {
        self.queue_pools(queue_id)?.iter().for_each(|p| p.shutdown());
        Ok(())
    }

    /// True when every pool of every queue is paused.
    pub fn is_paused(&self) -> bool {
        self.all_pools().iter().all(|(_, p)| p.is_paused())
    }

    pub fn is_queue_paused(&self, queue_id: &QueueId) -> Result<bool> {
        Ok(self.queue_pools(queue_id)?.iter().all(|p| p.is_paused()))
    }

    pub fn is_shutdown(&self) -> bool {
        self.all_pools().iter().all(|(_, p)| p.is_shutdown())
    }

    pub fn is_queue_shutdown(&self, queue_id: &QueueId) -> Result<bool> {
        Ok(self.queue_pools(queue_id)?.iter().all(|p| p.is_shutdown()))
    }

    pub fn is_terminated(&self) -> bool {
        self.all_pools().iter().all(|(_, p)| p.is_terminated())
    }

    pub fn is_queue_terminated(&self, queue_id: &QueueId) -> Result<bool> {
        Ok(self.queue_pools(queue_id)?.iter().all(|p| p.is_terminated()))
    }

    /// Wait for every pool under one shared deadline. Returns the
    /// (queue, shard) pairs still running when the budget ran out.
    pub async fn await_termination(&self, timeout: Duration) -> Vec<(QueueId, QueueShardId)> {
        let mut limiter = TimeLimiter::new(timeout);
        let mut unterminated = Vec::new();
        for (queue_id, pool) in self.all_pools() {
            let terminated = limiter
                .execute(|left| pool.await_termination(left))
                .await
                .unwrap_or_else(|| pool.is_terminated());
            if !terminated {
                unterminated.push((queue_id, pool.shard_id().clone()));
            }
        }
        unterminated
    }

    pub async fn await_queue_termination(
        &self,
        queue_id: &QueueId,
        timeout: Duration,
    ) -> Result<Vec<QueueShardId>> {
        let mut limiter = TimeLimiter::new(timeout);
        let mut unterminated = Vec::new();
        for pool in self.queue_pools(queue_id)? {
            let terminated = limiter
                .execute(|left| pool.await_termination(left))
                .await
                .unwrap_or_else(|| pool.is_terminated());
            if !terminated {
                unterminated.push(pool.shard_id().clone());
            }
        }
        Ok(unterminated)
    }

    /// Cut the idle wait of one queue's workers on one shard, typically
    /// right after enqueueing there.
    pub fn wakeup(&self, queue_id: &QueueId, shard_id: &QueueShardId) -> Result<()> {
        let pool = {
            let queues = self.queues.read();
            let queue = queues
                .get(queue_id)
                .ok_or_else(|| QueueError::UnknownQueue(queue_id.clone()))?;
            queue
                .pools
                .get(shard_id)
                .cloned()
                .ok_or_else(|| QueueError::UnknownShard(shard_id.clone()))?
        };
        pool.wakeup();
        Ok(())
    }

    pub fn wakeup_queue(&self, queue_id: &QueueId) -> Result<()> {
        self.queue_pools(queue_id)?.iter().for_each(|p| p.wakeup());
        Ok(())
    }

    /// Replace the settings snapshot of a registered queue. Poll timeouts
    /// and retry policies apply from the next cycle; thread count and
    /// processing mode on the next start.
    pub fn update_queue_settings(&self, queue_id: &QueueId, settings: QueueSettings) -> Result<()> {
        settings.validate()?;
        let queues = self.queues.read();
        let queue = queues
            .get(queue_id)
            .ok_or_else(|| QueueError::UnknownQueue(queue_id.clone()))?;
        queue.settings.store(settings);
        tracing::info!(queue_id = %queue_id, "queue settings updated");
        Ok(())
    }
}
