//! One poll cycle: claim, process, apply the result.
//!
//! The transaction boundary is picked once per worker from the queue's
//! [`ProcessingMode`] by [`build_runner`].

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::consumer::QueueConsumer;
use crate::error::{QueueError, Result};
use crate::listener::TaskLifecycleListener;
use crate::queue::model::QueueProcessingStatus;
use crate::queue::settings::ProcessingMode;
use crate::storage::QueueShard;

pub mod picker;
pub mod processor;
pub mod result;

pub use picker::TaskPicker;
pub use processor::TaskProcessor;
pub use result::TaskResultHandler;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[async_trait]
pub trait QueueRunner: Send + Sync {
    async fn run_queue(&self) -> Result<QueueProcessingStatus>;
}

/// Caller-supplied execution context for [`ProcessingMode::UseExternalExecutor`].
pub trait QueueTaskExecutor: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

impl QueueTaskExecutor for tokio::runtime::Handle {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(tokio::runtime::Handle::spawn(self, task));
    }
}

/// Claim and processing commit independently. A crash between the two
/// leaves the task claimed until its failure backoff passes.
pub struct SeparateTransactionsRunner<C: QueueConsumer> {
    shard: QueueShard,
    picker: TaskPicker,
    processor: TaskProcessor<C>,
}

#[async_trait]
impl<C: QueueConsumer> QueueRunner for SeparateTransactionsRunner<C> {
    async fn run_queue(&self) -> Result<QueueProcessingStatus> {
        let mut tx = self.shard.begin().await?;
        let record = self.picker.pick_task(&mut *tx).await?;
        tx.commit().await?;

        let Some(record) = record else {
            return Ok(QueueProcessingStatus::Skipped);
        };
        self.processor.process_task(&record, None).await;
        Ok(QueueProcessingStatus::Processed)
    }
}

/// Claim, execution and result share one transaction. Anything escaping
/// the cycle rolls back the claim's counter advance as well.
pub struct WrapInTransactionRunner<C: QueueConsumer> {
    shard: QueueShard,
    picker: TaskPicker,
    processor: TaskProcessor<C>,
}

#[async_trait]
impl<C: QueueConsumer> QueueRunner for WrapInTransactionRunner<C> {
    async fn run_queue(&self) -> Result<QueueProcessingStatus> {
        let mut tx = self.shard.begin().await?;
        let Some(record) = self.picker.pick_task(&mut *tx).await? else {
            tx.commit().await?;
            return Ok(QueueProcessingStatus::Skipped);
        };
        self.processor.process_task(&record, Some(&mut *tx)).await;
        tx.commit().await?;
        Ok(QueueProcessingStatus::Processed)
    }
}

/// Claims inline, hands processing to the executor and returns without
/// waiting for it.
pub struct ExternalExecutorRunner<C: QueueConsumer> {
    shard: QueueShard,
    picker: TaskPicker,
    processor: Arc<TaskProcessor<C>>,
    executor: Arc<dyn QueueTaskExecutor>,
}

#[async_trait]
impl<C: QueueConsumer> QueueRunner for ExternalExecutorRunner<C> {
    async fn run_queue(&self) -> Result<QueueProcessingStatus> {
        let mut tx = self.shard.begin().await?;
        let record = self.picker.pick_task(&mut *tx).await?;
        tx.commit().await?;

        let Some(record) = record else {
            return Ok(QueueProcessingStatus::Skipped);
        };
        let processor = self.processor.clone();
        self.executor.spawn(Box::pin(async move {
            processor.process_task(&record, None).await;
        }));
        Ok(QueueProcessingStatus::Processed)
    }
}

/// Build the runner matching the queue's current processing mode.
pub fn build_runner<C: QueueConsumer>(
    consumer: &Arc<C>,
    shard: &QueueShard,
    listener: &Arc<dyn TaskLifecycleListener>,
    executor: Option<&Arc<dyn QueueTaskExecutor>>,
) -> Result<Arc<dyn QueueRunner>> {
    let config = consumer.queue_config();
    let mode = config.settings.load().processing.processing_mode;
    let picker = TaskPicker::new(
        shard.id().clone(),
        config.location.clone(),
        config.settings.clone(),
        listener.clone(),
    );
    let processor = TaskProcessor::new(consumer.clone(), shard.clone(), listener.clone());

    let runner: Arc<dyn QueueRunner> = match mode {
        ProcessingMode::SeparateTransactions => Arc::new(SeparateTransactionsRunner {
            shard: shard.clone(),
            picker,
            processor,
        }),
        ProcessingMode::WrapInTransaction => Arc::new(WrapInTransactionRunner {
            shard: shard.clone(),
            picker,
            processor,
        }),
        ProcessingMode::UseExternalExecutor => {
            let executor = executor
                .cloned()
                .ok_or_else(|| QueueError::MissingExecutor(config.location.queue_id().clone()))?;
            Arc::new(ExternalExecutorRunner {
                shard: shard.clone(),
                picker,
                processor: Arc::new(processor),
                executor,
            })
        }
    };
    Ok(runner)
}
