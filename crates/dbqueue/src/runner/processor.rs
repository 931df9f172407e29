use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::consumer::QueueConsumer;
use crate::error::{panic_message, QueueError};
use crate::listener::TaskLifecycleListener;
use crate::queue::model::{Task, TaskRecord};
use crate::runner::result::TaskResultHandler;
use crate::storage::{QueueShard, QueueTransaction};

/// Turns a claimed row into a typed task, runs the consumer and applies
/// the outcome. Never fails: errors and panics are reported to the
/// listener as crashes and swallowed so the poll loop keeps going.
pub struct TaskProcessor<C: QueueConsumer> {
    consumer: Arc<C>,
    shard: QueueShard,
    listener: Arc<dyn TaskLifecycleListener>,
    result_handler: TaskResultHandler,
}

impl<C: QueueConsumer> TaskProcessor<C> {
    pub fn new(
        consumer: Arc<C>,
        shard: QueueShard,
        listener: Arc<dyn TaskLifecycleListener>,
    ) -> Self {
        let config = consumer.queue_config();
        let result_handler =
            TaskResultHandler::new(config.location.clone(), config.settings.clone());
        Self {
            consumer,
            shard,
            listener,
            result_handler,
        }
    }

    /// With `tx == None` the result is applied in a fresh transaction on
    /// the shard; otherwise it joins the caller's transaction.
    pub async fn process_task(&self, record: &TaskRecord, tx: Option<&mut dyn QueueTransaction>) {
        let location = &self.consumer.queue_config().location;
        let shard_id = self.shard.id();

        let scope = self.listener.started(shard_id, location, record);
        let outcome = AssertUnwindSafe(self.execute(record, tx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(QueueError::Panicked(panic_message(&*panic)).into()));
        if let Err(err) = outcome {
            self.listener.crashed(shard_id, location, record, &err);
        }
        self.listener.finished(shard_id, location, record, scope);
    }

    async fn execute(
        &self,
        record: &TaskRecord,
        tx: Option<&mut dyn QueueTransaction>,
    ) -> anyhow::Result<()> {
        let location = &self.consumer.queue_config().location;
        let payload = self
            .consumer
            .payload_transformer()
            .to_object(record.payload.as_deref())?;
        let task = Task::from_record(self.shard.id().clone(), payload, record);

        let started = Instant::now();
        let result = self.consumer.execute(task).await?;
        self.listener
            .executed(self.shard.id(), location, record, &result, started.elapsed());

        match tx {
            Some(tx) => {
                self.result_handler.handle_result(tx, record, &result).await?;
            }
            None => {
                let mut tx = self.shard.begin().await?;
                self.result_handler
                    .handle_result(&mut *tx, record, &result)
                    .await?;
                tx.commit().await?;
            }
        }
        Ok(())
    }
}
