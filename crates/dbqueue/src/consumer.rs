use async_trait::async_trait;

use crate::queue::model::{QueueLocation, Task, TaskExecutionResult};
use crate::queue::payload::PayloadTransformer;
use crate::queue::settings::SettingsHandle;

/// Static identity of a queue plus its live settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub location: QueueLocation,
    pub settings: SettingsHandle,
}

impl QueueConfig {
    pub fn new(location: QueueLocation, settings: SettingsHandle) -> Self {
        Self { location, settings }
    }
}

/// User-supplied processing logic of one queue.
///
/// `execute` returning `Err` counts as a crash: it is reported to the
/// task listener and the task is retried on its failure backoff.
#[async_trait]
pub trait QueueConsumer: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    fn queue_config(&self) -> &QueueConfig;

    fn payload_transformer(&self) -> &dyn PayloadTransformer<Self::Payload>;

    async fn execute(&self, task: Task<Self::Payload>) -> anyhow::Result<TaskExecutionResult>;
}
