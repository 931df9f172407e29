use crate::error::Result;
use crate::queue::model::{ActionType, QueueLocation, TaskExecutionResult, TaskRecord};
use crate::queue::reenqueue::reenqueue_strategy;
use crate::queue::settings::SettingsHandle;
use crate::storage::QueueTransaction;

/// Applies the consumer's declared outcome to storage.
#[derive(Debug, Clone)]
pub struct TaskResultHandler {
    location: QueueLocation,
    settings: SettingsHandle,
}

impl TaskResultHandler {
    pub fn new(location: QueueLocation, settings: SettingsHandle) -> Self {
        Self { location, settings }
    }

    pub async fn handle_result(
        &self,
        tx: &mut dyn QueueTransaction,
        record: &TaskRecord,
        result: &TaskExecutionResult,
    ) -> Result<()> {
        match result.action_type() {
            ActionType::Finish => {
                if !tx.delete_task(&self.location, record.id).await? {
                    tracing::debug!(task_id = record.id, "finished task was already gone");
                }
            }
            ActionType::Reenqueue => {
                let delay = match result.execution_delay() {
                    Some(delay) => delay,
                    // rebuilt per call so new settings apply to the next calculation
                    None => reenqueue_strategy(&self.settings.load().reenqueue)?
                        .calculate_delay(record)?,
                };
                tx.reenqueue_task(&self.location, record.id, delay).await?;
            }
            // claim already advanced attempt and set the failure backoff
            ActionType::Fail => {}
        }
        Ok(())
    }
}
