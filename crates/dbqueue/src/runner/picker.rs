use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::listener::TaskLifecycleListener;
use crate::queue::model::{QueueLocation, QueueShardId, TaskRecord};
use crate::queue::settings::SettingsHandle;
use crate::storage::QueueTransaction;

/// Runs the claim protocol and reports what it got.
pub struct TaskPicker {
    shard_id: QueueShardId,
    location: QueueLocation,
    settings: SettingsHandle,
    listener: Arc<dyn TaskLifecycleListener>,
}

impl TaskPicker {
    pub fn new(
        shard_id: QueueShardId,
        location: QueueLocation,
        settings: SettingsHandle,
        listener: Arc<dyn TaskLifecycleListener>,
    ) -> Self {
        Self {
            shard_id,
            location,
            settings,
            listener,
        }
    }

    /// Storage errors go straight back to the caller; there is no local retry.
    pub async fn pick_task(&self, tx: &mut dyn QueueTransaction) -> Result<Option<TaskRecord>> {
        let settings = self.settings.load();
        let started = Instant::now();
        let record = tx.pick_task(&self.location, &settings.failure).await?;
        if let Some(record) = &record {
            self.listener
                .picked(&self.shard_id, &self.location, record, started.elapsed());
        }
        Ok(record)
    }
}
