//! Storage seam: one [`QueueDatabase`] per shard, one
//! [`QueueTransaction`] per unit of work.
//!
//! The claim protocol lives in [`QueueTransaction::pick_task`]: it must
//! lock one due row, skip rows locked by other transactions, advance the
//! attempt counters and the next processing time, and return the updated
//! row. Two concurrent transactions must never return the same id.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::queue::model::{NewTask, QueueLocation, QueueShardId, TaskRecord};
use crate::queue::settings::FailureSettings;

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueueDatabase;
pub use postgres::PgQueueDatabase;

#[async_trait]
pub trait QueueTransaction: Send {
    /// Claim one due task of `location`, or `None` when nothing is eligible.
    async fn pick_task(
        &mut self,
        location: &QueueLocation,
        failure: &FailureSettings,
    ) -> Result<Option<TaskRecord>>;

    async fn enqueue_task(&mut self, location: &QueueLocation, task: &NewTask) -> Result<i64>;

    /// Returns `false` when the row was already gone.
    async fn delete_task(&mut self, location: &QueueLocation, task_id: i64) -> Result<bool>;

    /// Reset `attempt`, bump `reenqueue_attempt`, schedule `now + delay`.
    async fn reenqueue_task(
        &mut self,
        location: &QueueLocation,
        task_id: i64,
        delay: Duration,
    ) -> Result<bool>;

    async fn commit(&mut self) -> Result<()>;

    /// Dropping an open transaction rolls it back as well.
    async fn rollback(&mut self) -> Result<()>;
}

#[async_trait]
pub trait QueueDatabase: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>>;
}

/// One physical database endpoint a queue may run against.
#[derive(Clone)]
pub struct QueueShard {
    id: QueueShardId,
    database: Arc<dyn QueueDatabase>,
}

impl QueueShard {
    pub fn new(id: QueueShardId, database: Arc<dyn QueueDatabase>) -> Self {
        Self { id, database }
    }

    pub fn id(&self) -> &QueueShardId {
        &self.id
    }

    pub fn database(&self) -> &Arc<dyn QueueDatabase> {
        &self.database
    }

    pub async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        self.database.begin().await
    }
}

impl fmt::Debug for QueueShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueShard").field("id", &self.id).finish()
    }
}
