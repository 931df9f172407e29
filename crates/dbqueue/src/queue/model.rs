use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::QueueError;

/// Logical queue name. Unique per registration inside one process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one physical database endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueShardId(String);

impl QueueShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a queue lives: the queue id plus the table holding its rows.
///
/// Several queues may share one table; rows are told apart by the
/// queue name column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueLocation {
    queue_id: QueueId,
    table_name: String,
    id_sequence: Option<String>,
}

impl QueueLocation {
    pub fn new(queue_id: QueueId, table_name: impl Into<String>) -> Self {
        Self {
            queue_id,
            table_name: crate::queue::schema::sanitize_table_name(&table_name.into()),
            id_sequence: None,
        }
    }

    /// Use an explicit sequence for generated ids instead of the column default.
    pub fn with_id_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.id_sequence = Some(crate::queue::schema::sanitize_table_name(&sequence.into()));
        self
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn id_sequence(&self) -> Option<&str> {
        self.id_sequence.as_deref()
    }
}

impl fmt::Display for QueueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.queue_id, self.table_name)
    }
}

/// Storage-level snapshot of a task row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: i64,
    pub payload: Option<String>,
    /// Failed attempts since the last reenqueue.
    pub attempt: i64,
    /// Explicit reenqueues. Never reset.
    pub reenqueue_attempt: i64,
    /// Every attempt of any kind. Never reset.
    pub total_attempt: i64,
    pub created_at: DateTime<Utc>,
    pub next_process_at: DateTime<Utc>,
    /// Extension columns keyed by column name.
    pub ext_data: HashMap<String, String>,
}

/// Typed view of a claimed task handed to the consumer.
#[derive(Debug, Clone)]
pub struct Task<T> {
    pub shard_id: QueueShardId,
    pub payload: Option<T>,
    pub attempts_count: i64,
    pub reenqueue_attempts_count: i64,
    pub total_attempts_count: i64,
    pub created_at: DateTime<Utc>,
    pub ext_data: HashMap<String, String>,
}

impl<T> Task<T> {
    pub fn from_record(shard_id: QueueShardId, payload: Option<T>, record: &TaskRecord) -> Self {
        Self {
            shard_id,
            payload,
            attempts_count: record.attempt,
            reenqueue_attempts_count: record.reenqueue_attempt,
            total_attempts_count: record.total_attempt,
            created_at: record.created_at,
            ext_data: record.ext_data.clone(),
        }
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn ext(&self, field: &str) -> Option<&str> {
        self.ext_data.get(field).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Delete the row.
    Finish,
    /// Reschedule with the reenqueue strategy or an explicit delay.
    Reenqueue,
    /// Leave the row as claimed; the failure backoff governs the retry.
    Fail,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Finish => "finish",
            ActionType::Reenqueue => "reenqueue",
            ActionType::Fail => "fail",
        }
    }
}

impl FromStr for ActionType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "finish" => Ok(ActionType::Finish),
            "reenqueue" => Ok(ActionType::Reenqueue),
            "fail" => Ok(ActionType::Fail),
            other => Err(QueueError::InvalidSettings(format!(
                "unknown task action type: {other}"
            ))),
        }
    }
}

/// Outcome declared by a consumer for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExecutionResult {
    action: ActionType,
    execution_delay: Option<Duration>,
}

impl TaskExecutionResult {
    pub fn finish() -> Self {
        Self {
            action: ActionType::Finish,
            execution_delay: None,
        }
    }

    pub fn fail() -> Self {
        Self {
            action: ActionType::Fail,
            execution_delay: None,
        }
    }

    /// Reenqueue with the delay computed by the queue's reenqueue strategy.
    pub fn reenqueue() -> Self {
        Self {
            action: ActionType::Reenqueue,
            execution_delay: None,
        }
    }

    pub fn reenqueue_with_delay(delay: Duration) -> Self {
        Self {
            action: ActionType::Reenqueue,
            execution_delay: Some(delay),
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.action
    }

    pub fn execution_delay(&self) -> Option<Duration> {
        self.execution_delay
    }
}

/// Two-valued status of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueProcessingStatus {
    /// A task was claimed, whether or not it succeeded.
    Processed,
    /// No eligible task.
    Skipped,
}

/// A row about to be inserted by a producer.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub payload: Option<String>,
    pub execution_delay: Duration,
    pub ext_data: HashMap<String, String>,
}

/// Producer-side request, before the payload is serialized.
#[derive(Debug, Clone)]
pub struct EnqueueParams<T> {
    pub payload: Option<T>,
    pub execution_delay: Duration,
    pub ext_data: HashMap<String, String>,
}

impl<T> EnqueueParams<T> {
    pub fn create(payload: T) -> Self {
        Self {
            payload: Some(payload),
            execution_delay: Duration::ZERO,
            ext_data: HashMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            payload: None,
            execution_delay: Duration::ZERO,
            ext_data: HashMap::new(),
        }
    }

    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn with_ext(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_data.insert(field.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub shard_id: QueueShardId,
    pub enqueue_id: i64,
}
