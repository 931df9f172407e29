use std::any::Any;
use thiserror::Error;

use crate::queue::model::{QueueId, QueueShardId};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("queue is not registered: queue_id={0}")]
    UnknownQueue(QueueId),

    #[error("shard is not registered: shard_id={0}")]
    UnknownShard(QueueShardId),

    #[error("queue_id={0} uses processing mode use_external_executor but no executor was supplied")]
    MissingExecutor(QueueId),

    #[error(
        "reenqueue retry type is manual but no execution delay was supplied: task_id={task_id}, reenqueue_attempt={reenqueue_attempt}"
    )]
    ManualReenqueueWithoutDelay { task_id: i64, reenqueue_attempt: i64 },

    #[error("invalid queue settings: {0}")]
    InvalidSettings(String),

    #[error("task row is locked by another transaction: task_id={0}")]
    RowLocked(i64),

    #[error("transaction is already closed")]
    TransactionClosed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
