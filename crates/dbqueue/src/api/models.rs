use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::queue::model::{QueueId, QueueShardId};

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusItem {
    pub queue_id: QueueId,
    pub paused: bool,
    pub shutdown: bool,
    pub terminated: bool,
    pub accepts_tasks: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub payload: Option<Value>,
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub queue_id: QueueId,
    pub shard_id: QueueShardId,
    pub enqueue_id: i64,
    pub trace_id: String,
}
