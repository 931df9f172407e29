//! Shared fixtures for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::consumer::{QueueConfig, QueueConsumer};
use crate::listener::{TaskLifecycleListener, TaskScope};
use crate::queue::model::{
    NewTask, QueueId, QueueLocation, QueueShardId, Task, TaskExecutionResult, TaskRecord,
};
use crate::queue::payload::{PayloadTransformer, StringPayloadTransformer};
use crate::queue::settings::{QueueSettings, SettingsHandle};
use crate::storage::{MemoryQueueDatabase, QueueDatabase, QueueShard};

type Script = dyn Fn(&Task<String>) -> anyhow::Result<TaskExecutionResult> + Send + Sync;

/// Consumer whose outcome is decided by a closure; remembers every task it saw.
pub(crate) struct ScriptedConsumer {
    config: QueueConfig,
    script: Box<Script>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Task<String>>>,
}

impl ScriptedConsumer {
    pub(crate) fn new<F>(queue: &str, settings: QueueSettings, script: F) -> Arc<Self>
    where
        F: Fn(&Task<String>) -> anyhow::Result<TaskExecutionResult> + Send + Sync + 'static,
    {
        Arc::new(Self {
            config: QueueConfig::new(location(queue), SettingsHandle::new(settings)),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn finishing(queue: &str, settings: QueueSettings) -> Arc<Self> {
        Self::new(queue, settings, |_| Ok(TaskExecutionResult::finish()))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<Task<String>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl QueueConsumer for ScriptedConsumer {
    type Payload = String;

    fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    fn payload_transformer(&self) -> &dyn PayloadTransformer<String> {
        &StringPayloadTransformer
    }

    async fn execute(&self, task: Task<String>) -> anyhow::Result<TaskExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.script)(&task);
        self.seen.lock().push(task);
        outcome
    }
}

/// Task events flattened to strings, e.g. `picked:3` or `crashed:3`.
#[derive(Default)]
pub(crate) struct RecordingTaskListener {
    events: Mutex<Vec<String>>,
}

impl RecordingTaskListener {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: &str, record: &TaskRecord) {
        self.events.lock().push(format!("{event}:{}", record.id));
    }
}

impl TaskLifecycleListener for RecordingTaskListener {
    fn picked(
        &self,
        _: &QueueShardId,
        _: &QueueLocation,
        record: &TaskRecord,
        _: std::time::Duration,
    ) {
        self.push("picked", record);
    }

    fn started(&self, _: &QueueShardId, _: &QueueLocation, record: &TaskRecord) -> Option<TaskScope> {
        self.push("started", record);
        None
    }

    fn executed(
        &self,
        _: &QueueShardId,
        _: &QueueLocation,
        record: &TaskRecord,
        _: &TaskExecutionResult,
        _: std::time::Duration,
    ) {
        self.push("executed", record);
    }

    fn finished(
        &self,
        _: &QueueShardId,
        _: &QueueLocation,
        record: &TaskRecord,
        _: Option<TaskScope>,
    ) {
        self.push("finished", record);
    }

    fn crashed(&self, _: &QueueShardId, _: &QueueLocation, record: &TaskRecord, _: &anyhow::Error) {
        self.push("crashed", record);
    }
}

pub(crate) fn location(queue: &str) -> QueueLocation {
    QueueLocation::new(QueueId::new(queue), "queue_tasks")
}

pub(crate) fn memory_shard(id: &str, db: &MemoryQueueDatabase) -> QueueShard {
    QueueShard::new(QueueShardId::new(id), Arc::new(db.clone()))
}

pub(crate) async fn enqueue(db: &MemoryQueueDatabase, queue: &str, payload: &str) -> i64 {
    let mut tx = db.begin().await.unwrap();
    let id = tx
        .enqueue_task(
            &location(queue),
            &NewTask {
                payload: Some(payload.to_string()),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
    id
}
