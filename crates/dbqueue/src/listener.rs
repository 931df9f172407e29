//! Lifecycle callbacks. Tracing, logging and metrics attach here.
//!
//! Callbacks run on the worker that owns the task and must return
//! promptly; a blocking listener stalls the poll loop.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueError;
use crate::queue::model::{QueueLocation, QueueShardId, TaskExecutionResult, TaskRecord};

/// Per-task state a listener wants back in [`TaskLifecycleListener::finished`],
/// e.g. an entered tracing span.
pub type TaskScope = Box<dyn Any + Send>;

#[allow(unused_variables)]
pub trait TaskLifecycleListener: Send + Sync {
    fn picked(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        pick_time: Duration,
    ) {
    }

    fn started(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
    ) -> Option<TaskScope> {
        None
    }

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        result: &TaskExecutionResult,
        process_time: Duration,
    ) {
    }

    /// Always called once per started task, after success or crash.
    fn finished(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        scope: Option<TaskScope>,
    ) {
    }

    fn crashed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        error: &anyhow::Error,
    ) {
    }
}

#[allow(unused_variables)]
pub trait ThreadLifecycleListener: Send + Sync {
    fn started(&self, shard_id: &QueueShardId, location: &QueueLocation) {}

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        task_processed: bool,
        elapsed: Duration,
    ) {
    }

    fn finished(&self, shard_id: &QueueShardId, location: &QueueLocation) {}

    fn crashed(&self, shard_id: &QueueShardId, location: &QueueLocation, error: &QueueError) {}
}

/// Logs task events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTaskLifecycleListener;

impl TaskLifecycleListener for LoggingTaskLifecycleListener {
    fn picked(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        pick_time: Duration,
    ) {
        tracing::debug!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            task_id = record.id,
            pick_ms = pick_time.as_millis() as u64,
            "task picked"
        );
    }

    fn started(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
    ) -> Option<TaskScope> {
        tracing::debug!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            task_id = record.id,
            attempt = record.attempt,
            reenqueue_attempt = record.reenqueue_attempt,
            total_attempt = record.total_attempt,
            trace_id = record.ext_data.get("trace_id").map(String::as_str).unwrap_or("-"),
            "task started"
        );
        None
    }

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        result: &TaskExecutionResult,
        process_time: Duration,
    ) {
        tracing::info!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            task_id = record.id,
            attempt = record.attempt,
            action = result.action_type().as_str(),
            delay_ms = result.execution_delay().map(|d| d.as_millis() as u64),
            elapsed_ms = process_time.as_millis() as u64,
            "task executed"
        );
    }

    fn crashed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        error: &anyhow::Error,
    ) {
        tracing::error!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            task_id = record.id,
            attempt = record.attempt,
            error = %format!("{error:#}"),
            "task crashed"
        );
    }

    fn finished(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        _scope: Option<TaskScope>,
    ) {
        tracing::debug!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            task_id = record.id,
            "task finished"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingThreadLifecycleListener;

impl ThreadLifecycleListener for LoggingThreadLifecycleListener {
    fn started(&self, shard_id: &QueueShardId, location: &QueueLocation) {
        tracing::debug!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            "poll cycle started"
        );
    }

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        task_processed: bool,
        elapsed: Duration,
    ) {
        tracing::debug!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            task_processed,
            elapsed_ms = elapsed.as_millis() as u64,
            "poll cycle executed"
        );
    }

    fn finished(&self, shard_id: &QueueShardId, location: &QueueLocation) {
        tracing::debug!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            "poll cycle finished"
        );
    }

    fn crashed(&self, shard_id: &QueueShardId, location: &QueueLocation, error: &QueueError) {
        tracing::error!(
            queue_id = %location.queue_id(),
            shard_id = %shard_id,
            error = %error,
            "poll cycle crashed, backing off"
        );
    }
}

/// Fans task events out to several listeners.
///
/// `finished` runs in reverse registration order so nested scopes unwind
/// like a stack.
#[derive(Clone, Default)]
pub struct CompositeTaskLifecycleListener {
    listeners: Vec<Arc<dyn TaskLifecycleListener>>,
}

impl CompositeTaskLifecycleListener {
    pub fn new(listeners: Vec<Arc<dyn TaskLifecycleListener>>) -> Self {
        Self { listeners }
    }
}

impl TaskLifecycleListener for CompositeTaskLifecycleListener {
    fn picked(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        pick_time: Duration,
    ) {
        for l in &self.listeners {
            l.picked(shard_id, location, record, pick_time);
        }
    }

    fn started(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
    ) -> Option<TaskScope> {
        let scopes: Vec<Option<TaskScope>> = self
            .listeners
            .iter()
            .map(|l| l.started(shard_id, location, record))
            .collect();
        Some(Box::new(scopes))
    }

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        result: &TaskExecutionResult,
        process_time: Duration,
    ) {
        for l in &self.listeners {
            l.executed(shard_id, location, record, result, process_time);
        }
    }

    fn finished(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        scope: Option<TaskScope>,
    ) {
        let mut scopes = scope
            .and_then(|s| s.downcast::<Vec<Option<TaskScope>>>().ok())
            .map(|s| *s)
            .unwrap_or_default();
        scopes.resize_with(self.listeners.len(), || None);
        for (l, s) in self.listeners.iter().zip(scopes).rev() {
            l.finished(shard_id, location, record, s);
        }
    }

    fn crashed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        record: &TaskRecord,
        error: &anyhow::Error,
    ) {
        for l in &self.listeners {
            l.crashed(shard_id, location, record, error);
        }
    }
}

#[derive(Clone, Default)]
pub struct CompositeThreadLifecycleListener {
    listeners: Vec<Arc<dyn ThreadLifecycleListener>>,
}

impl CompositeThreadLifecycleListener {
    pub fn new(listeners: Vec<Arc<dyn ThreadLifecycleListener>>) -> Self {
        Self { listeners }
    }
}

impl ThreadLifecycleListener for CompositeThreadLifecycleListener {
    fn started(&self, shard_id: &QueueShardId, location: &QueueLocation) {
        for l in &self.listeners {
            l.started(shard_id, location);
        }
    }

    fn executed(
        &self,
        shard_id: &QueueShardId,
        location: &QueueLocation,
        task_processed: bool,
        elapsed: Duration,
    ) {
        for l in &self.listeners {
            l.executed(shard_id, location, task_processed, elapsed);
        }
    }

    fn finished(&self, shard_id: &QueueShardId, location: &QueueLocation) {
        for l in self.listeners.iter().rev() {
            l.finished(shard_id, location);
        }
    }

    fn crashed(&self, shard_id: &QueueShardId, location: &QueueLocation, error: &QueueError) {
        for l in &self.listeners {
            l.crashed(shard_id, location, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::QueueId;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fmt;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Collects the message of every event emitted while installed.
    #[derive(Clone, Default)]
    struct MessageLog(Arc<Mutex<Vec<String>>>);

    struct MessageVisitor(Option<String>);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for MessageLog {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(None);
            event.record(&mut visitor);
            if let Some(message) = visitor.0 {
                self.0.lock().push(message);
            }
        }
    }

    fn record(id: i64) -> TaskRecord {
        TaskRecord {
            id,
            payload: None,
            attempt: 1,
            reenqueue_attempt: 0,
            total_attempt: 1,
            created_at: Utc::now(),
            next_process_at: Utc::now(),
            ext_data: HashMap::new(),
        }
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TaskLifecycleListener for Recording {
        fn started(&self, _: &QueueShardId, _: &QueueLocation, r: &TaskRecord) -> Option<TaskScope> {
            self.log.lock().push(format!("{}:started", self.name));
            Some(Box::new(format!("{}-scope-{}", self.name, r.id)))
        }

        fn finished(
            &self,
            _: &QueueShardId,
            _: &QueueLocation,
            _: &TaskRecord,
            scope: Option<TaskScope>,
        ) {
            let scope = scope
                .and_then(|s| s.downcast::<String>().ok())
                .map(|s| *s)
                .unwrap_or_default();
            self.log.lock().push(format!("{}:finished:{scope}", self.name));
        }
    }

    #[test]
    fn composite_returns_each_scope_to_its_owner_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTaskLifecycleListener::new(vec![
            Arc::new(Recording { name: "a", log: log.clone() }),
            Arc::new(Recording { name: "b", log: log.clone() }),
        ]);
        let shard = QueueShardId::new("s1");
        let location = QueueLocation::new(QueueId::new("q"), "queue_tasks");
        let record = record(7);

        let scope = composite.started(&shard, &location, &record);
        composite.finished(&shard, &location, &record, scope);

        assert_eq!(
            *log.lock(),
            vec![
                "a:started",
                "b:started",
                "b:finished:b-scope-7",
                "a:finished:a-scope-7",
            ]
        );
    }

    #[test]
    fn logging_listeners_emit_every_lifecycle_event() {
        let log = MessageLog::default();
        let subscriber = tracing_subscriber::registry().with(log.clone());
        let shard = QueueShardId::new("s1");
        let location = QueueLocation::new(QueueId::new("q"), "queue_tasks");
        let record = record(3);

        tracing::subscriber::with_default(subscriber, || {
            let threads = LoggingThreadLifecycleListener;
            threads.started(&shard, &location);
            let tasks = LoggingTaskLifecycleListener;
            tasks.picked(&shard, &location, &record, Duration::from_millis(2));
            let scope = tasks.started(&shard, &location, &record);
            tasks.executed(
                &shard,
                &location,
                &record,
                &TaskExecutionResult::finish(),
                Duration::from_millis(5),
            );
            tasks.crashed(&shard, &location, &record, &anyhow::anyhow!("boom"));
            tasks.finished(&shard, &location, &record, scope);
            threads.executed(&shard, &location, true, Duration::from_millis(9));
            threads.crashed(&shard, &location, &QueueError::TransactionClosed);
            threads.finished(&shard, &location);
        });

        assert_eq!(
            *log.0.lock(),
            vec![
                "poll cycle started",
                "task picked",
                "task started",
                "task executed",
                "task crashed",
                "task finished",
                "poll cycle executed",
                "poll cycle crashed, backing off",
                "poll cycle finished",
            ]
        );
    }
}
