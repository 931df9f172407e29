use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::{panic_message, QueueError, Result};
use crate::listener::ThreadLifecycleListener;
use crate::queue::model::{QueueLocation, QueueProcessingStatus, QueueShardId};
use crate::queue::settings::SettingsHandle;
use crate::runner::QueueRunner;
use crate::service::queue_loop::{QueueLoop, WaitInterrupt};

/// Builds a fresh runner for each worker a pool starts.
pub type RunnerFactory = Box<dyn Fn() -> Result<Arc<dyn QueueRunner>> + Send + Sync>;

#[derive(Default)]
struct PoolState {
    started: bool,
    shutdown: bool,
    paused: bool,
    loops: Vec<Arc<QueueLoop>>,
    workers: JoinSet<()>,
}

/// Workers of one queue on one shard.
pub struct QueueExecutionPool {
    location: QueueLocation,
    shard_id: QueueShardId,
    settings: SettingsHandle,
    listener: Arc<dyn ThreadLifecycleListener>,
    runner_factory: RunnerFactory,
    state: Mutex<PoolState>,
    /// Workers still alive, including aborted ones not yet dropped.
    live: Arc<watch::Sender<usize>>,
}

/// Decrements the live count when a worker's future is dropped, which
/// covers both a normal return and an abort.
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct Worker {
    location: QueueLocation,
    shard_id: QueueShardId,
    settings: SettingsHandle,
    listener: Arc<dyn ThreadLifecycleListener>,
    runner: Arc<dyn QueueRunner>,
    queue_loop: Arc<QueueLoop>,
}

impl Worker {
    async fn poll_cycle(&self) {
        let poll = self.settings.load().poll.clone();
        // a panic counts as a crash of this cycle
        let outcome = AssertUnwindSafe(self.run_once())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(QueueError::Panicked(panic_message(&*panic))));
        match outcome {
            Ok(QueueProcessingStatus::Processed) => {
                self.queue_loop
                    .wait(poll.between_task_timeout, WaitInterrupt::Deny)
                    .await
            }
            Ok(QueueProcessingStatus::Skipped) => {
                self.queue_loop
                    .wait(poll.no_task_timeout, WaitInterrupt::Allow)
                    .await
            }
            Err(err) => {
                self.listener.crashed(&self.shard_id, &self.location, &err);
                self.queue_loop
                    .wait(poll.fatal_crash_timeout, WaitInterrupt::Deny)
                    .await;
            }
        }
        self.listener.finished(&self.shard_id, &self.location);
    }

    async fn run_once(&self) -> Result<QueueProcessingStatus> {
        self.listener.started(&self.shard_id, &self.location);
        let started = Instant::now();
        let status = self.runner.run_queue().await?;
        self.listener.executed(
            &self.shard_id,
            &self.location,
            status == QueueProcessingStatus::Processed,
            started.elapsed(),
        );
        Ok(status)
    }
}

impl QueueExecutionPool {
    pub fn new(
        location: QueueLocation,
        shard_id: QueueShardId,
        settings: SettingsHandle,
        listener: Arc<dyn ThreadLifecycleListener>,
        runner_factory: RunnerFactory,
    ) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            location,
            shard_id,
            settings,
            listener,
            runner_factory,
            state: Mutex::new(PoolState::default()),
            live: Arc::new(live),
        }
    }

    pub fn shard_id(&self) -> &QueueShardId {
        &self.shard_id
    }

    /// Spawn `thread_count` workers. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let thread_count = self.settings.load().processing.thread_count;
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(QueueError::InvalidState(format!(
                "pool {}@{} is shut down",
                self.location, self.shard_id
            )));
        }
        if state.started {
            return Err(QueueError::InvalidState(format!(
                "pool {}@{} is already started",
                self.location, self.shard_id
            )));
        }

        let mut workers = Vec::with_capacity(thread_count as usize);
        for _ in 0..thread_count {
            workers.push(Arc::new(Worker {
                location: self.location.clone(),
                shard_id: self.shard_id.clone(),
                settings: self.settings.clone(),
                listener: self.listener.clone(),
                runner: (self.runner_factory)()?,
                queue_loop: Arc::new(QueueLoop::new(state.paused)),
            }));
        }

        for worker in workers {
            state.loops.push(worker.queue_loop.clone());
            self.live.send_modify(|n| *n += 1);
            let guard = LiveGuard(self.live.clone());
            state.workers.spawn(async move {
                let _guard = guard;
                let queue_loop = worker.queue_loop.clone();
                queue_loop
                    .run(|| {
                        let worker = worker.clone();
                        async move { worker.poll_cycle().await }
                    })
                    .await;
            });
        }
        state.started = true;

        tracing::info!(
            queue_id = %self.location.queue_id(),
            shard_id = %self.shard_id,
            thread_count,
            "queue pool started"
        );
        Ok(())
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        for queue_loop in &state.loops {
            queue_loop.pause();
        }
    }

    pub fn unpause(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        for queue_loop in &state.loops {
            queue_loop.unpause();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Interrupt every worker. In-flight tasks are abandoned.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        for queue_loop in &state.loops {
            queue_loop.cancel();
        }
        state.workers.abort_all();
        tracing::info!(
            queue_id = %self.location.queue_id(),
            shard_id = %self.shard_id,
            "queue pool shut down"
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && *self.live.borrow() == 0
    }

    /// Returns `true` if every worker exited within `timeout`.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut live = self.live.subscribe();
        let terminated = matches!(
            tokio::time::timeout(timeout, live.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        terminated
    }

    pub fn wakeup(&self) {
        for queue_loop in &self.state.lock().loops {
            queue_loop.wakeup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::LoggingThreadLifecycleListener;
    use crate::queue::model::QueueId;
    use crate::queue::settings::QueueSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingRunner;

    #[async_trait]
    impl QueueRunner for FailingRunner {
        async fn run_queue(&self) -> Result<QueueProcessingStatus> {
            Err(QueueError::InvalidState("connection lost".to_string()))
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl QueueRunner for PanickingRunner {
        async fn run_queue(&self) -> Result<QueueProcessingStatus> {
            panic!("runner bug")
        }
    }

    struct CountingRunner(Arc<AtomicUsize>);

    #[async_trait]
    impl QueueRunner for CountingRunner {
        async fn run_queue(&self) -> Result<QueueProcessingStatus> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(QueueProcessingStatus::Skipped)
        }
    }

    #[derive(Default)]
    struct CrashCounter(AtomicUsize);

    impl ThreadLifecycleListener for CrashCounter {
        fn crashed(&self, _: &QueueShardId, _: &QueueLocation, _: &QueueError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(
        settings: QueueSettings,
        listener: Arc<dyn ThreadLifecycleListener>,
        runner_factory: RunnerFactory,
    ) -> QueueExecutionPool {
        QueueExecutionPool::new(
            QueueLocation::new(QueueId::new("q"), "queue_tasks"),
            QueueShardId::new("s1"),
            SettingsHandle::new(settings),
            listener,
            runner_factory,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn runner_crash_backs_off_for_fatal_timeout() {
        let counter = Arc::new(CrashCounter::default());
        let settings = QueueSettings::default().with_poll(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let pool = pool(
            settings,
            counter.clone(),
            Box::new(|| Ok(Arc::new(FailingRunner) as Arc<dyn QueueRunner>)),
        );

        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(1)).await);
        assert!(pool.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn runner_panic_is_reported_and_worker_survives() {
        let counter = Arc::new(CrashCounter::default());
        let settings = QueueSettings::default().with_poll(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let pool = pool(
            settings,
            counter.clone(),
            Box::new(|| Ok(Arc::new(PanickingRunner) as Arc<dyn QueueRunner>)),
        );

        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        assert!(!pool.is_terminated());
        assert!(!pool.await_termination(Duration::from_millis(10)).await);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn wakeup_triggers_poll_before_idle_timeout() {
        let polls = Arc::new(AtomicUsize::new(0));
        let factory_polls = polls.clone();
        let settings = QueueSettings::default().with_thread_count(2).with_poll(
            Duration::from_millis(10),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let pool = pool(
            settings,
            Arc::new(LoggingThreadLifecycleListener),
            Box::new(move || Ok(Arc::new(CountingRunner(factory_polls.clone())) as Arc<dyn QueueRunner>)),
        );

        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);

        pool.wakeup();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        pool.shutdown();
    }

    #[tokio::test]
    async fn restart_after_shutdown_is_rejected() {
        let pool = pool(
            QueueSettings::default(),
            Arc::new(LoggingThreadLifecycleListener),
            Box::new(|| Ok(Arc::new(FailingRunner) as Arc<dyn QueueRunner>)),
        );
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(QueueError::InvalidState(_))));
        pool.shutdown();
        assert!(matches!(pool.start(), Err(QueueError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn running_pool_does_not_terminate_within_timeout() {
        let pool = pool(
            QueueSettings::default(),
            Arc::new(LoggingThreadLifecycleListener),
            Box::new(|| Ok(Arc::new(CountingRunner(Arc::default())) as Arc<dyn QueueRunner>)),
        );
        pool.start().unwrap();

        let started = Instant::now();
        assert!(!pool.await_termination(Duration::from_secs(2)).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!pool.is_terminated());
        pool.shutdown();
    }
}
