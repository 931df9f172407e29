use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Whether [`QueueLoop::wakeup`] may cut a wait short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitInterrupt {
    Allow,
    Deny,
}

#[derive(Debug, Default)]
struct LoopState {
    paused: bool,
    woken: bool,
    cancelled: bool,
}

/// Pause/wait/wake control of one worker.
///
/// Flags live behind a mutex; waiters register with the [`Notify`] before
/// reading them so a signal sent between the check and the await is never
/// missed.
#[derive(Debug, Default)]
pub struct QueueLoop {
    state: Mutex<LoopState>,
    notify: Notify,
}

impl QueueLoop {
    pub fn new(paused: bool) -> Self {
        Self {
            state: Mutex::new(LoopState {
                paused,
                ..LoopState::default()
            }),
            notify: Notify::new(),
        }
    }

    /// Invoke `body` until cancelled, parking while paused.
    pub async fn run<F, Fut>(&self, mut body: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let paused = {
                let state = self.state.lock();
                if state.cancelled {
                    return;
                }
                state.paused
            };
            if paused {
                self.wait_unpaused().await;
                continue;
            }
            body().await;
        }
    }

    async fn wait_unpaused(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.cancelled {
                    return;
                }
                if !state.paused {
                    // the unpause already resumed us
                    state.woken = false;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Sleep up to `timeout`.
    ///
    /// With [`WaitInterrupt::Allow`] a pending or concurrent wakeup ends the
    /// wait at once. With [`WaitInterrupt::Deny`] the full timeout is slept
    /// and any wakeup arriving before or during it is discarded.
    pub async fn wait(&self, timeout: Duration, interrupt: WaitInterrupt) {
        let deadline = Instant::now() + timeout;
        if interrupt == WaitInterrupt::Deny {
            self.state.lock().woken = false;
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.cancelled {
                    return;
                }
                if interrupt == WaitInterrupt::Allow && state.woken {
                    state.woken = false;
                    return;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        if interrupt == WaitInterrupt::Deny {
            self.state.lock().woken = false;
        }
    }

    pub fn wakeup(&self) {
        self.state.lock().woken = true;
        self.notify.notify_waiters();
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn unpause(&self) {
        {
            let mut state = self.state.lock();
            state.paused = false;
            state.woken = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Make `run` return at its next check and end any wait in progress.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.notify.notify_waiters();
    }
}
