use async_trait::async_trait;
use dbqueue::queue::{
    FailureRetryType, JsonPayloadTransformer, PayloadTransformer, QueueId, QueueLocation,
    QueueSettings, ReenqueueSettings, SettingsHandle, Task, TaskExecutionResult,
};
use dbqueue::{QueueConfig, QueueConsumer};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSendPayload {
    pub user_id: i64,
    pub template: Option<String>,
}

/// Sends one email. Delivery is simulated and fails now and then so the
/// failure backoff is visible in the logs.
pub struct EmailConsumer {
    config: QueueConfig,
    transformer: JsonPayloadTransformer<EmailSendPayload>,
    failure_rate: f64,
}

impl EmailConsumer {
    async fn deliver(&self, payload: &EmailSendPayload) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let unlucky = rand::thread_rng().gen_bool(self.failure_rate);
        anyhow::ensure!(!unlucky, "smtp relay refused user_id={}", payload.user_id);
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for EmailConsumer {
    type Payload = EmailSendPayload;

    fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    fn payload_transformer(&self) -> &dyn PayloadTransformer<EmailSendPayload> {
        &self.transformer
    }

    async fn execute(&self, task: Task<EmailSendPayload>) -> anyhow::Result<TaskExecutionResult> {
        let payload = task
            .payload()
            .ok_or_else(|| anyhow::anyhow!("email task without payload"))?;

        match timeout(SEND_TIMEOUT, self.deliver(payload)).await {
            Ok(Ok(())) => {
                tracing::info!(
                    user_id = payload.user_id,
                    template = payload.template.as_deref().unwrap_or("default"),
                    attempts = task.attempts_count,
                    "email sent"
                );
                Ok(TaskExecutionResult::finish())
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id = payload.user_id, error = %e, "email delivery failed");
                Ok(TaskExecutionResult::fail())
            }
            Err(_) => anyhow::bail!("send timeout after {}ms", SEND_TIMEOUT.as_millis()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestPayload {
    pub user_id: i64,
    /// How many digests to build before the task retires.
    pub rounds: i64,
}

/// Builds a periodic digest and reschedules itself on the queue's
/// reenqueue plan until `rounds` digests went out.
pub struct DigestConsumer {
    config: QueueConfig,
    transformer: JsonPayloadTransformer<DigestPayload>,
}

#[async_trait]
impl QueueConsumer for DigestConsumer {
    type Payload = DigestPayload;

    fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    fn payload_transformer(&self) -> &dyn PayloadTransformer<DigestPayload> {
        &self.transformer
    }

    async fn execute(&self, task: Task<DigestPayload>) -> anyhow::Result<TaskExecutionResult> {
        let payload = task
            .payload()
            .ok_or_else(|| anyhow::anyhow!("digest task without payload"))?;
        let round = task.reenqueue_attempts_count + 1;
        tracing::info!(
            user_id = payload.user_id,
            round,
            trace_id = task.ext("trace_id").unwrap_or("-"),
            "digest built"
        );
        if round >= payload.rounds {
            return Ok(TaskExecutionResult::finish());
        }
        Ok(TaskExecutionResult::reenqueue())
    }
}

pub struct Consumers {
    pub email: Arc<EmailConsumer>,
    pub digest: Arc<DigestConsumer>,
}

impl Consumers {
    pub fn locations(&self) -> Vec<QueueLocation> {
        vec![
            self.email.queue_config().location.clone(),
            self.digest.queue_config().location.clone(),
        ]
    }
}

pub fn build_consumers(table: &str, threads: u32) -> Consumers {
    let email_settings = QueueSettings::default()
        .with_thread_count(threads)
        .with_poll(
            Duration::from_millis(10),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .with_failure(FailureRetryType::GeometricBackoff, Duration::from_secs(5));

    let digest_settings = QueueSettings::default()
        .with_thread_count(1)
        .with_reenqueue(ReenqueueSettings::Sequential {
            sequential_plan: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
        });

    Consumers {
        email: Arc::new(EmailConsumer {
            config: QueueConfig::new(
                QueueLocation::new(QueueId::new("email_send"), table),
                SettingsHandle::new(email_settings),
            ),
            transformer: JsonPayloadTransformer::new(),
            failure_rate: 0.1,
        }),
        digest: Arc::new(DigestConsumer {
            config: QueueConfig::new(
                QueueLocation::new(QueueId::new("digest"), table),
                SettingsHandle::new(digest_settings),
            ),
            transformer: JsonPayloadTransformer::new(),
        }),
    }
}
