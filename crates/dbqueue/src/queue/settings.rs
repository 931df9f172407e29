use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::queue::reenqueue::ReenqueueSettings;
use crate::queue::retry::FailureRetryType;

/// Durations travel as whole milliseconds in serialized settings.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

pub(crate) mod duration_ms_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            value
                .iter()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<u64>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(Duration::from_millis).collect())
    }
}

/// Transaction boundary used when combining claim and execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    SeparateTransactions,
    WrapInTransaction,
    UseExternalExecutor,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::SeparateTransactions => "separate_transactions",
            ProcessingMode::WrapInTransaction => "wrap_in_transaction",
            ProcessingMode::UseExternalExecutor => "use_external_executor",
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = QueueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "separate_transactions" => Ok(ProcessingMode::SeparateTransactions),
            "wrap_in_transaction" => Ok(ProcessingMode::WrapInTransaction),
            "use_external_executor" => Ok(ProcessingMode::UseExternalExecutor),
            other => Err(QueueError::InvalidSettings(format!(
                "unknown processing mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingSettings {
    /// Worker count per shard. Zero disables the queue.
    pub thread_count: u32,
    pub processing_mode: ProcessingMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(with = "duration_ms")]
    pub between_task_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub no_task_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub fatal_crash_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSettings {
    pub retry_type: FailureRetryType,
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
}

impl FailureSettings {
    pub fn delay_for(&self, attempt: i64) -> Duration {
        self.retry_type.delay(self.retry_interval, attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub processing: ProcessingSettings,
    pub poll: PollSettings,
    pub failure: FailureSettings,
    #[serde(default)]
    pub reenqueue: ReenqueueSettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            processing: ProcessingSettings {
                thread_count: 1,
                processing_mode: ProcessingMode::SeparateTransactions,
            },
            poll: PollSettings {
                between_task_timeout: Duration::from_millis(100),
                no_task_timeout: Duration::from_secs(1),
                fatal_crash_timeout: Duration::from_secs(1),
            },
            failure: FailureSettings {
                retry_type: FailureRetryType::GeometricBackoff,
                retry_interval: Duration::from_secs(60),
            },
            reenqueue: ReenqueueSettings::Manual,
        }
    }
}

impl QueueSettings {
    pub fn with_thread_count(mut self, thread_count: u32) -> Self {
        self.processing.thread_count = thread_count;
        self
    }

    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing.processing_mode = mode;
        self
    }

    pub fn with_poll(
        mut self,
        between_task_timeout: Duration,
        no_task_timeout: Duration,
        fatal_crash_timeout: Duration,
    ) -> Self {
        self.poll = PollSettings {
            between_task_timeout,
            no_task_timeout,
            fatal_crash_timeout,
        };
        self
    }

    pub fn with_failure(mut self, retry_type: FailureRetryType, retry_interval: Duration) -> Self {
        self.failure = FailureSettings {
            retry_type,
            retry_interval,
        };
        self
    }

    pub fn with_reenqueue(mut self, reenqueue: ReenqueueSettings) -> Self {
        self.reenqueue = reenqueue;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure.retry_interval.is_zero() {
            return Err(QueueError::InvalidSettings(
                "failure retry_interval must be positive".to_string(),
            ));
        }
        if self.poll.fatal_crash_timeout.is_zero() {
            return Err(QueueError::InvalidSettings(
                "poll fatal_crash_timeout must be positive".to_string(),
            ));
        }
        self.reenqueue.validate()
    }
}

/// Shared, atomically replaceable settings snapshot.
///
/// Every poll cycle calls [`SettingsHandle::load`]; a cycle that already
/// loaded a snapshot keeps using it.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<QueueSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn load(&self) -> Arc<QueueSettings> {
        self.inner.read().clone()
    }

    pub fn store(&self, settings: QueueSettings) {
        *self.inner.write() = Arc::new(settings);
    }
}
