//! Delay used when a consumer asks for a task to be reenqueued without
//! naming an explicit delay.
//!
//! All formulas read the record's `reenqueue_attempt`, which at the time
//! of the calculation is the number of earlier reenqueues.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::queue::model::TaskRecord;
use crate::queue::settings::{duration_ms, duration_ms_vec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "retry_type", rename_all = "snake_case")]
pub enum ReenqueueSettings {
    /// Consumers must always pass an explicit delay.
    #[default]
    Manual,
    Fixed {
        #[serde(with = "duration_ms")]
        fixed_delay: Duration,
    },
    /// Indexed by reenqueue attempt; the last entry repeats.
    Sequential {
        #[serde(with = "duration_ms_vec")]
        sequential_plan: Vec<Duration>,
    },
    Arithmetic {
        #[serde(with = "duration_ms")]
        initial_delay: Duration,
        #[serde(with = "duration_ms")]
        arithmetic_step: Duration,
    },
    Geometric {
        #[serde(with = "duration_ms")]
        initial_delay: Duration,
        geometric_ratio: u32,
    },
}

impl ReenqueueSettings {
    pub fn validate(&self) -> Result<()> {
        match self {
            ReenqueueSettings::Sequential { sequential_plan } if sequential_plan.is_empty() => Err(
                QueueError::InvalidSettings("reenqueue sequential_plan must not be empty".into()),
            ),
            ReenqueueSettings::Geometric {
                geometric_ratio, ..
            } if *geometric_ratio == 0 => Err(QueueError::InvalidSettings(
                "reenqueue geometric_ratio must be positive".into(),
            )),
            _ => Ok(()),
        }
    }
}

pub trait ReenqueueRetryStrategy: Send + Sync {
    fn calculate_delay(&self, record: &TaskRecord) -> Result<Duration>;
}

/// Build the strategy for the current settings snapshot.
pub fn reenqueue_strategy(settings: &ReenqueueSettings) -> Result<Box<dyn ReenqueueRetryStrategy>> {
    settings.validate()?;
    Ok(match settings {
        ReenqueueSettings::Manual => Box::new(ManualReenqueueStrategy),
        ReenqueueSettings::Fixed { fixed_delay } => Box::new(FixedReenqueueStrategy {
            delay: *fixed_delay,
        }),
        ReenqueueSettings::Sequential { sequential_plan } => Box::new(SequentialReenqueueStrategy {
            plan: sequential_plan.clone(),
        }),
        ReenqueueSettings::Arithmetic {
            initial_delay,
            arithmetic_step,
        } => Box::new(ArithmeticReenqueueStrategy {
            initial_delay: *initial_delay,
            step: *arithmetic_step,
        }),
        ReenqueueSettings::Geometric {
            initial_delay,
            geometric_ratio,
        } => Box::new(GeometricReenqueueStrategy {
            initial_delay: *initial_delay,
            ratio: *geometric_ratio,
        }),
    })
}

fn attempt_index(record: &TaskRecord) -> u32 {
    u32::try_from(record.reenqueue_attempt.max(0)).unwrap_or(u32::MAX)
}

pub struct ManualReenqueueStrategy;

impl ReenqueueRetryStrategy for ManualReenqueueStrategy {
    fn calculate_delay(&self, record: &TaskRecord) -> Result<Duration> {
        Err(QueueError::ManualReenqueueWithoutDelay {
            task_id: record.id,
            reenqueue_attempt: record.reenqueue_attempt,
        })
    }
}

pub struct FixedReenqueueStrategy {
    delay: Duration,
}

impl ReenqueueRetryStrategy for FixedReenqueueStrategy {
    fn calculate_delay(&self, _record: &TaskRecord) -> Result<Duration> {
        Ok(self.delay)
    }
}

pub struct SequentialReenqueueStrategy {
    plan: Vec<Duration>,
}

impl ReenqueueRetryStrategy for SequentialReenqueueStrategy {
    fn calculate_delay(&self, record: &TaskRecord) -> Result<Duration> {
        let last = self.plan.len().saturating_sub(1);
        let idx = (attempt_index(record) as usize).min(last);
        self.plan
            .get(idx)
            .copied()
            .ok_or_else(|| QueueError::InvalidSettings("reenqueue sequential_plan is empty".into()))
    }
}

pub struct ArithmeticReenqueueStrategy {
    initial_delay: Duration,
    step: Duration,
}

impl ReenqueueRetryStrategy for ArithmeticReenqueueStrategy {
    fn calculate_delay(&self, record: &TaskRecord) -> Result<Duration> {
        Ok(self
            .initial_delay
            .saturating_add(self.step.saturating_mul(attempt_index(record))))
    }
}

pub struct GeometricReenqueueStrategy {
    initial_delay: Duration,
    ratio: u32,
}

impl ReenqueueRetryStrategy for GeometricReenqueueStrategy {
    fn calculate_delay(&self, record: &TaskRecord) -> Result<Duration> {
        let factor = self.ratio.saturating_pow(attempt_index(record));
        Ok(self.initial_delay.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use std::collections::HashMap;

    fn record(reenqueue_attempt: i64) -> TaskRecord {
        TaskRecord {
            id: 42,
            payload: None,
            attempt: 1,
            reenqueue_attempt,
            total_attempt: reenqueue_attempt + 1,
            created_at: Utc::now(),
            next_process_at: Utc::now(),
            ext_data: HashMap::new(),
        }
    }

    fn delays(settings: ReenqueueSettings) -> Vec<u64> {
        let strategy = reenqueue_strategy(&settings).unwrap();
        (0..5)
            .map(|a| strategy.calculate_delay(&record(a)).unwrap().as_secs())
            .collect()
    }

    #[rstest]
    #[case(ReenqueueSettings::Fixed { fixed_delay: Duration::from_secs(10) }, vec![10, 10, 10, 10, 10])]
    #[case(
        ReenqueueSettings::Sequential {
            sequential_plan: vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)],
        },
        vec![1, 2, 3, 3, 3]
    )]
    #[case(
        ReenqueueSettings::Arithmetic {
            initial_delay: Duration::from_secs(10),
            arithmetic_step: Duration::from_secs(1),
        },
        vec![10, 11, 12, 13, 14]
    )]
    #[case(
        ReenqueueSettings::Geometric { initial_delay: Duration::from_secs(10), geometric_ratio: 3 },
        vec![10, 30, 90, 270, 810]
    )]
    fn reenqueue_delays_for_first_five_attempts(
        #[case] settings: ReenqueueSettings,
        #[case] expected: Vec<u64>,
    ) {
        assert_eq!(delays(settings), expected);
    }

    #[test]
    fn manual_strategy_always_fails_loudly() {
        let strategy = reenqueue_strategy(&ReenqueueSettings::Manual).unwrap();
        for attempt in 0..3 {
            let err = strategy.calculate_delay(&record(attempt)).unwrap_err();
            assert!(matches!(err, QueueError::ManualReenqueueWithoutDelay { task_id: 42, .. }));
            assert!(err.to_string().contains("no execution delay was supplied"));
        }
    }

    #[test]
    fn invalid_parameters_are_rejected_at_build_time() {
        assert!(reenqueue_strategy(&ReenqueueSettings::Sequential {
            sequential_plan: vec![]
        })
        .is_err());
        assert!(reenqueue_strategy(&ReenqueueSettings::Geometric {
            initial_delay: Duration::from_secs(1),
            geometric_ratio: 0
        })
        .is_err());
    }

    #[test]
    fn unknown_retry_type_fails_to_parse() {
        let raw = serde_json::json!({ "retry_type": "fibonacci" });
        assert!(serde_json::from_value::<ReenqueueSettings>(raw).is_err());
    }
}
