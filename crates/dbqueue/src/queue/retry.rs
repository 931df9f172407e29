use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::QueueError;

/// Exponent cap for geometric backoff; keeps `2^attempt` inside `u32`
/// and the generated interval inside Postgres' range.
pub(crate) const MAX_GEOMETRIC_EXPONENT: u32 = 31;

/// Failure backoff applied when a task is claimed.
///
/// `attempt` is the pre-increment count, i.e. the number of earlier
/// failed attempts of the current reenqueue cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureRetryType {
    /// `base * 2^attempt`
    GeometricBackoff,
    /// `base * (1 + 2 * attempt)`
    ArithmeticBackoff,
    /// `base`
    LinearBackoff,
}

impl FailureRetryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureRetryType::GeometricBackoff => "geometric_backoff",
            FailureRetryType::ArithmeticBackoff => "arithmetic_backoff",
            FailureRetryType::LinearBackoff => "linear_backoff",
        }
    }

    pub fn delay(&self, base: Duration, attempt: i64) -> Duration {
        let attempt = u32::try_from(attempt.max(0)).unwrap_or(u32::MAX);
        match self {
            FailureRetryType::LinearBackoff => base,
            FailureRetryType::ArithmeticBackoff => {
                base.saturating_mul(attempt.saturating_mul(2).saturating_add(1))
            }
            FailureRetryType::GeometricBackoff => {
                base.saturating_mul(1u32 << attempt.min(MAX_GEOMETRIC_EXPONENT))
            }
        }
    }

    /// SQL multiplier of the base interval, evaluated against the row's
    /// current (pre-increment) attempt column.
    pub(crate) fn sql_factor(&self, attempt_column: &str) -> String {
        match self {
            FailureRetryType::LinearBackoff => "1".to_string(),
            FailureRetryType::ArithmeticBackoff => format!("(1 + 2 * {attempt_column})"),
            FailureRetryType::GeometricBackoff => {
                format!("power(2, least({attempt_column}, {MAX_GEOMETRIC_EXPONENT}))")
            }
        }
    }
}

impl FromStr for FailureRetryType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geometric_backoff" | "geometric" => Ok(FailureRetryType::GeometricBackoff),
            "arithmetic_backoff" | "arithmetic" => Ok(FailureRetryType::ArithmeticBackoff),
            "linear_backoff" | "linear" => Ok(FailureRetryType::LinearBackoff),
            other => Err(QueueError::InvalidSettings(format!(
                "unknown failure retry type: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn secs(v: &[u64]) -> Vec<Duration> {
        v.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[rstest]
    #[case(FailureRetryType::LinearBackoff, &[60, 60, 60, 60, 60])]
    #[case(FailureRetryType::ArithmeticBackoff, &[60, 180, 300, 420, 540])]
    #[case(FailureRetryType::GeometricBackoff, &[60, 120, 240, 480, 960])]
    fn backoff_for_first_five_attempts(#[case] retry_type: FailureRetryType, #[case] expected: &[u64]) {
        let base = Duration::from_secs(60);
        let got: Vec<Duration> = (0..5).map(|a| retry_type.delay(base, a)).collect();
        assert_eq!(got, secs(expected));
    }

    #[test]
    fn geometric_backoff_saturates_instead_of_overflowing() {
        let base = Duration::from_secs(60);
        let capped = FailureRetryType::GeometricBackoff.delay(base, 31);
        assert_eq!(FailureRetryType::GeometricBackoff.delay(base, 1_000), capped);
        assert_eq!(FailureRetryType::ArithmeticBackoff.delay(base, -3), base);
    }

    #[test]
    fn sql_factor_references_attempt_column() {
        assert_eq!(FailureRetryType::LinearBackoff.sql_factor("t.attempt"), "1");
        assert_eq!(
            FailureRetryType::ArithmeticBackoff.sql_factor("t.attempt"),
            "(1 + 2 * t.attempt)"
        );
        assert_eq!(
            FailureRetryType::GeometricBackoff.sql_factor("t.attempt"),
            "power(2, least(t.attempt, 31))"
        );
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert_eq!(
            "GEOMETRIC_BACKOFF".parse::<FailureRetryType>().unwrap(),
            FailureRetryType::GeometricBackoff
        );
        assert!("fibonacci".parse::<FailureRetryType>().is_err());
    }
}
