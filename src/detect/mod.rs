//! Anomaly detection: strategies, per-attribute evaluation and limit replay.

pub mod config;
pub mod delta;
pub mod evaluator;
pub mod interval;
pub mod range;
pub mod replay;
pub mod strategy;

pub use self::config::{StrategyConfig, StrategyKind};
pub use self::evaluator::AttributeEvaluator;
pub use self::strategy::{Limits, StrategyState};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("insufficient data: need {needed} points, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("value is not numeric")]
    NonNumeric,

    #[error("timestamp {timestamp} precedes previous observation at {previous}")]
    OutOfOrder { timestamp: i64, previous: i64 },

    #[error("{0} strategy does not produce limits")]
    LimitsUnsupported(StrategyKind),
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// An observed extreme together with the timestamp of the observation backing it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extreme<T> {
    pub value: T,
    pub timestamp: i64,
}

impl<T> Extreme<T> {
    pub fn new(value: T, timestamp: i64) -> Self {
        Self { value, timestamp }
    }

    /// True when the backing observation is older than `cutoff`.
    pub fn older_than(&self, cutoff: i64) -> bool {
        self.timestamp < cutoff
    }
}
