use serde::Serialize;

use super::delta::DeltaState;
use super::interval::IntervalState;
use super::range::RangeState;
use super::{DetectError, StrategyConfig, StrategyKind};
use crate::model::HistoricalPoint;

/// Lower and upper acceptable value at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Limits {
    pub timestamp: i64,
    pub lower: f64,
    pub upper: f64,
}

impl Limits {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Statistics held for one strategy of one watched attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyState {
    Range(RangeState),
    Delta(DeltaState),
    Interval(IntervalState),
}

impl StrategyState {
    pub fn recompute(config: &StrategyConfig, window: &[HistoricalPoint]) -> Result<Self, DetectError> {
        let minimum = config.minimum_points;
        Ok(match config.kind {
            StrategyKind::Range => StrategyState::Range(RangeState::recompute(window, minimum)?),
            StrategyKind::Delta => StrategyState::Delta(DeltaState::recompute(window, minimum)?),
            StrategyKind::Interval => StrategyState::Interval(IntervalState::recompute(window, minimum)?),
        })
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyState::Range(_) => StrategyKind::Range,
            StrategyState::Delta(_) => StrategyKind::Delta,
            StrategyState::Interval(_) => StrategyKind::Interval,
        }
    }

    pub fn is_stale(&self, timestamp: i64, timespan_ms: i64) -> bool {
        match self {
            StrategyState::Range(s) => s.is_stale(timestamp, timespan_ms),
            StrategyState::Delta(s) => s.is_stale(timestamp, timespan_ms),
            StrategyState::Interval(s) => s.is_stale(timestamp, timespan_ms),
        }
    }

    /// Check a new observation. Range and Delta need a numeric value; Interval
    /// only looks at the timestamp.
    pub fn validate(
        &mut self,
        value: &serde_json::Value,
        timestamp: i64,
        fraction: f64,
    ) -> Result<bool, DetectError> {
        match self {
            StrategyState::Range(s) => Ok(s.validate(numeric(value)?, timestamp, fraction)),
            StrategyState::Delta(s) => Ok(s.validate(numeric(value)?, timestamp, fraction)),
            StrategyState::Interval(s) => s.validate(timestamp, fraction),
        }
    }

    pub fn bounds(&mut self, value: f64, timestamp: i64, fraction: f64) -> Result<Limits, DetectError> {
        let (lower, upper) = match self {
            StrategyState::Range(s) => s.bounds(value, timestamp, fraction),
            StrategyState::Delta(s) => s.bounds(value, timestamp, fraction),
            StrategyState::Interval(_) => return Err(DetectError::LimitsUnsupported(StrategyKind::Interval)),
        };
        Ok(Limits { timestamp, lower, upper })
    }
}

fn numeric(value: &serde_json::Value) -> Result<f64, DetectError> {
    value.as_f64().ok_or(DetectError::NonNumeric)
}
