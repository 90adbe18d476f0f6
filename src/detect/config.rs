//! Strategy configuration as authored on an attribute's monitoring metadata.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Severity;
use crate::model::Classification;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("malformed strategy configuration: {0}")]
    Malformed(String),

    #[error("invalid timespan '{0}' (expected e.g. 500ms, 30s, 15m, 2h, 1d)")]
    InvalidTimespan(String),

    #[error("timespan must be greater than zero")]
    ZeroTimespan,

    #[error("deviation percent must be a finite value >= 0, got {0}")]
    InvalidDeviation(f64),

    #[error("minimum points must be at least 1")]
    ZeroMinimumPoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Range,
    Delta,
    Interval,
}

impl StrategyKind {
    /// Classification emitted when this strategy rejects a value.
    pub fn outlier(self) -> Classification {
        match self {
            StrategyKind::Range => Classification::RangeOutlier,
            StrategyKind::Delta => Classification::DeltaOutlier,
            StrategyKind::Interval => Classification::IntervalOutlier,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Range => "range",
            StrategyKind::Delta => "delta",
            StrategyKind::Interval => "interval",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "range" => Ok(StrategyKind::Range),
            "delta" => Ok(StrategyKind::Delta),
            "interval" => Ok(StrategyKind::Interval),
            other => Err(ConfigError::Malformed(format!("unknown strategy kind '{}'", other))),
        }
    }
}

/// One detection strategy configured on an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Display name, used as the alert title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub deviation_percent: f64,
    #[serde(with = "timespan")]
    pub timespan: Duration,
    pub minimum_points: usize,
    #[serde(default)]
    pub alert_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_message_template: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl StrategyConfig {
    /// A minimal enabled configuration without alerting.
    pub fn new(kind: StrategyKind, deviation_percent: f64, timespan: Duration, minimum_points: usize) -> Self {
        Self {
            kind,
            name: None,
            enabled: true,
            deviation_percent,
            timespan,
            minimum_points,
            alert_enabled: false,
            alert_severity: None,
            alert_assignee: None,
            alert_message_template: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.deviation_percent.is_finite() || self.deviation_percent < 0.0 {
            return Err(ConfigError::InvalidDeviation(self.deviation_percent));
        }
        if self.minimum_points == 0 {
            return Err(ConfigError::ZeroMinimumPoints);
        }
        if self.timespan.is_zero() {
            return Err(ConfigError::ZeroTimespan);
        }
        Ok(())
    }

    pub fn timespan_ms(&self) -> i64 {
        i64::try_from(self.timespan.as_millis()).unwrap_or(i64::MAX)
    }

    /// Deviation as a fraction (10% -> 0.1).
    pub fn deviation_fraction(&self) -> f64 {
        self.deviation_percent / 100.0
    }

    pub fn title(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("{} anomaly", self.kind))
    }
}

/// Monitoring metadata may carry a bare list of strategies or an object with
/// a `methods` list.
#[derive(Deserialize)]
#[serde(untagged)]
enum MetadataShape {
    List(Vec<StrategyConfig>),
    Methods { methods: Vec<StrategyConfig> },
}

/// Parse and validate the strategy list found on an attribute's metadata.
pub fn parse_strategy_configs(raw: &serde_json::Value) -> Result<Vec<StrategyConfig>, ConfigError> {
    let shape: MetadataShape =
        serde_json::from_value(raw.clone()).map_err(|e| ConfigError::Malformed(e.to_string()))?;
    let configs = match shape {
        MetadataShape::List(list) => list,
        MetadataShape::Methods { methods } => methods,
    };
    for config in &configs {
        config.validate()?;
    }
    Ok(configs)
}

/// Parse a human timespan such as `500ms`, `30s`, `15m`, `2h` or `1d`.
/// A bare integer is taken as milliseconds.
pub fn parse_timespan(input: &str) -> Result<Duration, ConfigError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidTimespan(input.to_string()))?;
    let millis = match unit.trim() {
        "" | "ms" => Some(amount),
        "s" => amount.checked_mul(1_000),
        "m" => amount.checked_mul(60_000),
        "h" => amount.checked_mul(3_600_000),
        "d" => amount.checked_mul(86_400_000),
        _ => None,
    }
    .ok_or_else(|| ConfigError::InvalidTimespan(input.to_string()))?;
    Ok(Duration::from_millis(millis))
}

/// Render a timespan using the largest unit that divides it exactly.
pub fn format_timespan(span: Duration) -> String {
    let ms = span.as_millis();
    for (unit, size) in [("d", 86_400_000u128), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if ms != 0 && ms % size == 0 {
            return format!("{}{}", ms / size, unit);
        }
    }
    format!("{}ms", ms)
}

mod timespan {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(span: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timespan(*span))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => super::parse_timespan(&text).map_err(serde::de::Error::custom),
        }
    }
}
