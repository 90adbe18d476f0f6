//! Core data model: attribute identity, update events, classifications and
//! historical datapoints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a monitored time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeKey {
    pub entity_id: String,
    pub attribute_name: String,
}

impl AttributeKey {
    pub fn new(entity_id: impl Into<String>, attribute_name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute_name: attribute_name.into(),
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_id, self.attribute_name)
    }
}

/// A single attribute value update delivered by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub entity_id: String,
    pub attribute_name: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl AttributeUpdate {
    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.entity_id.clone(), self.attribute_name.clone())
    }

    /// The numeric reading carried by this update, if any.
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(serde_json::Value::as_f64)
    }
}

/// Per-event verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Valid,
    Unchecked,
    RangeOutlier,
    DeltaOutlier,
    IntervalOutlier,
    Multiple,
}

impl Classification {
    /// Whether a point with this classification may contribute to a baseline.
    pub fn is_baseline(self) -> bool {
        matches!(self, Classification::Valid | Classification::Unchecked)
    }

    pub fn is_anomaly(self) -> bool {
        !self.is_baseline()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Valid => "valid",
            Classification::Unchecked => "unchecked",
            Classification::RangeOutlier => "range_outlier",
            Classification::DeltaOutlier => "delta_outlier",
            Classification::IntervalOutlier => "interval_outlier",
            Classification::Multiple => "multiple",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Classification::Valid),
            "unchecked" => Ok(Classification::Unchecked),
            "range_outlier" => Ok(Classification::RangeOutlier),
            "delta_outlier" => Ok(Classification::DeltaOutlier),
            "interval_outlier" => Ok(Classification::IntervalOutlier),
            "multiple" => Ok(Classification::Multiple),
            other => anyhow::bail!("unknown classification '{}'", other),
        }
    }
}

/// A raw stored reading. `value` is `None` when the update carried a
/// non-numeric value; the timestamp still counts for interval detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: i64,
    pub value: Option<f64>,
}

/// A stored reading joined with the classification it received when it was
/// evaluated (or `Unchecked` if it never was).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub timestamp: i64,
    pub value: Option<f64>,
    pub prior: Classification,
}

impl HistoricalPoint {
    pub fn unchecked(dp: Datapoint) -> Self {
        Self {
            timestamp: dp.timestamp,
            value: dp.value,
            prior: Classification::Unchecked,
        }
    }
}

/// Oldest and latest stored timestamps for a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapointPeriod {
    pub oldest: Option<i64>,
    pub latest: Option<i64>,
}

impl DatapointPeriod {
    /// Span between oldest and latest, or `None` when nothing is stored.
    pub fn span(&self) -> Option<i64> {
        match (self.oldest, self.latest) {
            (Some(oldest), Some(latest)) => Some(latest - oldest),
            _ => None,
        }
    }
}
