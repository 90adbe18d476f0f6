//! Narrow interfaces to the collaborators the engine depends on, plus
//! in-memory implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use uuid::Uuid;

use crate::detect::Severity;
use crate::model::{AttributeKey, Classification, Datapoint, DatapointPeriod, HistoricalPoint};
use crate::watch::Entity;

/// Read access to stored datapoints and the classifications they received.
///
/// Range queries are half-open, `[from, to)`, and return points in ascending
/// timestamp order.
pub trait HistoryStore: Send + Sync {
    fn period(&self, key: &AttributeKey) -> Result<DatapointPeriod>;

    fn query_points(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<Datapoint>>;

    fn query_classifications(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<(i64, Classification)>>;

    /// Datapoints in `[from, to)` joined with their prior classification.
    /// Points that were never classified count as `Unchecked`.
    fn window(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<HistoricalPoint>> {
        let points = self.query_points(key, from, to)?;
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let prior: HashMap<i64, Classification> = self.query_classifications(key, from, to)?.into_iter().collect();
        Ok(points
            .into_iter()
            .map(|dp| HistoricalPoint {
                timestamp: dp.timestamp,
                value: dp.value,
                prior: prior.get(&dp.timestamp).copied().unwrap_or(Classification::Unchecked),
            })
            .collect())
    }
}

pub trait ClassificationSink: Send + Sync {
    fn record_classification(&self, key: &AttributeKey, classification: Classification, timestamp: i64) -> Result<()>;
}

pub trait AlertSink: Send + Sync {
    fn create_alert(&self, title: &str, message: &str, severity: Severity) -> Result<Uuid>;

    fn assign_alert(&self, id: Uuid, assignee: &str) -> Result<()>;
}

/// Startup source of entity metadata.
pub trait WatchSource: Send + Sync {
    fn list_watched_entities(&self) -> Result<Vec<Entity>>;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Series {
    points: BTreeMap<i64, Option<f64>>,
    classifications: BTreeMap<i64, Classification>,
}

/// History store and classification sink backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryHistory {
    series: Arc<Mutex<HashMap<AttributeKey, Series>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &AttributeKey, timestamp: i64, value: impl Into<Option<f64>>) {
        lock(&self.series)
            .entry(key.clone())
            .or_default()
            .points
            .insert(timestamp, value.into());
    }

    pub fn classification_at(&self, key: &AttributeKey, timestamp: i64) -> Option<Classification> {
        lock(&self.series)
            .get(key)
            .and_then(|s| s.classifications.get(&timestamp).copied())
    }

    pub fn classifications(&self, key: &AttributeKey) -> Vec<(i64, Classification)> {
        lock(&self.series)
            .get(key)
            .map(|s| s.classifications.iter().map(|(t, c)| (*t, *c)).collect())
            .unwrap_or_default()
    }
}

impl HistoryStore for MemoryHistory {
    fn period(&self, key: &AttributeKey) -> Result<DatapointPeriod> {
        let series = lock(&self.series);
        Ok(series
            .get(key)
            .map(|s| DatapointPeriod {
                oldest: s.points.keys().next().copied(),
                latest: s.points.keys().next_back().copied(),
            })
            .unwrap_or_default())
    }

    fn query_points(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<Datapoint>> {
        if from >= to {
            return Ok(Vec::new());
        }
        let series = lock(&self.series);
        Ok(series
            .get(key)
            .map(|s| {
                s.points
                    .range(from..to)
                    .map(|(t, v)| Datapoint { timestamp: *t, value: *v })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn query_classifications(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<(i64, Classification)>> {
        if from >= to {
            return Ok(Vec::new());
        }
        let series = lock(&self.series);
        Ok(series
            .get(key)
            .map(|s| s.classifications.range(from..to).map(|(t, c)| (*t, *c)).collect())
            .unwrap_or_default())
    }
}

impl ClassificationSink for MemoryHistory {
    fn record_classification(&self, key: &AttributeKey, classification: Classification, timestamp: i64) -> Result<()> {
        lock(&self.series)
            .entry(key.clone())
            .or_default()
            .classifications
            .insert(timestamp, classification);
        Ok(())
    }
}

/// An alert captured by [`MemoryAlerts`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAlert {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub assignee: Option<String>,
}

/// Alert sink that records alerts in memory. Can be switched to fail every
/// call.
#[derive(Clone, Default)]
pub struct MemoryAlerts {
    alerts: Arc<Mutex<Vec<RecordedAlert>>>,
    failing: bool,
}

impl MemoryAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { failing: true, ..Self::default() }
    }

    pub fn alerts(&self) -> Vec<RecordedAlert> {
        lock(&self.alerts).clone()
    }
}

impl AlertSink for MemoryAlerts {
    fn create_alert(&self, title: &str, message: &str, severity: Severity) -> Result<Uuid> {
        if self.failing {
            anyhow::bail!("alert backend unavailable");
        }
        let id = Uuid::new_v4();
        lock(&self.alerts).push(RecordedAlert {
            id,
            title: title.to_string(),
            message: message.to_string(),
            severity,
            assignee: None,
        });
        Ok(id)
    }

    fn assign_alert(&self, id: Uuid, assignee: &str) -> Result<()> {
        let mut alerts = lock(&self.alerts);
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| anyhow::anyhow!("alert {} not found", id))?;
        alert.assignee = Some(assignee.to_string());
        Ok(())
    }
}

/// Watch source over a fixed entity list.
#[derive(Clone, Default)]
pub struct StaticWatchSource {
    entities: Vec<Entity>,
}

impl StaticWatchSource {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }
}

impl WatchSource for StaticWatchSource {
    fn list_watched_entities(&self) -> Result<Vec<Entity>> {
        Ok(self.entities.clone())
    }
}
