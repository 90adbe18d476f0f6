//! Retroactive limit computation for charting.
//!
//! Replays a strategy over stored history exactly as the live evaluator would
//! have seen it: each point is bounded by a state built only from earlier
//! points, recomputed whenever that state goes stale.

use anyhow::Result;
use serde::Serialize;

use super::{DetectError, Limits, StrategyConfig, StrategyKind, StrategyState};
use crate::model::{AttributeKey, Datapoint, HistoricalPoint};
use crate::ports::HistoryStore;

/// Replay covers this many timespans back from the latest point.
pub const REPLAY_SPAN_FACTOR: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LimitsExport {
    /// Nothing stored for the attribute yet.
    Empty,
    /// History does not yet span one timespan; no limits can be derived.
    RawOnly { points: Vec<Datapoint> },
    /// Too few numeric points in the replay window.
    Insufficient { available: usize, required: usize },
    /// `limits[i]` bounds `points[i]`, or is `None` where live evaluation
    /// would have had no baseline or the point carries no numeric value.
    Computed {
        limits: Vec<Option<Limits>>,
        points: Vec<Datapoint>,
        anomalies: Vec<Datapoint>,
    },
}

pub fn export_limits(history: &dyn HistoryStore, key: &AttributeKey, config: &StrategyConfig) -> Result<LimitsExport> {
    config.validate()?;
    if config.kind == StrategyKind::Interval {
        return Err(DetectError::LimitsUnsupported(config.kind).into());
    }

    let period = history.period(key)?;
    let (Some(oldest), Some(latest)) = (period.oldest, period.latest) else {
        return Ok(LimitsExport::Empty);
    };
    let timespan = config.timespan_ms();
    if latest - oldest < timespan {
        let points = history.query_points(key, oldest, latest.saturating_add(1))?;
        return Ok(LimitsExport::RawOnly { points });
    }

    let from = latest.saturating_sub(timespan.saturating_mul(REPLAY_SPAN_FACTOR));
    let points = history.query_points(key, from, latest.saturating_add(1))?;
    let required = config.minimum_points.saturating_mul(REPLAY_SPAN_FACTOR as usize);
    let available = points.iter().filter(|p| p.value.is_some()).count();
    if available < required {
        return Ok(LimitsExport::Insufficient { available, required });
    }

    let (limits, anomalies) = replay(config, &points)?;
    tracing::debug!(
        %key,
        strategy = %config.kind,
        bounded = limits.iter().flatten().count(),
        anomalies = anomalies.len(),
        "limits replayed"
    );
    Ok(LimitsExport::Computed {
        limits,
        points,
        anomalies,
    })
}

/// Walk `points` oldest to newest, producing one entry per point.
fn replay(config: &StrategyConfig, points: &[Datapoint]) -> Result<(Vec<Option<Limits>>, Vec<Datapoint>), DetectError> {
    // Replayed points are all treated as unclassified.
    let window: Vec<HistoricalPoint> = points.iter().copied().map(HistoricalPoint::unchecked).collect();
    let timespan = config.timespan_ms();
    let fraction = config.deviation_fraction();

    let mut state: Option<StrategyState> = None;
    let mut limits = Vec::with_capacity(points.len());
    let mut anomalies = Vec::new();

    for (i, point) in points.iter().enumerate() {
        let Some(value) = point.value else {
            limits.push(None);
            continue;
        };
        if state.as_ref().map_or(true, |s| s.is_stale(point.timestamp, timespan)) {
            let cutoff = point.timestamp.saturating_sub(timespan);
            let start = window[..i].partition_point(|p| p.timestamp < cutoff);
            // Same as live evaluation: no fresh baseline means no limits.
            state = StrategyState::recompute(config, &window[start..i]).ok();
        }
        let Some(current) = state.as_mut() else {
            limits.push(None);
            continue;
        };
        let bound = current.bounds(value, point.timestamp, fraction)?;
        if !bound.contains(value) {
            anomalies.push(*point);
        }
        limits.push(Some(bound));
    }
    Ok((limits, anomalies))
}
