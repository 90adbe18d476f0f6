//! Range strategy: flags values outside the observed min/max band widened by
//! a percentage of its width.

use super::{DetectError, Extreme};
use crate::model::HistoricalPoint;

/// Keeps the band from collapsing to zero width on a constant series.
const EPSILON: f64 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub struct RangeState {
    min: Extreme<f64>,
    max: Extreme<f64>,
}

impl RangeState {
    pub fn new(min: Extreme<f64>, max: Extreme<f64>) -> Self {
        Self { min, max }
    }

    /// Rebuild the band from a history window. Only numeric points whose
    /// prior classification is Valid or Unchecked are considered.
    pub fn recompute(window: &[HistoricalPoint], minimum_points: usize) -> Result<Self, DetectError> {
        let numeric = window.iter().filter(|p| p.value.is_some()).count();
        if numeric < minimum_points {
            return Err(DetectError::InsufficientData {
                needed: minimum_points,
                have: numeric,
            });
        }
        let mut baseline = window
            .iter()
            .filter(|p| p.prior.is_baseline())
            .filter_map(|p| p.value.map(|value| Extreme::new(value, p.timestamp)));
        let first = baseline.next().ok_or(DetectError::InsufficientData {
            needed: minimum_points,
            have: 0,
        })?;
        let mut min = first;
        let mut max = first;
        for point in baseline {
            // Ties move the timestamp forward so the band stays fresh longer.
            if point.value <= min.value {
                min = point;
            }
            if point.value >= max.value {
                max = point;
            }
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> Extreme<f64> {
        self.min
    }

    pub fn max(&self) -> Extreme<f64> {
        self.max
    }

    pub fn deviation(&self, fraction: f64) -> f64 {
        (self.max.value - self.min.value + EPSILON) * fraction
    }

    pub fn is_stale(&self, timestamp: i64, timespan_ms: i64) -> bool {
        let cutoff = timestamp.saturating_sub(timespan_ms);
        self.min.older_than(cutoff) || self.max.older_than(cutoff)
    }

    pub fn validate(&mut self, value: f64, timestamp: i64, fraction: f64) -> bool {
        let deviation = self.deviation(fraction);
        let valid = value >= self.min.value - deviation && value <= self.max.value + deviation;
        if valid {
            self.widen(value, timestamp);
        }
        valid
    }

    /// Current band for charting; widens with `value` afterwards regardless of
    /// whether it fell inside.
    pub fn bounds(&mut self, value: f64, timestamp: i64, fraction: f64) -> (f64, f64) {
        let deviation = self.deviation(fraction);
        let limits = (self.min.value - deviation, self.max.value + deviation);
        self.widen(value, timestamp);
        limits
    }

    fn widen(&mut self, value: f64, timestamp: i64) {
        if value >= self.max.value {
            self.max = Extreme::new(value, timestamp);
        }
        if value <= self.min.value {
            self.min = Extreme::new(value, timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classification;

    fn point(timestamp: i64, value: f64, prior: Classification) -> HistoricalPoint {
        HistoricalPoint { timestamp, value: Some(value), prior }
    }

    fn band(min: f64, max: f64) -> RangeState {
        RangeState::new(Extreme::new(min, 1_000), Extreme::new(max, 2_000))
    }

    #[test]
    fn test_value_above_band_is_outlier() {
        // deviation = (20 - 10 + 0.001) * 0.1 ~ 1.0
        let mut state = band(10.0, 20.0);
        assert!(!state.validate(21.5, 3_000, 0.1));
        assert!(!state.validate(21.0005, 3_000, 0.1));
        assert_eq!(state.max().value, 20.0);
    }

    #[test]
    fn test_value_inside_band_keeps_bounds() {
        let mut state = band(10.0, 20.0);
        assert!(state.validate(19.5, 3_000, 0.1));
        assert_eq!(state.max().value, 20.0);
        assert_eq!(state.max().timestamp, 2_000);
        assert_eq!(state.min().value, 10.0);
    }

    #[test]
    fn test_valid_value_widens_band() {
        let mut state = band(10.0, 20.0);
        assert!(state.validate(20.8, 3_000, 0.1));
        assert_eq!(state.max(), Extreme::new(20.8, 3_000));
        assert!(state.validate(9.2, 4_000, 0.1));
        assert_eq!(state.min(), Extreme::new(9.2, 4_000));
    }

    #[test]
    fn test_bounds_never_shrink_between_recomputes() {
        let mut state = band(10.0, 20.0);
        let mut width = state.max().value - state.min().value;
        for (i, v) in [15.0, 20.5, 9.5, 12.0, 30.0, 21.0, 8.9].iter().enumerate() {
            state.validate(*v, 3_000 + i as i64, 0.1);
            let next = state.max().value - state.min().value;
            assert!(next >= width);
            width = next;
        }
    }

    #[test]
    fn test_recompute_excludes_prior_anomalies() {
        let window = vec![
            point(1, 12.0, Classification::Unchecked),
            point(2, 100.0, Classification::RangeOutlier),
            point(3, 18.0, Classification::Valid),
            point(4, -50.0, Classification::Multiple),
            point(5, 11.0, Classification::Valid),
        ];
        let state = RangeState::recompute(&window, 5).unwrap();
        assert_eq!(state.min(), Extreme::new(11.0, 5));
        assert_eq!(state.max(), Extreme::new(18.0, 3));
    }

    #[test]
    fn test_recompute_minimum_points_boundary() {
        let window: Vec<_> = (0..4)
            .map(|i| point(i, i as f64, Classification::Unchecked))
            .collect();
        assert!(RangeState::recompute(&window, 4).is_ok());
        assert_eq!(
            RangeState::recompute(&window[..3], 4),
            Err(DetectError::InsufficientData { needed: 4, have: 3 })
        );
    }

    #[test]
    fn test_recompute_ignores_text_points() {
        let text = |timestamp| HistoricalPoint { timestamp, value: None, prior: Classification::Unchecked };
        let window = vec![
            point(1, 12.0, Classification::Unchecked),
            text(2),
            point(3, 14.0, Classification::Valid),
            text(4),
        ];
        assert_eq!(
            RangeState::recompute(&window, 3),
            Err(DetectError::InsufficientData { needed: 3, have: 2 })
        );
        let state = RangeState::recompute(&window, 2).unwrap();
        assert_eq!(state.min(), Extreme::new(12.0, 1));
        assert_eq!(state.max(), Extreme::new(14.0, 3));
    }

    #[test]
    fn test_recompute_all_poisoned_is_insufficient() {
        let window = vec![
            point(1, 12.0, Classification::RangeOutlier),
            point(2, 13.0, Classification::RangeOutlier),
        ];
        assert!(RangeState::recompute(&window, 1).is_err());
    }

    #[test]
    fn test_staleness() {
        let state = band(10.0, 20.0);
        // Oldest support at 1_000.
        assert!(!state.is_stale(1_500, 1_000));
        assert!(!state.is_stale(2_000, 1_000));
        assert!(state.is_stale(2_001, 1_000));
    }

    #[test]
    fn test_bounds_widen_even_outside() {
        let mut state = band(10.0, 20.0);
        let (lower, upper) = state.bounds(40.0, 3_000, 0.0);
        assert!((lower - 10.0).abs() < 1e-9);
        assert!((upper - 20.0).abs() < 1e-9);
        assert_eq!(state.max().value, 40.0);
    }
}
