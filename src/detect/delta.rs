//! Delta strategy: flags a change from the previous value that falls outside
//! the observed range of consecutive differences.

use super::{DetectError, Extreme};
use crate::model::HistoricalPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaState {
    smallest: Extreme<f64>,
    largest: Extreme<f64>,
    previous: Extreme<f64>,
}

impl DeltaState {
    pub fn new(smallest: Extreme<f64>, largest: Extreme<f64>, previous: Extreme<f64>) -> Self {
        Self { smallest, largest, previous }
    }

    /// Rebuild from a chronologically ordered window. Points without a
    /// numeric value are dropped first, so differences span them.
    ///
    /// A difference is only learned when both of its endpoints were baseline
    /// points; a spike therefore poisons neither the jump into it nor the jump
    /// back out. The previous value is the newest numeric point in the window
    /// whatever its classification, since the next live delta is measured
    /// from it.
    pub fn recompute(window: &[HistoricalPoint], minimum_points: usize) -> Result<Self, DetectError> {
        let numeric: Vec<(Extreme<f64>, bool)> = window
            .iter()
            .filter_map(|p| p.value.map(|value| (Extreme::new(value, p.timestamp), p.prior.is_baseline())))
            .collect();
        if numeric.len() < minimum_points {
            return Err(DetectError::InsufficientData {
                needed: minimum_points,
                have: numeric.len(),
            });
        }
        let mut extremes: Option<(Extreme<f64>, Extreme<f64>)> = None;
        for pair in numeric.windows(2) {
            let ((older, older_baseline), (newer, newer_baseline)) = (pair[0], pair[1]);
            if !(older_baseline && newer_baseline) {
                continue;
            }
            let delta = Extreme::new(newer.value - older.value, newer.timestamp);
            extremes = Some(match extremes {
                None => (delta, delta),
                Some((mut smallest, mut largest)) => {
                    if delta.value <= smallest.value {
                        smallest = delta;
                    }
                    if delta.value >= largest.value {
                        largest = delta;
                    }
                    (smallest, largest)
                }
            });
        }
        let (smallest, largest) = extremes.ok_or(DetectError::InsufficientData {
            needed: minimum_points.max(2),
            have: numeric.len(),
        })?;
        let (previous, _) = numeric[numeric.len() - 1];
        Ok(Self {
            smallest,
            largest,
            previous,
        })
    }

    pub fn smallest(&self) -> Extreme<f64> {
        self.smallest
    }

    pub fn largest(&self) -> Extreme<f64> {
        self.largest
    }

    pub fn previous(&self) -> Extreme<f64> {
        self.previous
    }

    pub fn offset(&self, fraction: f64) -> f64 {
        (self.largest.value - self.smallest.value) * fraction
    }

    pub fn is_stale(&self, timestamp: i64, timespan_ms: i64) -> bool {
        let cutoff = timestamp.saturating_sub(timespan_ms);
        self.smallest.older_than(cutoff) || self.largest.older_than(cutoff)
    }

    pub fn validate(&mut self, value: f64, timestamp: i64, fraction: f64) -> bool {
        let increase = value - self.previous.value;
        let offset = self.offset(fraction);
        let valid = increase >= self.smallest.value - offset && increase <= self.largest.value + offset;
        if valid {
            self.widen(increase, timestamp);
        }
        self.previous = Extreme::new(value, timestamp);
        valid
    }

    /// Band of acceptable values given the previous value, then advances as a
    /// live observation would, learning the difference unconditionally.
    pub fn bounds(&mut self, value: f64, timestamp: i64, fraction: f64) -> (f64, f64) {
        let offset = self.offset(fraction);
        let limits = (
            self.previous.value + self.smallest.value - offset,
            self.previous.value + self.largest.value + offset,
        );
        let increase = value - self.previous.value;
        self.widen(increase, timestamp);
        self.previous = Extreme::new(value, timestamp);
        limits
    }

    fn widen(&mut self, increase: f64, timestamp: i64) {
        if increase <= self.smallest.value {
            self.smallest = Extreme::new(increase, timestamp);
        }
        if increase >= self.largest.value {
            self.largest = Extreme::new(increase, timestamp);
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

    fn state(previous: f64) -> DeltaState {
        DeltaState::new(
            Extreme::new(-5.0, 1_000),
            Extreme::new(5.0, 1_000),
            Extreme::new(previous, 1_500),
        )
    }

    #[test]
    fn test_jump_beyond_offset_is_outlier() {
        // offset = (5 - -5) * 0.2 = 2, so increases up to 7 pass.
        let mut s = state(100.0);
        assert!(!s.validate(108.0, 2_000, 0.2));
        assert_eq!(s.largest().value, 5.0);
        // Previous advances even on failure.
        assert_eq!(s.previous(), Extreme::new(108.0, 2_000));
    }

    #[test]
    fn test_jump_within_offset_widens() {
        let mut s = state(100.0);
        assert!(s.validate(106.5, 2_000, 0.2));
        assert_eq!(s.largest(), Extreme::new(6.5, 2_000));
        assert!(s.validate(100.0, 2_100, 0.2));
        assert_eq!(s.smallest(), Extreme::new(-6.5, 2_100));
    }

    #[test]
    fn test_drop_beyond_offset_is_outlier() {
        let mut s = state(100.0);
        assert!(!s.validate(92.5, 2_000, 0.2));
        assert!(s.validate(86.0, 2_100, 0.2));
    }

    #[test]
    fn test_recompute_tracks_extremes_and_previous() {
        let window = vec![
            point(10, 1.0, Classification::Unchecked),
            point(20, 4.0, Classification::Valid),
            point(30, 2.0, Classification::Valid),
            point(40, 2.5, Classification::Valid),
        ];
        let s = DeltaState::recompute(&window, 4).unwrap();
        assert_eq!(s.largest(), Extreme::new(3.0, 20));
        assert_eq!(s.smallest(), Extreme::new(-2.0, 30));
        assert_eq!(s.previous(), Extreme::new(2.5, 40));
    }

    #[test]
    fn test_recompute_skips_pairs_touching_anomalies() {
        let window = vec![
            point(10, 1.0, Classification::Valid),
            point(20, 2.0, Classification::Valid),
            point(30, 90.0, Classification::DeltaOutlier),
            point(40, 3.0, Classification::Valid),
            point(50, 3.5, Classification::Valid),
        ];
        let s = DeltaState::recompute(&window, 3).unwrap();
        assert_eq!(s.largest(), Extreme::new(1.0, 20));
        assert_eq!(s.smallest(), Extreme::new(0.5, 50));
        assert_eq!(s.previous(), Extreme::new(3.5, 50));
    }

    #[test]
    fn test_recompute_spans_text_points() {
        let text = |timestamp| HistoricalPoint { timestamp, value: None, prior: Classification::Unchecked };
        let window = vec![
            point(10, 1.0, Classification::Valid),
            text(20),
            point(30, 4.0, Classification::Valid),
            point(40, 3.0, Classification::Valid),
            text(50),
        ];
        let s = DeltaState::recompute(&window, 3).unwrap();
        assert_eq!(s.largest(), Extreme::new(3.0, 30));
        assert_eq!(s.smallest(), Extreme::new(-1.0, 40));
        assert_eq!(s.previous(), Extreme::new(3.0, 40));
        assert!(DeltaState::recompute(&window, 4).is_err());
    }

    #[test]
    fn test_recompute_needs_a_pair() {
        let window = vec![point(10, 1.0, Classification::Valid)];
        assert!(DeltaState::recompute(&window, 1).is_err());
        assert_eq!(
            DeltaState::recompute(&window, 2),
            Err(DetectError::InsufficientData { needed: 2, have: 1 })
        );
    }

    #[test]
    fn test_bounds_follow_previous() {
        let mut s = state(100.0);
        let (lower, upper) = s.bounds(103.0, 2_000, 0.2);
        assert!((lower - 93.0).abs() < 1e-9);
        assert!((upper - 107.0).abs() < 1e-9);
        let (lower, upper) = s.bounds(103.0, 2_100, 0.2);
        assert!((lower - 96.0).abs() < 1e-9);
        assert!((upper - 110.0).abs() < 1e-9);
    }
}
