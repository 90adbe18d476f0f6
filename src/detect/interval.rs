//! Interval strategy: flags updates that arrive abnormally late compared to
//! the observed gaps between consecutive timestamps.

use super::{DetectError, Extreme};
use crate::model::HistoricalPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalState {
    shortest: Extreme<i64>,
    longest: Extreme<i64>,
    previous: i64,
}

impl IntervalState {
    pub fn new(shortest: Extreme<i64>, longest: Extreme<i64>, previous: i64) -> Self {
        Self { shortest, longest, previous }
    }

    /// Rebuild from a chronologically ordered window. Only timestamps are
    /// read, so points with non-numeric values count. Gaps touching a point
    /// that was previously flagged are not learned.
    pub fn recompute(window: &[HistoricalPoint], minimum_points: usize) -> Result<Self, DetectError> {
        if window.len() < minimum_points {
            return Err(DetectError::InsufficientData {
                needed: minimum_points,
                have: window.len(),
            });
        }
        let mut extremes: Option<(Extreme<i64>, Extreme<i64>)> = None;
        for pair in window.windows(2) {
            let (older, newer) = (&pair[0], &pair[1]);
            if !(older.prior.is_baseline() && newer.prior.is_baseline()) {
                continue;
            }
            let gap = Extreme::new(newer.timestamp - older.timestamp, newer.timestamp);
            extremes = Some(match extremes {
                None => (gap, gap),
                Some((mut shortest, mut longest)) => {
                    if gap.value <= shortest.value {
                        shortest = gap;
                    }
                    if gap.value >= longest.value {
                        longest = gap;
                    }
                    (shortest, longest)
                }
            });
        }
        let (shortest, longest) = extremes.ok_or(DetectError::InsufficientData {
            needed: minimum_points.max(2),
            have: window.len(),
        })?;
        Ok(Self {
            shortest,
            longest,
            previous: window[window.len() - 1].timestamp,
        })
    }

    pub fn shortest(&self) -> Extreme<i64> {
        self.shortest
    }

    pub fn longest(&self) -> Extreme<i64> {
        self.longest
    }

    pub fn previous(&self) -> i64 {
        self.previous
    }

    pub fn offset(&self, fraction: f64) -> f64 {
        ((self.longest.value - self.shortest.value + 1) as f64 * fraction).abs()
    }

    pub fn is_stale(&self, timestamp: i64, timespan_ms: i64) -> bool {
        let cutoff = timestamp.saturating_sub(timespan_ms);
        self.shortest.older_than(cutoff) || self.longest.older_than(cutoff)
    }

    /// Only an upper gap bound is enforced; bursts of updates always pass.
    pub fn validate(&mut self, timestamp: i64, fraction: f64) -> Result<bool, DetectError> {
        if timestamp < self.previous {
            return Err(DetectError::OutOfOrder {
                timestamp,
                previous: self.previous,
            });
        }
        let gap = timestamp - self.previous;
        let valid = gap as f64 <= self.longest.value as f64 + self.offset(fraction);
        if valid {
            if gap <= self.shortest.value {
                self.shortest = Extreme::new(gap, timestamp);
            }
            if gap >= self.longest.value {
                self.longest = Extreme::new(gap, timestamp);
            }
        }
        self.previous = timestamp;
        Ok(valid)
    }
}
