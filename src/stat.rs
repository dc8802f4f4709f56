//! Exponential moving average statistics for a single sample stream
//!
//! Each tracked quantity (a timestamp difference or a spin count) keeps an
//! average, the average absolute deviation from that average, and the ratio
//! of the two. The ratio is the convergence signal used by the delay
//! estimator: once every stream's deviation is small relative to its
//! magnitude, the averages are trusted.

use serde::Serialize;
use std::fmt;

/// Exponential moving average
///
/// `alpha` is the preference for the new sample over the previous average.
#[inline]
pub fn exp_moving_avg(alpha: f64, sample: f64, prev_avg: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * prev_avg
}

/// Statistics for one variable
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stat {
    pub avg: f64,
    pub avg_dev: f64,
    pub dev_ratio: f64,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new sample into the averages
    pub fn update(&mut self, alpha: f64, sample: f64) {
        self.avg = exp_moving_avg(alpha, sample, self.avg);
        self.avg_dev = exp_moving_avg(alpha, (self.avg - sample).abs(), self.avg_dev);
        self.dev_ratio = if self.avg != 0.0 {
            (self.avg_dev / self.avg).abs()
        } else {
            0.0
        };
    }

    /// Zero the averages
    ///
    /// `dev_ratio` is left alone; it is recomputed by the next update.
    pub fn reset(&mut self) {
        self.avg = 0.0;
        self.avg_dev = 0.0;
    }

    /// Render with a unit suffix, e.g. `{ avg = 120ns, avg_dev = 4ns, dev_ratio = 0.03 }`
    pub fn display_with_unit<'a>(&'a self, unit: &'a str) -> StatDisplay<'a> {
        StatDisplay { stat: self, unit }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display_with_unit("").fmt(f)
    }
}

/// Helper returned by [`Stat::display_with_unit`]
pub struct StatDisplay<'a> {
    stat: &'a Stat,
    unit: &'a str,
}

impl fmt::Display for StatDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ avg = {:5.0}{unit}, avg_dev = {:5.0}{unit}, dev_ratio = {:.2} }}",
            self.stat.avg,
            self.stat.avg_dev,
            self.stat.dev_ratio,
            unit = self.unit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_from_zero() {
        let mut stat = Stat::new();
        stat.update(0.25, 100.0);

        assert_eq!(stat.avg, 25.0);
        assert_eq!(stat.avg_dev, 0.25 * 75.0);
        assert_eq!(stat.dev_ratio, 0.75);
    }

    #[test]
    fn test_zero_average_gives_zero_ratio() {
        let mut stat = Stat::new();
        stat.update(0.5, 0.0);

        assert_eq!(stat.avg, 0.0);
        assert_eq!(stat.dev_ratio, 0.0);
    }

    #[test]
    fn test_negative_samples_give_positive_ratio() {
        let mut stat = Stat::new();
        for _ in 0..10 {
            stat.update(0.5, -40.0);
        }
        stat.update(0.5, -60.0);

        assert!(stat.avg < 0.0);
        assert!(stat.dev_ratio > 0.0);
    }

    #[test]
    fn test_reset_keeps_dev_ratio() {
        let mut stat = Stat::new();
        stat.update(0.25, 100.0);
        stat.reset();

        assert_eq!(stat.avg, 0.0);
        assert_eq!(stat.avg_dev, 0.0);
        assert_eq!(stat.dev_ratio, 0.75);
    }

    #[test]
    fn test_alpha_one_tracks_last_sample() {
        let mut stat = Stat::new();
        stat.update(1.0, 7.0);
        stat.update(1.0, 3.0);

        assert_eq!(stat.avg, 3.0);
        assert_eq!(stat.avg_dev, 0.0);
    }

    #[test]
    fn test_display_with_unit() {
        let stat = Stat {
            avg: 120.0,
            avg_dev: 4.0,
            dev_ratio: 0.033,
        };
        assert_eq!(
            stat.display_with_unit("ns").to_string(),
            "{ avg =   120ns, avg_dev =     4ns, dev_ratio = 0.03 }"
        );
    }
}
