//! Tunables for a fuzzy synchronisation pair
//!
//! Most tests should never need to touch these. They exist mainly for
//! debugging; if a race needs one of them changed, that is a hint the
//! value should be selected automatically at runtime instead.

use crate::error::{FzsyncError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default EMA weight of the newest sample
pub const DEFAULT_AVG_ALPHA: f64 = 0.25;
/// Default number of mandatory samples
pub const DEFAULT_MIN_SAMPLES: u32 = 1024;
/// Default maximum allowed deviation ratio
pub const DEFAULT_MAX_DEV_RATIO: f64 = 0.1;
/// Default execution time budget in seconds
pub const DEFAULT_EXEC_TIME: f64 = 150.0;
/// Default iteration budget
pub const DEFAULT_EXEC_LOOPS: u32 = 3_000_000;
/// Share of `exec_time` mandatory sampling may use up
pub const DEFAULT_SAMPLING_SLICE: f64 = 0.5;
/// Empirical multiplier applied when converting a time delay to spins
pub const DEFAULT_DELAY_SCALE: f64 = 1.1;

const MIN_SAMPLES_FLOOR: u32 = 20;
const EXEC_LOOPS_FLOOR: u32 = 20;

/// Configuration of a [`FuzzyPair`](crate::FuzzyPair)
///
/// Validated once by [`FuzzyPair::new`](crate::FuzzyPair::new) and never
/// changed afterwards.
///
/// # Example
/// ```
/// use fzsync::PairConfig;
///
/// let config = PairConfig::default()
///     .with_exec_time(30.0)
///     .with_exec_loops(100_000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    /// The rate at which old samples are forgotten, in (0, 1]
    pub avg_alpha: f64,

    /// The minimum number of statistical samples collected before a random
    /// delay may be calculated
    pub min_samples: u32,

    /// The maximum allowed proportional average deviation, in (0, 1]
    ///
    /// A ratio of average deviation to average magnitude. 0.1 allows at
    /// most 10% deviation on every tracked stream.
    pub max_dev_ratio: f64,

    /// The maximum desired execution time in seconds
    pub exec_time: f64,

    /// The maximum number of iterations to execute
    pub exec_loops: u32,

    /// Initial delay bias in spins. Negative delays thread A, positive
    /// delays thread B.
    pub delay_bias: i32,

    /// Fraction of `exec_time` after which mandatory sampling is cut short
    pub sampling_slice: f64,

    /// Multiplier applied to the random delay when converting it to spins
    pub delay_scale: f64,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            avg_alpha: DEFAULT_AVG_ALPHA,
            min_samples: DEFAULT_MIN_SAMPLES,
            max_dev_ratio: DEFAULT_MAX_DEV_RATIO,
            exec_time: DEFAULT_EXEC_TIME,
            exec_loops: DEFAULT_EXEC_LOOPS,
            delay_bias: 0,
            sampling_slice: DEFAULT_SAMPLING_SLICE,
            delay_scale: DEFAULT_DELAY_SCALE,
        }
    }
}

fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> FzsyncError {
    FzsyncError::InvalidConfig {
        field,
        value: value.to_string(),
        expected,
    }
}

/// `value` in (0, 1], rejecting NaN
fn unit_interval(field: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(out_of_range(field, value, "a value in (0, 1]"))
    }
}

impl PairConfig {
    pub fn with_avg_alpha(mut self, alpha: f64) -> Self {
        self.avg_alpha = alpha;
        self
    }

    pub fn with_min_samples(mut self, samples: u32) -> Self {
        self.min_samples = samples;
        self
    }

    pub fn with_max_dev_ratio(mut self, ratio: f64) -> Self {
        self.max_dev_ratio = ratio;
        self
    }

    pub fn with_exec_time(mut self, seconds: f64) -> Self {
        self.exec_time = seconds;
        self
    }

    pub fn with_exec_loops(mut self, loops: u32) -> Self {
        self.exec_loops = loops;
        self
    }

    pub fn with_delay_bias(mut self, bias: i32) -> Self {
        self.delay_bias = bias;
        self
    }

    pub fn with_sampling_slice(mut self, slice: f64) -> Self {
        self.sampling_slice = slice;
        self
    }

    pub fn with_delay_scale(mut self, scale: f64) -> Self {
        self.delay_scale = scale;
        self
    }

    /// Parse a TOML document; missing keys take their defaults
    ///
    /// # Example
    /// ```
    /// use fzsync::PairConfig;
    ///
    /// let config = PairConfig::from_toml_str("exec_time = 10.0\nmin_samples = 64").unwrap();
    /// assert_eq!(config.min_samples, 64);
    /// assert_eq!(config.exec_loops, 3_000_000);
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load and parse a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate every tunable
    ///
    /// Out of range values would silently corrupt the statistics later on,
    /// so callers should treat an error here as fatal.
    pub fn validate(&self) -> Result<()> {
        unit_interval("avg_alpha", self.avg_alpha)?;
        unit_interval("max_dev_ratio", self.max_dev_ratio)?;
        unit_interval("sampling_slice", self.sampling_slice)?;

        if self.min_samples < MIN_SAMPLES_FLOOR || self.min_samples > i32::MAX as u32 {
            return Err(out_of_range(
                "min_samples",
                self.min_samples,
                "an integer in [20, 2147483647]",
            ));
        }

        if !(self.exec_time >= 1.0 && self.exec_time.is_finite()) {
            return Err(out_of_range(
                "exec_time",
                self.exec_time,
                "a finite number of seconds >= 1",
            ));
        }

        if self.exec_loops < EXEC_LOOPS_FLOOR {
            return Err(out_of_range("exec_loops", self.exec_loops, "an integer >= 20"));
        }

        if !(self.delay_scale > 0.0 && self.delay_scale.is_finite()) {
            return Err(out_of_range("delay_scale", self.delay_scale, "a finite value > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PairConfig::default();
        assert_eq!(config.avg_alpha, 0.25);
        assert_eq!(config.min_samples, 1024);
        assert_eq!(config.max_dev_ratio, 0.1);
        assert_eq!(config.exec_time, 150.0);
        assert_eq!(config.exec_loops, 3_000_000);
        assert_eq!(config.delay_bias, 0);
        assert_eq!(config.sampling_slice, 0.5);
        assert_eq!(config.delay_scale, 1.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimum_legal_values() {
        let config = PairConfig::default()
            .with_min_samples(20)
            .with_exec_loops(20)
            .with_exec_time(1.0)
            .with_avg_alpha(1.0)
            .with_max_dev_ratio(1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_avg_alpha() {
        for alpha in [0.0, -0.1, 1.5, f64::NAN] {
            let err = PairConfig::default().with_avg_alpha(alpha).validate();
            assert!(
                matches!(err, Err(FzsyncError::InvalidConfig { field: "avg_alpha", .. })),
                "alpha {alpha} accepted"
            );
        }
    }

    #[test]
    fn test_invalid_max_dev_ratio() {
        let err = PairConfig::default().with_max_dev_ratio(0.0).validate();
        assert!(matches!(
            err,
            Err(FzsyncError::InvalidConfig { field: "max_dev_ratio", .. })
        ));
    }

    #[test]
    fn test_invalid_min_samples() {
        let err = PairConfig::default().with_min_samples(19).validate();
        assert!(matches!(
            err,
            Err(FzsyncError::InvalidConfig { field: "min_samples", .. })
        ));

        let err = PairConfig::default().with_min_samples(u32::MAX).validate();
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_exec_time() {
        for secs in [0.5, f64::INFINITY, f64::NAN] {
            let err = PairConfig::default().with_exec_time(secs).validate();
            assert!(matches!(
                err,
                Err(FzsyncError::InvalidConfig { field: "exec_time", .. })
            ));
        }
    }

    #[test]
    fn test_invalid_exec_loops() {
        let err = PairConfig::default().with_exec_loops(19).validate();
        assert!(matches!(
            err,
            Err(FzsyncError::InvalidConfig { field: "exec_loops", .. })
        ));
    }

    #[test]
    fn test_invalid_overridable_constants() {
        assert!(PairConfig::default().with_sampling_slice(0.0).validate().is_err());
        assert!(PairConfig::default().with_delay_scale(-1.1).validate().is_err());
    }

    #[test]
    fn test_negative_bias_is_valid() {
        assert!(PairConfig::default().with_delay_bias(-500).validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = PairConfig::from_toml_str(
            r#"
            avg_alpha = 0.5
            exec_loops = 5000
            delay_bias = -3
            "#,
        )
        .unwrap();

        assert_eq!(config.avg_alpha, 0.5);
        assert_eq!(config.exec_loops, 5000);
        assert_eq!(config.delay_bias, -3);
        assert_eq!(config.min_samples, DEFAULT_MIN_SAMPLES);
    }

    #[test]
    fn test_from_toml_rejects_wrong_type() {
        let err = PairConfig::from_toml_str("exec_loops = \"many\"");
        assert!(matches!(err, Err(FzsyncError::ConfigParse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "exec_time = 12.0").unwrap();

        let config = PairConfig::from_file(file.path()).unwrap();
        assert_eq!(config.exec_time, 12.0);
    }

    #[test]
    fn test_from_missing_file() {
        let err = PairConfig::from_file("/nonexistent/fzsync.toml");
        assert!(matches!(err, Err(FzsyncError::ConfigIo(_))));
    }
}
