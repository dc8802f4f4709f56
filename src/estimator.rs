//! Delay estimation: the "fuzz" in fuzzy sync
//!
//! Imagine the following timelines in threads A and B:
//!
//! ```text
//!  start_race_a
//!      ^                    end_race_a (a)
//!      |                        ^
//!      |                        |
//!  - --+------------------------+-- - -
//!      |        Syscall A       |                 Thread A
//!  - --+------------------------+-- - -
//!  - --+----------------+-------+-- - -
//!      |   Syscall B    | spin  |                 Thread B
//!  - --+----------------+-------+-- - -
//!      |                |
//!      ^                ^
//!  start_race_b     end_race_b
//! ```
//!
//! The start markers line up the entry of both calls. If the race lives in
//! the exit paths and `end_race_a - end_race_b` is large compared to the
//! variation in call times, it will practically never be hit. So once the
//! timings are known, a random delay is injected before one of the calls:
//!
//! ```text
//!  - --+------------------------+-- - -
//!      |        Syscall A       |                 Thread A
//!  - --+------------------------+-- - -
//!  - --+-------+----------------+-- - -
//!      | delay |   Syscall B    |                 Thread B
//!  - --+-------+----------------+-- - -
//! ```
//!
//! The delay range is chosen so that any point in call A can be lined up with
//! any point in call B: from `-(B's duration)` (delay A until B's exit meets
//! A's entry) to `+(A's duration)` (delay B until A's exit meets B's entry).
//! The range may be too large for a linear search, so a uniform random value
//! is drawn from it each iteration.
//!
//! Delays are applied as busy-wait spins. The time a single spin takes is
//! estimated from the number of spins one thread spends waiting for the other
//! in the end marker, divided by the difference in end times. This assumes
//! that difference is significant; when both calls end at nearly the same
//! time no delay can be computed.
//!
//! All times and counts are exponential moving averages. A mandatory
//! sampling period collects at least `min_samples` samples; after that,
//! sampling continues until every deviation ratio drops below
//! `max_dev_ratio`, then the statistics are frozen.

use crate::config::PairConfig;
use crate::random::UniformSource;
use crate::stat::Stat;
use serde::Serialize;

/// Timestamps and spin count gathered during one iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationSample {
    pub a_start: i64,
    pub b_start: i64,
    pub a_end: i64,
    pub b_end: i64,
    pub spins: i32,
}

/// Where the estimator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Collecting the first `min_samples` samples
    MandatorySampling { remaining: i64 },
    /// Still sampling because some deviation ratio is too high
    Converging,
    /// Statistics frozen, random delays applied
    Steady,
    /// End times indistinguishable, no delay can be computed
    Degenerate,
}

/// One-time transitions worth reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorEvent {
    /// The last mandatory sample was collected
    SamplingEnded,
    /// Deviation ratios are low enough; delays are now drawn from the range
    RandomnessIntroduced { min_delay: i64, max_delay: i64 },
    /// `|diff_ab.avg| < 1`, so spins cannot be converted to time
    DelayUnavailable,
}

/// Result of one estimator pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    /// Spins to delay; negative delays thread A, positive delays thread B
    pub delay: i32,
    pub event: Option<EstimatorEvent>,
}

/// Statistics and delay state owned by thread A
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    /// start_a - start_b
    pub diff_ss: Stat,
    /// end_a - start_a
    pub diff_sa: Stat,
    /// end_b - start_b
    pub diff_sb: Stat,
    /// end_a - end_b
    pub diff_ab: Stat,
    /// Spins spent waiting for the slower thread
    pub spins_avg: Stat,

    /// Remaining mandatory samples when positive, otherwise a phase marker
    sampling: i64,
    delay_bias: i32,
}

impl DelayEstimator {
    pub fn new(config: &PairConfig) -> Self {
        Self {
            diff_ss: Stat::new(),
            diff_sa: Stat::new(),
            diff_sb: Stat::new(),
            diff_ab: Stat::new(),
            spins_avg: Stat::new(),
            sampling: i64::from(config.min_samples),
            delay_bias: config.delay_bias,
        }
    }

    /// Zero the averages and restart mandatory sampling
    ///
    /// The accumulated delay bias survives a reset.
    pub fn reset(&mut self, config: &PairConfig) {
        for stat in self.stats_mut() {
            stat.reset();
        }
        self.sampling = i64::from(config.min_samples);
    }

    fn stats(&self) -> [&Stat; 5] {
        [
            &self.diff_ss,
            &self.diff_sa,
            &self.diff_sb,
            &self.diff_ab,
            &self.spins_avg,
        ]
    }

    fn stats_mut(&mut self) -> [&mut Stat; 5] {
        [
            &mut self.diff_ss,
            &mut self.diff_sa,
            &mut self.diff_sb,
            &mut self.diff_ab,
            &mut self.spins_avg,
        ]
    }

    pub fn sampling(&self) -> i64 {
        self.sampling
    }

    pub fn delay_bias(&self) -> i32 {
        self.delay_bias
    }

    /// Still inside the mandatory sampling period
    pub fn is_sampling(&self) -> bool {
        self.sampling > 0
    }

    /// Cut the mandatory sampling period short
    pub fn end_sampling(&mut self) {
        self.sampling = 0;
    }

    /// Add to the delay bias; ignored once mandatory sampling has ended
    ///
    /// A positive change delays thread B, a negative one thread A. Intended
    /// for races where one of the calls completes much faster when the two
    /// happen in the wrong order, which produces samples that are useless
    /// for finding the real window. The caller detects those (e.g. from an
    /// error code) and shifts the bias before the statistics settle.
    pub fn add_bias(&mut self, change: i32) {
        if self.sampling > 0 {
            self.delay_bias = self.delay_bias.saturating_add(change);
        }
    }

    fn over_max_dev(&self, max_dev: f64) -> bool {
        self.stats().iter().any(|s| s.dev_ratio > max_dev)
    }

    pub fn phase(&self, config: &PairConfig) -> Phase {
        if self.sampling > 0 {
            Phase::MandatorySampling {
                remaining: self.sampling,
            }
        } else if self.over_max_dev(config.max_dev_ratio) {
            Phase::Converging
        } else if self.diff_ab.avg.abs() >= 1.0 {
            Phase::Steady
        } else {
            Phase::Degenerate
        }
    }

    /// Average duration of one spin, in nanoseconds
    fn per_spin_time(&self) -> f64 {
        self.diff_ab.avg.abs() / self.spins_avg.avg.max(1.0)
    }

    /// Run one pass: update the statistics or pick a delay
    pub fn update(
        &mut self,
        config: &PairConfig,
        sample: &IterationSample,
        random: &mut dyn UniformSource,
    ) -> Estimate {
        let alpha = config.avg_alpha;
        let mut delay = self.delay_bias;
        let mut event = None;

        if self.sampling > 0 || self.over_max_dev(config.max_dev_ratio) {
            self.diff_ss
                .update(alpha, (sample.a_start - sample.b_start) as f64);
            self.diff_sa.update(alpha, (sample.a_end - sample.a_start) as f64);
            self.diff_sb.update(alpha, (sample.b_end - sample.b_start) as f64);
            self.diff_ab.update(alpha, (sample.a_end - sample.b_end) as f64);
            self.spins_avg.update(alpha, f64::from(sample.spins));

            if self.sampling > 0 {
                self.sampling -= 1;
                if self.sampling == 0 {
                    event = Some(EstimatorEvent::SamplingEnded);
                }
            }
        } else if self.diff_ab.avg.abs() >= 1.0 {
            let per_spin_time = self.per_spin_time();
            let d = random.next_unit();
            let time_delay = d * (self.diff_sa.avg + self.diff_sb.avg) - self.diff_sb.avg;
            let spins = (config.delay_scale * time_delay / per_spin_time).round() as i32;
            delay = delay.saturating_add(spins);

            if self.sampling == 0 {
                let bias = i64::from(self.delay_bias);
                event = Some(EstimatorEvent::RandomnessIntroduced {
                    min_delay: -((self.diff_sb.avg / per_spin_time) as i64 + bias),
                    max_delay: (self.diff_sa.avg / per_spin_time) as i64 - bias,
                });
                self.sampling = -1;
            }
        } else if self.sampling == 0 {
            event = Some(EstimatorEvent::DelayUnavailable);
            self.sampling = -1;
        }

        Estimate { delay, event }
    }
}
