//! The state of a two way synchronisation or race
//!
//! Thread A owns a [`FuzzyPair`]: the validated configuration, the delay
//! estimator, the loop budget and the worker handle. Everything both threads
//! touch lives in an `Arc`'d block of atomics which thread B reaches through
//! a [`PairB`] handle.
//!
//! ```no_run
//! use fzsync::{FuzzyPair, PairConfig, WorkerBody};
//!
//! let mut pair = FuzzyPair::new(PairConfig::default().with_exec_time(10.0))?;
//!
//! // SAFETY: the body only spins and calls pair operations.
//! let run_b = unsafe {
//!     WorkerBody::new(|b| {
//!         while b.run_b() {
//!             b.start_race_b();
//!             // something which can race with the call in A
//!             b.end_race_b();
//!         }
//!     })
//! };
//!
//! pair.reset(Some(run_b))?;
//! while pair.run_a() {
//!     // setup which must happen before the race
//!     pair.start_race_a();
//!     // the dodgy call
//!     pair.end_race_a();
//! }
//! # Ok::<(), fzsync::FzsyncError>(())
//! ```
//!
//! `run_a`/`run_b` and the race markers block until both threads have
//! entered them, and may each be called once per iteration. Extra
//! synchronisation points can be added with [`FuzzyPair::wait_a`] and
//! [`PairB::wait_b`].

use crate::barrier::{self, AtomicI32, Rendezvous, Side, YieldFn};
use crate::clock;
use crate::config::PairConfig;
use crate::error::Result;
use crate::estimator::{DelayEstimator, EstimatorEvent, IterationSample, Phase};
use crate::random::{StdRandom, UniformSource};
use crate::stat::Stat;
use crate::worker::{Worker, WorkerExit, STOP_GRACE};
use serde::Serialize;
use std::fmt;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// State visible to both threads
#[derive(Debug)]
struct Shared {
    rendezvous: Rendezvous,
    exit: AtomicBool,
    delay: AtomicI32,
    spins: AtomicI32,

    // Written on one side of a rendezvous and read on the other, which
    // orders them; relaxed access is enough.
    a_start: AtomicI64,
    b_start: AtomicI64,
    a_end: AtomicI64,
    b_end: AtomicI64,
}

impl Shared {
    fn new(yield_now: YieldFn) -> Self {
        Self {
            rendezvous: Rendezvous::with_yield(yield_now),
            exit: AtomicBool::new(false),
            delay: AtomicI32::new(0),
            spins: AtomicI32::new(0),
            a_start: AtomicI64::new(0),
            b_start: AtomicI64::new(0),
            a_end: AtomicI64::new(0),
            b_end: AtomicI64::new(0),
        }
    }

    fn sample(&self) -> IterationSample {
        IterationSample {
            a_start: self.a_start.load(Ordering::Relaxed),
            b_start: self.b_start.load(Ordering::Relaxed),
            a_end: self.a_end.load(Ordering::Relaxed),
            b_end: self.b_end.load(Ordering::Relaxed),
            spins: self.spins.load(Ordering::SeqCst),
        }
    }

    fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

/// Record the current time, keeping the previous value if the clock fails
#[inline]
fn stamp(slot: &AtomicI64) {
    if let Ok(now) = clock::now_ns() {
        slot.store(now, Ordering::Relaxed);
    }
}

/// The body of thread B, started by [`FuzzyPair::reset`]
pub struct WorkerBody(Box<dyn FnOnce(PairB) + Send + 'static>);

impl WorkerBody {
    /// Wrap the closure thread B will run
    ///
    /// # Safety
    ///
    /// If thread A leaves its loop without `run_a` returning `false`, thread
    /// B is cancelled asynchronously after a grace period and may stop at
    /// any instruction. The closure must not hold locks, file descriptors or
    /// other resources whose release matters, must tolerate its destructors
    /// never running, and must not panic (a panic aborts the process).
    pub unsafe fn new<F>(body: F) -> Self
    where
        F: FnOnce(PairB) + Send + 'static,
    {
        Self(Box::new(body))
    }
}

impl fmt::Debug for WorkerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkerBody")
    }
}

/// Pluggable platform hooks
pub struct Hooks {
    /// Called on every spin of a rendezvous wait
    pub yield_now: YieldFn,
    /// Source of the random draw used to pick each delay
    pub random: Box<dyn UniformSource>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            yield_now: barrier::default_yield,
            random: Box::new(StdRandom::from_entropy()),
        }
    }
}

/// Thread A's side of a pair
pub struct FuzzyPair {
    config: PairConfig,
    shared: Arc<Shared>,
    estimator: DelayEstimator,
    random: Box<dyn UniformSource>,
    exec_time_start: i64,
    exec_loop: u64,
    thread_b: Option<Worker>,
}

/// Thread B's side of a pair
#[derive(Clone)]
pub struct PairB {
    shared: Arc<Shared>,
}

impl FuzzyPair {
    /// Validate `config` and create an idle pair
    ///
    /// Call [`reset`](Self::reset) before entering the loop.
    pub fn new(config: PairConfig) -> Result<Self> {
        Self::with_hooks(config, Hooks::default())
    }

    pub fn with_hooks(config: PairConfig, hooks: Hooks) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            estimator: DelayEstimator::new(&config),
            config,
            shared: Arc::new(Shared::new(hooks.yield_now)),
            random: hooks.random,
            exec_time_start: 0,
            exec_loop: 0,
            thread_b: None,
        })
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    /// A handle for a thread B managed by the caller
    pub fn handle_b(&self) -> PairB {
        PairB {
            shared: self.shared.clone(),
        }
    }

    /// Reset or initialise the pair
    ///
    /// Stops any previous thread B, zeroes the statistics and counters, and
    /// starts `run_b` as the new thread B. Pass `None` to manage thread B
    /// yourself through [`handle_b`](Self::handle_b).
    pub fn reset(&mut self, run_b: Option<WorkerBody>) -> Result<()> {
        if let Err(e) = self.cleanup() {
            tracing::warn!("Failed to stop previous thread B: {}", e);
        }

        self.estimator.reset(&self.config);
        self.shared.delay.store(0, Ordering::SeqCst);
        self.shared.spins.store(0, Ordering::SeqCst);
        self.exec_loop = 0;

        self.shared.rendezvous.reset();
        self.shared.exit.store(false, Ordering::SeqCst);

        if let Some(WorkerBody(body)) = run_b {
            let handle = self.handle_b();
            // SAFETY: `WorkerBody::new` carries the cancellation contract.
            let worker = unsafe { Worker::spawn(move || body(handle)) }?;
            self.thread_b = Some(worker);
        }

        self.exec_time_start = clock::now_ns()?;
        tracing::debug!(
            min_samples = self.config.min_samples,
            exec_time = self.config.exec_time,
            exec_loops = self.config.exec_loops,
            "Pair reset"
        );

        Ok(())
    }

    /// Exit and join thread B if necessary
    ///
    /// If thread A broke out of its loop early, thread B is told to exit,
    /// given [`STOP_GRACE`] to do so and then cancelled. The handle is
    /// dropped whatever the outcome.
    pub fn cleanup(&mut self) -> Result<Option<WorkerExit>> {
        let Some(worker) = self.thread_b.take() else {
            return Ok(None);
        };

        if !self.shared.exiting() {
            self.shared.exit.store(true, Ordering::SeqCst);
            if !worker.wait_finished(STOP_GRACE) {
                tracing::debug!("Thread B did not exit in time, cancelling");
                if let Err(e) = worker.force_stop() {
                    tracing::warn!("{}, joining anyway", e);
                }
            }
        }

        let exit = worker.join()?;
        tracing::debug!(?exit, "Joined thread B");
        Ok(Some(exit))
    }

    /// Approximate whole seconds left, rounding a final fraction up to 1
    pub fn remaining_time(&self) -> u64 {
        let now = clock::now_ns().unwrap_or(self.exec_time_start);
        remaining_secs(self.config.exec_time, now.saturating_sub(self.exec_time_start))
    }

    /// Loop index of the current iteration
    pub fn exec_loop(&self) -> u64 {
        self.exec_loop
    }

    pub fn phase(&self) -> Phase {
        self.estimator.phase(&self.config)
    }

    pub fn delay_bias(&self) -> i32 {
        self.estimator.delay_bias()
    }

    /// Spins applied in the current iteration
    pub fn delay(&self) -> i32 {
        self.shared.delay.load(Ordering::SeqCst)
    }

    pub fn estimator(&self) -> &DelayEstimator {
        &self.estimator
    }

    /// Decide whether the budget allows another iteration
    fn budget_exhausted(&mut self) -> bool {
        let remaining = self.remaining_time();
        let mut exit = false;

        if self.config.exec_time * self.config.sampling_slice > remaining as f64
            && self.estimator.is_sampling()
        {
            tracing::info!(
                "Stopped sampling at {} (out of {}) samples, sampling time reached {:.0}% of the total time limit",
                self.exec_loop,
                self.config.min_samples,
                self.config.sampling_slice * 100.0
            );
            self.estimator.end_sampling();
            self.log_info();
        }

        if remaining == 0 {
            tracing::info!("Exceeded execution time, requesting exit");
            exit = true;
        }

        self.exec_loop += 1;
        if self.exec_loop > u64::from(self.config.exec_loops) {
            tracing::info!("Exceeded execution loops, requesting exit");
            exit = true;
        }

        exit
    }

    /// Decide whether to continue running thread A
    ///
    /// Always meets thread B at a rendezvous, so B learns the decision in
    /// the same iteration. Returns `false` once the time or loop budget is
    /// spent, after thread B has been joined.
    pub fn run_a(&mut self) -> bool {
        let exit = self.budget_exhausted();

        self.shared.exit.store(exit, Ordering::SeqCst);
        self.wait_a();

        if exit {
            if let Err(e) = self.cleanup() {
                tracing::warn!("Failed to join thread B: {}", e);
            }
            return false;
        }

        true
    }

    /// Pick this iteration's delay from the previous iteration's timings
    fn update(&mut self) {
        let sample = self.shared.sample();
        let estimate = self
            .estimator
            .update(&self.config, &sample, self.random.as_mut());
        self.shared.delay.store(estimate.delay, Ordering::SeqCst);

        match estimate.event {
            Some(EstimatorEvent::SamplingEnded) => {
                tracing::info!("Minimum sampling period ended");
                self.log_info();
            }
            Some(EstimatorEvent::RandomnessIntroduced {
                min_delay,
                max_delay,
            }) => {
                tracing::info!(
                    "Reached deviation ratios < {:.2}, introducing randomness",
                    self.config.max_dev_ratio
                );
                tracing::info!("Delay range is [{}, {}]", min_delay, max_delay);
                self.log_info();
            }
            Some(EstimatorEvent::DelayUnavailable) => {
                tracing::info!("Can't calculate random delay");
                self.log_info();
            }
            None => {}
        }

        self.shared.spins.store(0, Ordering::SeqCst);
    }

    /// Marks the start of a race region in thread A
    ///
    /// Place it just before the call which may race; a matching
    /// [`PairB::start_race_b`] must be made in thread B.
    pub fn start_race_a(&mut self) {
        self.update();
        self.wait_a();

        let mut delay = self.shared.delay.load(Ordering::SeqCst);
        while delay < 0 {
            delay = black_box(delay + 1);
        }

        stamp(&self.shared.a_start);
    }

    /// Marks the end of a race region in thread A
    pub fn end_race_a(&mut self) {
        stamp(&self.shared.a_end);
        self.shared
            .rendezvous
            .wait(Side::A, Some(&self.shared.spins));
    }

    /// Wait for thread B at an extra synchronisation point
    pub fn wait_a(&self) {
        self.shared.rendezvous.wait_a();
    }

    /// Add some amount to the delay bias
    ///
    /// A positive change delays thread B and a negative one thread A. Only
    /// has an effect during the mandatory sampling period.
    pub fn add_bias(&mut self, change: i32) {
        self.estimator.add_bias(change);
    }

    /// Snapshot of the synchronisation statistics
    pub fn info(&self) -> PairSnapshot {
        PairSnapshot {
            exec_loop: self.exec_loop,
            delay_bias: self.estimator.delay_bias(),
            delay: self.delay(),
            phase: self.phase(),
            diff_ss: self.estimator.diff_ss,
            diff_sa: self.estimator.diff_sa,
            diff_sb: self.estimator.diff_sb,
            diff_ab: self.estimator.diff_ab,
            spins_avg: self.estimator.spins_avg,
        }
    }

    /// Emit the statistics snapshot as diagnostic lines
    pub fn log_info(&self) {
        let info = self.info();
        tracing::info!("loop = {}, delay_bias = {}", info.exec_loop, info.delay_bias);
        for (name, unit, stat) in info.rows() {
            tracing::info!("{:<17}: {}", name, stat.display_with_unit(unit));
        }
    }
}

impl Drop for FuzzyPair {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!("Failed to stop thread B on drop: {}", e);
        }
    }
}

impl fmt::Debug for FuzzyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuzzyPair")
            .field("config", &self.config)
            .field("exec_loop", &self.exec_loop)
            .field("phase", &self.phase())
            .field("thread_b", &self.thread_b.is_some())
            .finish()
    }
}

impl PairB {
    /// Decide whether to continue running thread B
    pub fn run_b(&self) -> bool {
        self.wait_b();
        !self.shared.exiting()
    }

    /// Marks the start of a race region in thread B
    pub fn start_race_b(&self) {
        self.wait_b();

        let mut delay = self.shared.delay.load(Ordering::SeqCst);
        while delay > 0 {
            delay = black_box(delay - 1);
        }

        stamp(&self.shared.b_start);
    }

    /// Marks the end of a race region in thread B
    pub fn end_race_b(&self) {
        stamp(&self.shared.b_end);
        self.shared
            .rendezvous
            .wait(Side::B, Some(&self.shared.spins));
    }

    /// Wait for thread A at an extra synchronisation point
    pub fn wait_b(&self) {
        self.shared.rendezvous.wait_b();
    }

    /// The pair has been told to exit
    pub fn exiting(&self) -> bool {
        self.shared.exiting()
    }
}

impl fmt::Debug for PairB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairB")
            .field("laps", &self.shared.rendezvous.laps())
            .finish()
    }
}

/// Whole seconds left of `exec_time` after `elapsed_ns`
///
/// A remaining fraction of a second reports as 1, so sub-second
/// granularity never produces a premature "no time left".
pub fn remaining_secs(exec_time: f64, elapsed_ns: i64) -> u64 {
    let elapsed = elapsed_ns.max(0) as f64 / 1e9;
    let remaining = exec_time - elapsed;

    if remaining <= 0.0 {
        return 0;
    }

    let whole = remaining.trunc() as u64;
    if whole > 0 {
        whole
    } else {
        1
    }
}

/// Point-in-time view of a pair's statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairSnapshot {
    pub exec_loop: u64,
    pub delay_bias: i32,
    pub delay: i32,
    pub phase: Phase,
    pub diff_ss: Stat,
    pub diff_sa: Stat,
    pub diff_sb: Stat,
    pub diff_ab: Stat,
    pub spins_avg: Stat,
}

impl PairSnapshot {
    /// `(label, unit, stat)` for each tracked stream
    pub fn rows(&self) -> [(&'static str, &'static str, &Stat); 5] {
        [
            ("start_a - start_b", "ns", &self.diff_ss),
            ("end_a - start_a", "ns", &self.diff_sa),
            ("end_b - start_b", "ns", &self.diff_sb),
            ("end_a - end_b", "ns", &self.diff_ab),
            ("spins", "  ", &self.spins_avg),
        ]
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for PairSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "loop = {}, delay_bias = {}", self.exec_loop, self.delay_bias)?;
        for (name, unit, stat) in self.rows() {
            writeln!(f, "{:<17}: {}", name, stat.display_with_unit(unit))?;
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::random::FixedDraw;
    use std::thread;

    const SEC: i64 = 1_000_000_000;

    fn small_config() -> PairConfig {
        PairConfig::default()
            .with_min_samples(20)
            .with_exec_loops(20)
            .with_exec_time(10.0)
    }

    #[test]
    fn test_remaining_secs() {
        assert_eq!(remaining_secs(150.0, 0), 150);
        assert_eq!(remaining_secs(150.0, 10 * SEC), 140);
        assert_eq!(remaining_secs(150.0, 10 * SEC + 1), 139);
        assert_eq!(remaining_secs(1.0, SEC / 2), 1);
        assert_eq!(remaining_secs(1.0, SEC - 1), 1);
        assert_eq!(remaining_secs(1.0, SEC), 0);
        assert_eq!(remaining_secs(1.0, 5 * SEC), 0);
        assert_eq!(remaining_secs(2.5, SEC), 1);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = FuzzyPair::new(PairConfig::default().with_exec_loops(1));
        assert!(err.is_err());
    }

    #[test]
    fn test_reset_without_worker() {
        let mut pair = FuzzyPair::new(small_config()).unwrap();
        pair.reset(None).unwrap();

        assert_eq!(pair.exec_loop(), 0);
        assert_eq!(pair.phase(), Phase::MandatorySampling { remaining: 20 });
        assert!(pair.remaining_time() >= 9);
        assert_eq!(pair.cleanup().unwrap(), None);
    }

    #[test]
    fn test_budget_by_loop_count() {
        let mut pair = FuzzyPair::new(small_config()).unwrap();
        pair.reset(None).unwrap();

        for _ in 0..20 {
            assert!(!pair.budget_exhausted());
        }
        assert!(pair.budget_exhausted());
    }

    #[test]
    fn test_budget_by_time() {
        let mut pair = FuzzyPair::new(small_config().with_exec_loops(1000)).unwrap();
        pair.reset(None).unwrap();
        pair.exec_time_start -= 11 * SEC;

        assert!(pair.budget_exhausted());
    }

    #[test]
    fn test_sampling_cut_short_at_half_time() {
        let mut pair = FuzzyPair::new(small_config().with_exec_loops(1000)).unwrap();
        pair.reset(None).unwrap();
        assert!(pair.estimator.is_sampling());

        // 4 of 10 seconds used: still sampling
        pair.exec_time_start -= 4 * SEC;
        assert!(!pair.budget_exhausted());
        assert!(pair.estimator.is_sampling());

        // 6 of 10 seconds used: cut short, but keep running
        pair.exec_time_start -= 2 * SEC;
        assert!(!pair.budget_exhausted());
        assert_eq!(pair.estimator.sampling(), 0);
    }

    #[test]
    fn test_add_bias_only_while_sampling() {
        let mut pair = FuzzyPair::new(small_config()).unwrap();
        pair.reset(None).unwrap();

        pair.add_bias(10);
        assert_eq!(pair.delay_bias(), 10);

        pair.estimator.end_sampling();
        pair.add_bias(10);
        assert_eq!(pair.delay_bias(), 10);
    }

    #[test]
    fn test_caller_managed_thread_b() {
        let mut pair = FuzzyPair::new(small_config()).unwrap();
        let b = pair.handle_b();
        pair.reset(None).unwrap();

        let handle = thread::spawn(move || {
            let mut laps = 0;
            while b.run_b() {
                b.start_race_b();
                b.end_race_b();
                laps += 1;
            }
            laps
        });

        let mut laps = 0;
        while pair.run_a() {
            pair.start_race_a();
            pair.end_race_a();
            laps += 1;
        }

        assert_eq!(laps, 20);
        assert_eq!(handle.join().unwrap(), 20);
    }

    #[test]
    fn test_negative_delay_spins_thread_a() {
        let hooks = Hooks {
            yield_now: barrier::default_yield,
            random: Box::new(FixedDraw(0.0)),
        };
        let mut pair = FuzzyPair::with_hooks(small_config(), hooks).unwrap();
        pair.reset(None).unwrap();

        // Pretend the statistics have converged
        pair.estimator.diff_sa = Stat { avg: 1000.0, avg_dev: 0.0, dev_ratio: 0.0 };
        pair.estimator.diff_sb = Stat { avg: 1000.0, avg_dev: 0.0, dev_ratio: 0.0 };
        pair.estimator.diff_ab = Stat { avg: 100.0, avg_dev: 0.0, dev_ratio: 0.0 };
        pair.estimator.spins_avg = Stat { avg: 10.0, avg_dev: 0.0, dev_ratio: 0.0 };
        pair.estimator.end_sampling();

        let b = pair.handle_b();
        let handle = thread::spawn(move || {
            b.start_race_b();
            b.end_race_b();
        });

        pair.start_race_a();
        pair.end_race_a();
        handle.join().unwrap();

        // d = 0 → round(1.1 * -1000 / 10) = -110
        assert_eq!(pair.delay(), -110);
        assert_eq!(pair.phase(), Phase::Steady);
    }

    #[test]
    fn test_snapshot_display_and_json() {
        let mut pair = FuzzyPair::new(small_config()).unwrap();
        pair.reset(None).unwrap();
        pair.estimator.diff_ab.update(1.0, 42.0);

        let info = pair.info();
        let text = info.to_string();
        assert!(text.starts_with("loop = 0, delay_bias = 0"));
        assert!(text.contains("end_a - end_b    : { avg =    42ns"));
        assert!(text.contains("spins"));

        let json = info.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["diff_ab"]["avg"], 42.0);
        assert_eq!(value["phase"]["mandatory_sampling"]["remaining"], 20);
    }
}
