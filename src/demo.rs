//! A self-contained lost-update race driven through a [`FuzzyPair`]
//!
//! Both threads read a shared counter, busy-wait for `window` spins and then
//! write back the value they read plus one. If the two read-modify-write
//! sequences overlap, one increment is lost and the counter ends the
//! iteration at 1 instead of 2. Those iterations are counted as hits.
//!
//! The race only happens when the windows line up, which is what the delay
//! estimator arranges once the timings are known.

use crate::barrier;
use crate::config::PairConfig;
use crate::error::Result;
use crate::pair::{FuzzyPair, Hooks, PairSnapshot, WorkerBody};
use crate::random::StdRandom;
use serde::Serialize;
use std::fmt;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default width of each thread's read-modify-write window, in spins
pub const DEFAULT_WINDOW: u32 = 64;

/// Outcome of a demo run
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub iterations: u64,
    pub hits: u64,
    pub window: u32,
    pub elapsed_ms: u128,
    pub info: PairSnapshot,
}

impl DemoReport {
    /// Share of iterations that lost an update
    pub fn hit_rate(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.hits as f64 / self.iterations as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Lost update race ===")?;
        writeln!(f, "window     : {} spins", self.window)?;
        writeln!(f, "iterations : {}", self.iterations)?;
        writeln!(
            f,
            "hits       : {} ({:.2}%)",
            self.hits,
            self.hit_rate() * 100.0
        )?;
        writeln!(f, "elapsed    : {} ms", self.elapsed_ms)?;
        writeln!(f)?;
        write!(f, "{}", self.info)
    }
}

#[inline]
fn racy_increment(counter: &AtomicU64, window: u32) {
    let seen = counter.load(Ordering::Relaxed);
    for i in 0..window {
        black_box(i);
    }
    counter.store(seen + 1, Ordering::Relaxed);
}

/// Run the lost-update race until the pair's budget is spent
///
/// `seed` makes the delay draws reproducible; the race outcome still
/// depends on scheduling.
pub fn run_demo(config: PairConfig, window: u32, seed: Option<u64>) -> Result<DemoReport> {
    let random = match seed {
        Some(seed) => StdRandom::seeded(seed),
        None => StdRandom::from_entropy(),
    };
    let hooks = Hooks {
        yield_now: barrier::default_yield,
        random: Box::new(random),
    };
    let mut pair = FuzzyPair::with_hooks(config, hooks)?;

    let counter = Arc::new(AtomicU64::new(0));
    let counter_b = counter.clone();

    // SAFETY: the body touches only atomics and owns no other resources.
    let run_b = unsafe {
        WorkerBody::new(move |b| {
            while b.run_b() {
                b.start_race_b();
                racy_increment(&counter_b, window);
                b.end_race_b();
            }
        })
    };

    let started = Instant::now();
    pair.reset(Some(run_b))?;

    let mut iterations = 0u64;
    let mut hits = 0u64;
    while pair.run_a() {
        counter.store(0, Ordering::Relaxed);

        pair.start_race_a();
        racy_increment(&counter, window);
        pair.end_race_a();

        iterations += 1;
        if counter.load(Ordering::Relaxed) < 2 {
            hits += 1;
        }
    }

    tracing::info!(iterations, hits, "Demo race finished");

    Ok(DemoReport {
        iterations,
        hits,
        window,
        elapsed_ms: started.elapsed().as_millis(),
        info: pair.info(),
    })
}
