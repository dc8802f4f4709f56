//! Uniform random draws used to pick a delay from the estimated range

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A source of uniformly distributed values in `[0, 1)`
pub trait UniformSource: Send {
    fn next_unit(&mut self) -> f64;
}

/// Default source backed by `rand`'s standard generator
#[derive(Debug, Clone)]
pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    /// Seeded from the operating system's entropy source
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible sequence for a given seed
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for StdRandom {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl UniformSource for StdRandom {
    fn next_unit(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// Always returns the same draw
///
/// Useful for exact regression tests of the delay calculation.
#[derive(Debug, Clone, Copy)]
pub struct FixedDraw(pub f64);

impl UniformSource for FixedDraw {
    fn next_unit(&mut self) -> f64 {
        self.0
    }
}
