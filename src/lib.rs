//! fzsync - Fuzzy two thread synchronisation for reproducing races
//!
//! Reproducing a race by brute force means running two racing calls in a
//! loop and hoping their critical sections overlap. This library makes that
//! loop far more effective: it lines up the two threads at the start of each
//! iteration with a lock-free rendezvous, measures how long each racing call
//! takes, and once the measurements settle injects a random busy-wait delay
//! into one thread so every relative offset of the two calls gets explored.
//!
//! The entry point is [`FuzzyPair`]; see the [`pair`] module for a complete
//! usage example.

pub mod barrier;
pub mod cli;
pub mod clock;
pub mod config;
pub mod demo;
pub mod error;
pub mod estimator;
pub mod pair;
pub mod random;
pub mod stat;
pub mod worker;

pub use config::PairConfig;
pub use error::{FzsyncError, Result};
pub use estimator::Phase;
pub use pair::{FuzzyPair, Hooks, PairB, PairSnapshot, WorkerBody};
pub use stat::Stat;
pub use worker::WorkerExit;
