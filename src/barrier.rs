//! Lock-free two party rendezvous
//!
//! Each participant owns a lap counter which the *other* participant
//! increments when it arrives at a synchronisation point. A participant
//! whose own counter is lower than the other's is ahead and spins until
//! the other catches up.
//!
//! ```text
//!   thread A                               thread B
//!   b_cntr += 1  ──┐                 ┌──  a_cntr += 1
//!   spin while     │   a_cntr == b_cntr  │  spin while
//!   a_cntr < b_cntr└────────► ◄──────┘  b_cntr < a_cntr
//! ```
//!
//! The waiting side never sleeps in the kernel. A futex wakeup costs about as
//! much time as the race windows being searched for, so the loop only spins
//! and calls a cooperative yield hook (needed for progress on a single CPU).
//!
//! # Wraparound
//!
//! When an increment lands on `i32::MAX` the counters are about to wrap and
//! the "lowest counter is in front" invariant would break. The side that
//! hit the maximum waits for the other side to reach its increment, zeroes
//! the counter it just incremented and waits for the other side to do the
//! same. See [`Rendezvous::wait`].

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicI32, Ordering};
#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicI32, Ordering};

/// Called on every iteration of a spin wait
pub type YieldFn = fn();

/// Default yield hook
#[cfg(not(loom))]
pub fn default_yield() {
    std::thread::yield_now();
}

/// Default yield hook
#[cfg(loom)]
pub fn default_yield() {
    loom::thread::yield_now();
}

/// Which side of the pair is calling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// The pair of lap counters shared by both participants
#[derive(Debug)]
pub struct Rendezvous {
    a_cntr: AtomicI32,
    b_cntr: AtomicI32,
    yield_now: YieldFn,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::with_yield(default_yield)
    }

    /// Use a custom yield hook inside spin loops
    pub fn with_yield(yield_now: YieldFn) -> Self {
        Self::with_laps(0, 0, yield_now)
    }

    /// Start from arbitrary lap counts, e.g. to exercise wraparound
    pub fn with_laps(a_cntr: i32, b_cntr: i32, yield_now: YieldFn) -> Self {
        Self {
            a_cntr: AtomicI32::new(a_cntr),
            b_cntr: AtomicI32::new(b_cntr),
            yield_now,
        }
    }

    /// Zero both counters
    ///
    /// Only valid while neither side is inside a wait.
    pub fn reset(&self) {
        self.a_cntr.store(0, Ordering::SeqCst);
        self.b_cntr.store(0, Ordering::SeqCst);
    }

    /// Snapshot of `(a_cntr, b_cntr)`
    pub fn laps(&self) -> (i32, i32) {
        (
            self.a_cntr.load(Ordering::SeqCst),
            self.b_cntr.load(Ordering::SeqCst),
        )
    }

    /// Wait in thread A
    pub fn wait_a(&self) {
        self.wait(Side::A, None);
    }

    /// Wait in thread B
    pub fn wait_b(&self) {
        self.wait(Side::B, None);
    }

    /// Wait for the other side, optionally counting spins into `spins`
    pub fn wait(&self, side: Side, spins: Option<&AtomicI32>) {
        match side {
            Side::A => self.wait_on(&self.a_cntr, &self.b_cntr, spins),
            Side::B => self.wait_on(&self.b_cntr, &self.a_cntr, spins),
        }
    }

    fn wait_on(&self, our_cntr: &AtomicI32, other_cntr: &AtomicI32, spins: Option<&AtomicI32>) {
        let count_spin = || {
            if let Some(spins) = spins {
                spins.fetch_add(1, Ordering::SeqCst);
            }
        };

        // fetch_add returns the previous value; the new value is one higher
        if other_cntr.fetch_add(1, Ordering::SeqCst) == i32::MAX - 1 {
            // The next increment would wrap. The other side must at least
            // have reached its increment before we zero anything. If we are
            // the rear side, our counter may already have been zeroed.
            loop {
                let ours = our_cntr.load(Ordering::SeqCst);
                if ours <= 0 || ours >= i32::MAX {
                    break;
                }
                count_spin();
                (self.yield_now)();
            }

            other_cntr.store(0, Ordering::SeqCst);

            // Once both counters are zeroed the invariant holds again
            while our_cntr.load(Ordering::SeqCst) > 1 {
                (self.yield_now)();
            }
        } else {
            // A lower counter than the other side means we are in front
            while our_cntr.load(Ordering::SeqCst) < other_cntr.load(Ordering::SeqCst) {
                count_spin();
                (self.yield_now)();
            }
        }
    }
}
