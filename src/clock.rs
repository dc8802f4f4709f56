//! Monotonic time source
//!
//! Prefers `CLOCK_MONOTONIC_RAW`, which is not slewed by NTP, and falls back
//! to the coarser `CLOCK_MONOTONIC` where the raw clock is unavailable.

use crate::error::{FzsyncError, Result};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_preferred() -> nix::Result<TimeSpec> {
    clock_gettime(ClockId::CLOCK_MONOTONIC_RAW).or_else(|_| clock_gettime(ClockId::CLOCK_MONOTONIC))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn read_preferred() -> nix::Result<TimeSpec> {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
}

/// Current monotonic time in nanoseconds
pub fn now_ns() -> Result<i64> {
    let ts = read_preferred().map_err(FzsyncError::Clock)?;
    Ok(timespec_to_ns(&ts))
}

/// Convert a timespec to nanoseconds
///
/// Saturates instead of wrapping for absurdly large values.
pub fn timespec_to_ns(ts: &TimeSpec) -> i64 {
    (ts.tv_sec() as i64)
        .saturating_mul(NANOS_PER_SEC)
        .saturating_add(ts.tv_nsec() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let t1 = now_ns().unwrap();
        let t2 = now_ns().unwrap();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_now_advances_across_sleep() {
        let t1 = now_ns().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = now_ns().unwrap();
        assert!(t2 - t1 >= 5_000_000);
    }

    #[test]
    fn test_timespec_to_ns() {
        let ts = TimeSpec::new(3, 250);
        assert_eq!(timespec_to_ns(&ts), 3_000_000_250);
    }
}
