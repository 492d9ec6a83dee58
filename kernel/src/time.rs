//! A module for dealing with system time and the passage of time.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::interrupts::PIT_HZ;

/// Counts timer ticks since boot. This is the only source of wall-clock time; there is no RTC
/// read-back in the baseline kernel.
static TICKS: AtomicUsize = AtomicUsize::new(0);

/// Seconds elapsed, bumped once every `PIT_HZ` ticks (§4.4: "1 second per 250 ticks").
static SECONDS: AtomicUsize = AtomicUsize::new(0);

/// Opaquely represents a point in system time, measured in ticks since boot.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Debug)]
pub struct SysTime(usize);

impl SysTime {
    /// Get the current system time without synchronizing. This has better performance but could
    /// in principle race a concurrent tick on SMP; harmless on this single-core kernel.
    pub fn now() -> Self {
        SysTime(TICKS.load(Ordering::Relaxed))
    }

    /// Get the time `secs` seconds after `self`.
    pub fn after(&self, secs: usize) -> Self {
        SysTime(self.0 + secs * PIT_HZ)
    }
}

/// Tick the clock atomically and drive the wall-clock second counter.
///
/// This should only be called from the timer interrupt handler.
pub fn tick() {
    let ticks = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks % PIT_HZ == 0 {
        SECONDS.fetch_add(1, Ordering::Relaxed);
    }
}

/// Seconds elapsed since boot.
pub fn uptime_secs() -> usize {
    SECONDS.load(Ordering::Relaxed)
}

/// Ticks elapsed since boot.
pub fn ticks() -> usize {
    TICKS.load(Ordering::Relaxed)
}
