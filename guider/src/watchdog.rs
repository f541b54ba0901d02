//! Timeout bookkeeping for hardware operations.
//!
//! A [`Watchdog`] only answers "has this operation run past its allowance?".
//! Callers decide what to abort when it says yes.

use std::time::{Duration, Instant};

/// Readout allowance added on top of the exposure time for capture watchdogs.
pub const DEFAULT_DOWNLOAD_ALLOWANCE_MS: u64 = 15_000;

/// Mechanical settle allowance added on top of the pulse time for move watchdogs.
pub const DEFAULT_SETTLE_ALLOWANCE_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct Watchdog {
    start: Instant,
    nominal: Duration,
    ceiling: Duration,
}

impl Watchdog {
    /// Start timing an operation expected to take `nominal_ms`, that is
    /// declared hung after `ceiling_ms`. The ceiling is never below the nominal time.
    pub fn new(nominal_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            nominal: Duration::from_millis(nominal_ms),
            ceiling: Duration::from_millis(ceiling_ms.max(nominal_ms)),
        }
    }

    /// Watchdog for an exposure of `exposure_ms` plus a readout allowance.
    pub fn capture(exposure_ms: u64, download_allowance_ms: u64) -> Self {
        let ceiling = exposure_ms.saturating_add(download_allowance_ms);
        Self::new(exposure_ms, ceiling)
    }

    /// Watchdog for a pulse of `pulse_ms` plus a settle allowance.
    pub fn for_move(pulse_ms: u64, settle_allowance_ms: u64) -> Self {
        Self::new(pulse_ms, pulse_ms.saturating_add(settle_allowance_ms))
    }

    /// True once the elapsed time exceeds the ceiling. Never reverts to false.
    pub fn expired(&self) -> bool {
        self.start.elapsed() > self.ceiling
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Time left before the ceiling, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.ceiling.saturating_sub(self.start.elapsed())
    }

    pub fn nominal(&self) -> Duration {
        self.nominal
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
