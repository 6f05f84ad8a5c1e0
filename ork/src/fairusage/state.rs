//! Per-VM fair-usage state.
//!
//! Each VM walks a one-way ladder while it stays over its CPU share:
//! first over-threshold observation, a warning after five minutes, CPU
//! quarantine after ten. Dropping below the threshold walks it back out
//! through a probation window whose length doubles on every failed release.

/// Where a VM stands on the fair-usage ladder.
///
/// Timestamps are seconds since epoch, recorded when the phase was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Below threshold, nothing pending.
    #[default]
    Idle,
    /// First over-threshold observation.
    Threshold {
        /// When the VM first went over threshold.
        since: i64,
    },
    /// Warned; quarantine is imminent if the VM stays hot.
    Warn {
        /// When the VM first went over threshold (the ladder anchor).
        threshold_since: i64,
        /// When the warning was emitted.
        since: i64,
    },
    /// vCPUs pinned onto the shared guest cores.
    Quarantine {
        /// When the pinning was applied.
        since: i64,
    },
    /// Unpinned on probation; the release window decides what happens next.
    Release {
        /// When the VM was unpinned.
        since: i64,
    },
}

/// One timestamped cumulative-CPU-time observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    /// Seconds since epoch.
    pub timestamp: i64,
    /// Cumulative CPU time in seconds.
    pub total_seconds: f64,
}

/// The probation measurement: two samples bounding a release window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuAgg {
    /// Window start, recorded on the first probation tick.
    pub start: Option<CpuSample>,
    /// Window end, recorded once the window span has elapsed.
    pub end: Option<CpuSample>,
}

impl CpuAgg {
    /// Whether both bounds have been recorded.
    pub fn is_complete(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Average CPU over the window in cores-equivalent, once complete.
    /// `None` while incomplete or if the window is degenerate.
    pub fn window_average(&self) -> Option<f64> {
        let (start, end) = (self.start?, self.end?);
        let span = end.timestamp - start.timestamp;
        if span <= 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some((end.total_seconds - start.total_seconds) / span as f64)
    }

    /// Drops both bounds.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Fair-usage state embedded in every VM record (shared by all clones).
#[derive(Debug, Clone, Default)]
pub struct FairState {
    /// Current ladder phase.
    pub phase: Phase,
    /// Release-wait multiplier; doubles on every failed release, resets on
    /// a clean one.
    pub release_factor: u32,
    /// The probation window measurement.
    pub agg: CpuAgg,
}

impl FairState {
    /// Multiplier applied to the release wait. At least 1 even on a fresh
    /// record.
    pub fn factor(&self) -> u32 {
        self.release_factor.max(1)
    }

    /// Enters the first over-threshold phase.
    pub fn enter_threshold(&mut self, now: i64) {
        self.phase = Phase::Threshold { since: now };
        self.agg.clear();
    }

    /// Enters the warned phase, keeping the ladder anchor.
    pub fn enter_warn(&mut self, now: i64) {
        if let Phase::Threshold { since } = self.phase {
            self.phase = Phase::Warn {
                threshold_since: since,
                since: now,
            };
        }
    }

    /// Enters quarantine.
    pub fn enter_quarantine(&mut self, now: i64) {
        self.phase = Phase::Quarantine { since: now };
        self.agg.clear();
    }

    /// Enters probation after unpinning.
    pub fn enter_release(&mut self, now: i64) {
        self.phase = Phase::Release { since: now };
        self.agg.clear();
    }

    /// Clears everything back to idle after a clean release.
    pub fn reset_idle(&mut self) {
        self.phase = Phase::Idle;
        self.release_factor = 1;
        self.agg.clear();
    }
}
