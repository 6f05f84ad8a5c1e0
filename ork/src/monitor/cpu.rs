//! CPU pressure monitor.

use std::sync::Arc;

use sysinfo::{CpuExt, System, SystemExt};

use crate::activity::{KillContext, sort_by_cpu, victims};
use crate::monitor::{DEBOUNCE_TICKS, Debounce};
use crate::registry::Registry;
use crate::stats::Ewma;

/// Host CPU percentage considered sustained overload.
pub const CPU_PERCENT_THRESHOLD: f64 = 90.0;

/// Sample span of the monitor's own load average.
const HOST_EWMA_SPAN: u32 = 60;

/// Kills activities, hottest-and-highest-priority first, when the smoothed
/// host CPU load stays at or above 90% for five consecutive ticks.
///
/// The smoothing is the monitor's own: a 60-sample average of the host
/// percentage, separate from the per-activity share averages. The post-kill
/// re-check uses the instantaneous reading, since the average cannot react
/// within one sweep.
pub struct CpuMonitor {
    registry: Arc<Registry>,
    ctx: KillContext,
    probe: Box<dyn FnMut() -> f64 + Send>,
    load: Ewma,
    debounce: Debounce,
}

impl CpuMonitor {
    /// Creates a monitor probing the live host.
    pub fn new(registry: Arc<Registry>, ctx: KillContext) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self::with_probe(
            registry,
            ctx,
            Box::new(move || {
                sys.refresh_cpu();
                f64::from(sys.global_cpu_info().cpu_usage())
            }),
        )
    }

    /// Creates a monitor with an injected percentage probe.
    pub fn with_probe(
        registry: Arc<Registry>,
        ctx: KillContext,
        probe: Box<dyn FnMut() -> f64 + Send>,
    ) -> Self {
        Self {
            registry,
            ctx,
            probe,
            load: Ewma::new(HOST_EWMA_SPAN),
            debounce: Debounce::new(DEBOUNCE_TICKS),
        }
    }

    /// One monitor tick.
    pub fn tick(&mut self) {
        self.load.add((self.probe)());
        if self.load.value() < CPU_PERCENT_THRESHOLD {
            self.debounce.ok();
            return;
        }
        if !self.debounce.over() {
            return;
        }

        tracing::warn!("host cpu load over threshold, sweeping activities");
        let mut list = victims(self.registry.items());
        sort_by_cpu(&mut list);

        for victim in list {
            if victim.activity.kill(&self.ctx).is_err() {
                continue;
            }
            self.registry.remove(&victim.name);
            self.debounce.reset();

            if (self.probe)() < CPU_PERCENT_THRESHOLD {
                tracing::info!("cpu consumption back to normal");
                return;
            }
        }
    }
}
