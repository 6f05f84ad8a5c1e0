//! Agent wiring and loop supervision.
//!
//! The engine owns every shared piece (registry, hypervisor client,
//! link control, action logger, fair-usage engine) and spawns one named
//! thread per enabled loop. Tick bodies are wrapped in `catch_unwind`:
//! a panic costs the loop one iteration, never the agent.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sysinfo::{System, SystemExt};

use crate::activity::KillContext;
use crate::config::Config;
use crate::error::{OrkError, Result};
use crate::fairusage::FairUsageEngine;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::virsh::VirshHypervisor;
use crate::klog::ActionLogger;
use crate::monitor::{CpuMonitor, DiskMonitor, MemoryMonitor, NetworkMonitor};
use crate::net::{LinkControl, NetlinkLinkControl};
use crate::registry::Registry;
use crate::sampler::{NicSampler, ProcessSampler, VmSampler};

/// Cadence of the samplers, monitors, and the fair-usage engine.
pub const TICK: Duration = Duration::from_secs(1);
/// Cadence of the disk monitor.
pub const DISK_TICK: Duration = Duration::from_secs(5);

/// The assembled agent.
pub struct Engine {
    config: Config,
    registry: Arc<Registry>,
    hv: Arc<dyn Hypervisor>,
    links: Arc<dyn LinkControl>,
    actions: Arc<ActionLogger>,
    fairusage: Arc<FairUsageEngine>,
}

impl Engine {
    /// Builds the agent against the live host.
    ///
    /// # Errors
    ///
    /// Fails when the netlink socket cannot be opened or the host has no
    /// guest cores.
    pub fn new(config: Config) -> Result<Self> {
        let cores = host_core_count();
        tracing::info!("host has {cores} physical cores");

        let registry = Arc::new(Registry::new());
        let actions = Arc::new(ActionLogger::default());
        let hv: Arc<dyn Hypervisor> = Arc::new(VirshHypervisor::new(cores));
        let links: Arc<dyn LinkControl> = Arc::new(NetlinkLinkControl::new()?);
        let fairusage = Arc::new(FairUsageEngine::new(
            Arc::clone(&hv),
            Arc::clone(&actions),
            cores,
        )?);

        Ok(Self {
            config,
            registry,
            hv,
            links,
            actions,
            fairusage,
        })
    }

    /// Spawns every enabled loop and parks forever.
    ///
    /// # Errors
    ///
    /// Fails when a loop thread cannot be spawned.
    pub fn run(self) -> Result<()> {
        if self.config.fairusage_engine() {
            if let Err(e) = self.fairusage.reconcile() {
                tracing::error!("startup reconciliation failed: {e}");
            }
        }

        let ctx = KillContext {
            hv: Arc::clone(&self.hv),
            links: Arc::clone(&self.links),
            actions: Arc::clone(&self.actions),
        };

        let vm_sampler = VmSampler::new(Arc::clone(&self.registry), Arc::clone(&self.hv));
        spawn_loop("vm-sampler", TICK, move || vm_sampler.tick())?;

        let mut process_sampler = ProcessSampler::new(Arc::clone(&self.registry));
        spawn_loop("process-sampler", TICK, move || process_sampler.tick())?;

        let nic_sampler = NicSampler::new(Arc::clone(&self.registry), Arc::clone(&self.links));
        spawn_loop("nic-sampler", TICK, move || nic_sampler.tick())?;

        if self.config.memory_monitor() {
            let mut monitor = MemoryMonitor::new(Arc::clone(&self.registry), ctx.clone());
            spawn_loop("memory-monitor", TICK, move || monitor.tick())?;
        }
        if self.config.cpu_monitor() {
            let mut monitor = CpuMonitor::new(Arc::clone(&self.registry), ctx.clone());
            spawn_loop("cpu-monitor", TICK, move || monitor.tick())?;
        }
        if self.config.network_monitor() {
            let monitor = NetworkMonitor::new(Arc::clone(&self.registry), ctx.clone());
            spawn_loop("network-monitor", TICK, move || monitor.tick())?;
        }
        if self.config.fairusage_engine() {
            let fairusage = Arc::clone(&self.fairusage);
            let registry = Arc::clone(&self.registry);
            spawn_loop("fairusage", TICK, move || {
                fairusage.tick(&registry, epoch_seconds());
            })?;
        }

        let disk = DiskMonitor::new();
        spawn_loop("disk-monitor", DISK_TICK, move || disk.tick())?;

        tracing::info!("resource guardian running");
        loop {
            thread::park();
        }
    }
}

/// Spawns one named loop thread: tick, sleep, repeat. A panicking tick is
/// logged and the loop resumes on the next interval.
fn spawn_loop<F>(name: &'static str, interval: Duration, mut tick: F) -> Result<()>
where
    F: FnMut() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                if std::panic::catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
                    tracing::error!("'{name}' tick panicked; resuming next tick");
                }
                thread::sleep(interval);
            }
        })
        .map_err(|source| OrkError::SpawnLoop {
            name: name.to_string(),
            source,
        })?;
    Ok(())
}

/// Physical core count of the host.
fn host_core_count() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu();
    let cores = sys.cpus().len();
    if cores > 0 {
        cores
    } else {
        thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

/// Wall-clock seconds since epoch; all state-machine time arithmetic uses
/// this one source.
fn epoch_seconds() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
