//! Memory pressure monitor.

use std::sync::Arc;

use sysinfo::{System, SystemExt};

use crate::activity::{KillContext, sort_by_memory, victims};
use crate::monitor::{DEBOUNCE_TICKS, Debounce};
use crate::registry::Registry;

/// Minimum available memory; below this the host is considered starving.
pub const AVAILABLE_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Kills activities, fattest-and-highest-priority first, when available
/// memory stays under 100 MiB for five consecutive ticks.
pub struct MemoryMonitor {
    registry: Arc<Registry>,
    ctx: KillContext,
    probe: Box<dyn FnMut() -> u64 + Send>,
    debounce: Debounce,
}

impl MemoryMonitor {
    /// Creates a monitor probing the live host.
    pub fn new(registry: Arc<Registry>, ctx: KillContext) -> Self {
        let mut sys = System::new();
        Self::with_probe(
            registry,
            ctx,
            Box::new(move || {
                sys.refresh_memory();
                sys.available_memory()
            }),
        )
    }

    /// Creates a monitor with an injected availability probe.
    pub fn with_probe(
        registry: Arc<Registry>,
        ctx: KillContext,
        probe: Box<dyn FnMut() -> u64 + Send>,
    ) -> Self {
        Self {
            registry,
            ctx,
            probe,
            debounce: Debounce::new(DEBOUNCE_TICKS),
        }
    }

    /// One monitor tick.
    pub fn tick(&mut self) {
        if (self.probe)() >= AVAILABLE_THRESHOLD_BYTES {
            self.debounce.ok();
            return;
        }
        if !self.debounce.over() {
            return;
        }

        tracing::warn!("available memory under threshold, sweeping activities");
        let mut list = victims(self.registry.items());
        sort_by_memory(&mut list);

        for victim in list {
            if victim.activity.kill(&self.ctx).is_err() {
                continue;
            }
            self.registry.remove(&victim.name);
            self.debounce.reset();

            if (self.probe)() >= AVAILABLE_THRESHOLD_BYTES {
                tracing::info!("memory consumption back to normal");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Activity, VmActivity};
    use crate::error::{HypervisorError, NetError};
    use crate::hypervisor::{DomainInfo, Hypervisor};
    use crate::klog::ActionLogger;
    use crate::net::LinkControl;
    use std::sync::Mutex;

    struct RecordingHypervisor {
        destroyed: Mutex<Vec<String>>,
    }

    impl Hypervisor for RecordingHypervisor {
        fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
            Ok(Vec::new())
        }
        fn vcpu_count(&self, _: &str) -> Result<u32, HypervisorError> {
            Ok(1)
        }
        fn vcpu_pins(&self, _: &str) -> Result<Vec<Vec<bool>>, HypervisorError> {
            Ok(Vec::new())
        }
        fn pin_vcpu(&self, _: &str, _: u32, _: &[bool]) -> Result<(), HypervisorError> {
            Ok(())
        }
        fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
            self.destroyed.lock().unwrap().push(name.to_string());
            Ok(())
        }
        fn cpu_time_seconds(&self, _: &str) -> Result<f64, HypervisorError> {
            Ok(0.0)
        }
    }

    struct NullLinks;

    impl LinkControl for NullLinks {
        fn vxlan_links(&self) -> Result<Vec<String>, NetError> {
            Ok(Vec::new())
        }
        fn set_down(&self, _: &str) -> Result<(), NetError> {
            Ok(())
        }
        fn apply_rate(&self, _: &str, _: u64, _: u64) -> Result<(), NetError> {
            Ok(())
        }
    }

    fn harness(
        available: Vec<u64>,
    ) -> (Arc<Registry>, Arc<RecordingHypervisor>, MemoryMonitor) {
        let registry = Arc::new(Registry::new());
        let hv = Arc::new(RecordingHypervisor {
            destroyed: Mutex::new(Vec::new()),
        });
        let ctx = KillContext {
            hv: Arc::clone(&hv) as Arc<dyn Hypervisor>,
            links: Arc::new(NullLinks),
            actions: Arc::new(ActionLogger::new(
                std::env::temp_dir().join("ork-memory-test-kmsg"),
            )),
        };
        let mut feed = available.into_iter();
        let last = AVAILABLE_THRESHOLD_BYTES;
        let monitor = MemoryMonitor::with_probe(
            Arc::clone(&registry),
            ctx,
            Box::new(move || feed.next().unwrap_or(last)),
        );
        (registry, hv, monitor)
    }

    fn vm(name: &str, memory: u64) -> Activity {
        Activity::Vm(VmActivity::new(name, 0, memory))
    }

    const LOW: u64 = 80 * 1024 * 1024;
    const OK: u64 = 200 * 1024 * 1024;

    #[test]
    fn five_consecutive_low_ticks_before_any_kill() {
        // 4 low, 1 ok, 5 low: the first kill happens on tick 10.
        let mut feed = vec![LOW, LOW, LOW, LOW, OK, LOW, LOW, LOW, LOW];
        feed.push(LOW); // tick 10 trigger probe
        feed.push(OK); // post-kill re-probe
        let (registry, hv, mut monitor) = harness(feed);
        registry.insert("vm1", vm("vm1", 1 << 30));

        for _ in 0..9 {
            monitor.tick();
            assert!(hv.destroyed.lock().unwrap().is_empty());
        }
        monitor.tick();
        assert_eq!(*hv.destroyed.lock().unwrap(), vec!["vm1"]);
    }

    #[test]
    fn kill_removes_the_registry_entry() {
        let feed = vec![LOW, LOW, LOW, LOW, LOW, OK];
        let (registry, _, mut monitor) = harness(feed);
        registry.insert("vm1", vm("vm1", 1 << 30));

        for _ in 0..5 {
            monitor.tick();
        }
        registry.maintain();
        assert!(registry.get("vm1").is_none());
    }

    #[test]
    fn sweep_stops_once_memory_recovers() {
        // Trigger on tick 5; after the first kill the re-probe reports OK.
        let feed = vec![LOW, LOW, LOW, LOW, LOW, OK];
        let (registry, hv, mut monitor) = harness(feed);
        registry.insert("vm-big", vm("vm-big", 4 << 30));
        registry.insert("vm-small", vm("vm-small", 1 << 30));

        for _ in 0..5 {
            monitor.tick();
        }

        // Only the fattest VM died.
        assert_eq!(*hv.destroyed.lock().unwrap(), vec!["vm-big"]);
        assert!(registry.get("vm-small").is_some());
    }

    #[test]
    fn exhausted_sweep_gives_up_until_next_tick() {
        // Memory never recovers; both entries are killed, then the tick ends.
        let feed = vec![LOW; 20];
        let (registry, hv, mut monitor) = harness(feed);
        registry.insert("vm1", vm("vm1", 2 << 30));
        registry.insert("vm2", vm("vm2", 1 << 30));

        for _ in 0..5 {
            monitor.tick();
        }
        assert_eq!(*hv.destroyed.lock().unwrap(), vec!["vm1", "vm2"]);
        registry.maintain();
        assert_eq!(registry.count(), 0);
    }
}
