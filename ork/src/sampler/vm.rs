//! VM sampler.

use std::sync::Arc;

use crate::activity::{Activity, VmActivity};
use crate::hypervisor::Hypervisor;
use crate::hypervisor::stats::{KEY_MEMORY_MAX, StatisticsClient};
use crate::registry::Registry;

/// Refreshes one registry entry per running guest each tick.
///
/// CPU comes from the hypervisor's cumulative vCPU-time counter, fed as a
/// per-tick delta into the record's moving average. Memory prefers the
/// node's statistics stream and falls back to the enumerated maximum when
/// the stream is unavailable.
pub struct VmSampler {
    registry: Arc<Registry>,
    hv: Arc<dyn Hypervisor>,
    stats: Option<StatisticsClient>,
}

impl VmSampler {
    /// Creates a sampler using the default statistics stream.
    pub fn new(registry: Arc<Registry>, hv: Arc<dyn Hypervisor>) -> Self {
        Self {
            registry,
            hv,
            stats: Some(StatisticsClient::default()),
        }
    }

    /// Replaces (or removes) the statistics stream client.
    pub fn with_statistics(mut self, stats: Option<StatisticsClient>) -> Self {
        self.stats = stats;
        self
    }

    /// One sampling tick.
    pub fn tick(&self) {
        let domains = match self.hv.list_domains() {
            Ok(domains) => domains,
            Err(e) => {
                tracing::error!("cannot enumerate domains: {e}");
                return;
            }
        };

        let memory_stream = self.stats.as_ref().and_then(|stats| {
            match stats.domain_values(KEY_MEMORY_MAX) {
                Ok(values) => Some(values),
                Err(e) => {
                    tracing::debug!("statistics stream unavailable: {e}");
                    None
                }
            }
        });

        for dom in domains {
            let mut vm = match self.registry.get(&dom.name) {
                Some(Activity::Vm(mut vm)) => {
                    vm.observe_cpu_time(dom.cpu_time_ns);
                    vm
                }
                // A non-VM record under a domain name is stale; replace it.
                _ => VmActivity::new(&dom.name, dom.cpu_time_ns, dom.max_memory_bytes),
            };

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let memory = memory_stream
                .as_ref()
                .and_then(|values| values.get(&dom.name))
                .map_or(dom.max_memory_bytes, |v| *v as u64);
            vm.set_memory(memory);

            self.registry.insert(dom.name, Activity::Vm(vm));
        }

        self.registry.maintain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HypervisorError;
    use crate::hypervisor::DomainInfo;
    use std::sync::Mutex;

    struct FakeHypervisor {
        domains: Mutex<Vec<DomainInfo>>,
    }

    impl FakeHypervisor {
        fn new(domains: Vec<DomainInfo>) -> Self {
            Self {
                domains: Mutex::new(domains),
            }
        }

        fn set(&self, domains: Vec<DomainInfo>) {
            *self.domains.lock().unwrap() = domains;
        }
    }

    impl Hypervisor for FakeHypervisor {
        fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
            Ok(self.domains.lock().unwrap().clone())
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
        fn destroy(&self, _: &str) -> Result<(), HypervisorError> {
            Ok(())
        }
        fn cpu_time_seconds(&self, _: &str) -> Result<f64, HypervisorError> {
            Ok(0.0)
        }
    }

    fn domain(name: &str, cpu_time_ns: u64) -> DomainInfo {
        DomainInfo {
            name: name.to_string(),
            cpu_time_ns,
            max_memory_bytes: 2 << 30,
        }
    }

    #[test]
    fn first_observation_creates_the_record() {
        let registry = Arc::new(Registry::new());
        let hv = Arc::new(FakeHypervisor::new(vec![domain("vm1", 1_000_000_000)]));
        let sampler =
            VmSampler::new(Arc::clone(&registry), hv).with_statistics(None);

        sampler.tick();

        let Some(Activity::Vm(vm)) = registry.get("vm1") else {
            panic!("vm1 not registered");
        };
        assert_eq!(vm.name(), "vm1");
        // Delta primed on the first counter: no share yet.
        assert!(vm.cpu_share().abs() < f64::EPSILON);
    }

    #[test]
    fn subsequent_ticks_feed_the_share_average() {
        let registry = Arc::new(Registry::new());
        let hv = Arc::new(FakeHypervisor::new(vec![domain("vm1", 0)]));
        let sampler =
            VmSampler::new(Arc::clone(&registry), Arc::clone(&hv) as Arc<dyn Hypervisor>)
                .with_statistics(None);

        sampler.tick();
        for tick in 1..=10u64 {
            hv.set(vec![domain("vm1", tick * 500_000_000)]);
            sampler.tick();
        }

        let Some(Activity::Vm(vm)) = registry.get("vm1") else {
            panic!("vm1 not registered");
        };
        // 0.5 s of vCPU time per tick.
        assert!((vm.cpu_share() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn memory_falls_back_to_the_enumerated_maximum() {
        let registry = Arc::new(Registry::new());
        let hv = Arc::new(FakeHypervisor::new(vec![domain("vm1", 0)]));
        let sampler =
            VmSampler::new(Arc::clone(&registry), hv).with_statistics(None);

        sampler.tick();
        let vm = registry.get("vm1").unwrap();
        assert_eq!(vm.memory(), 2 << 30);
    }

    #[test]
    fn vanished_domains_age_out_rather_than_erroring() {
        let registry = Arc::new(Registry::new());
        let hv = Arc::new(FakeHypervisor::new(vec![domain("vm1", 0)]));
        let sampler =
            VmSampler::new(Arc::clone(&registry), Arc::clone(&hv) as Arc<dyn Hypervisor>)
                .with_statistics(None);

        sampler.tick();
        hv.set(Vec::new());
        sampler.tick();

        // Still present until the TTL runs out; the sampler never deletes.
        assert!(registry.get("vm1").is_some());
    }
}
