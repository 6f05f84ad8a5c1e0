//! NIC sampler.

use std::path::PathBuf;
use std::sync::Arc;

use crate::activity::{Activity, NicActivity, NicStats};
use crate::error::SamplerError;
use crate::net::LinkControl;
use crate::registry::Registry;

/// Default sysfs root for interface statistics.
const SYSFS_NET: &str = "/sys/class/net";

/// Refreshes one registry entry per vxlan overlay interface each tick.
///
/// Interfaces come from the netlink link dump (filtered to vxlan); the four
/// counters come from sysfs. The first sighting of an interface only primes
/// its counters; rates start flowing on the second tick.
pub struct NicSampler {
    registry: Arc<Registry>,
    links: Arc<dyn LinkControl>,
    sysfs_root: PathBuf,
}

impl NicSampler {
    /// Creates a sampler reading from the live sysfs tree.
    pub fn new(registry: Arc<Registry>, links: Arc<dyn LinkControl>) -> Self {
        Self {
            registry,
            links,
            sysfs_root: PathBuf::from(SYSFS_NET),
        }
    }

    /// Overrides the sysfs root (tests).
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// One sampling tick.
    pub fn tick(&self) {
        let ifaces = match self.links.vxlan_links() {
            Ok(ifaces) => ifaces,
            Err(e) => {
                tracing::error!("cannot list vxlan links: {e}");
                return;
            }
        };

        for iface in ifaces {
            let stats = match self.read_stats(&iface) {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::debug!("skipping interface '{iface}': {e}");
                    continue;
                }
            };

            let record = match self.registry.get(&iface) {
                Some(Activity::Nic(mut nic)) => {
                    nic.observe(stats);
                    nic
                }
                _ => NicActivity::new(&iface, stats),
            };
            self.registry.insert(iface, Activity::Nic(record));
        }
    }

    fn read_stats(&self, iface: &str) -> Result<NicStats, SamplerError> {
        let stats_dir = self.sysfs_root.join(iface).join("statistics");
        Ok(NicStats {
            rx_bytes: read_counter(&stats_dir.join("rx_bytes"))?,
            tx_bytes: read_counter(&stats_dir.join("tx_bytes"))?,
            rx_packets: read_counter(&stats_dir.join("rx_packets"))?,
            tx_packets: read_counter(&stats_dir.join("tx_packets"))?,
        })
    }
}

/// Reads one newline-terminated decimal counter file.
fn read_counter(path: &std::path::Path) -> Result<u64, SamplerError> {
    let content = std::fs::read_to_string(path).map_err(|source| SamplerError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let first = content.lines().next().unwrap_or_default().trim();
    first.parse().map_err(|_| SamplerError::InvalidCounter {
        path: path.display().to_string(),
        content: first.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;
    use std::sync::Mutex;

    struct FakeLinks {
        ifaces: Mutex<Vec<String>>,
    }

    impl LinkControl for FakeLinks {
        fn vxlan_links(&self) -> Result<Vec<String>, NetError> {
            Ok(self.ifaces.lock().unwrap().clone())
        }
        fn set_down(&self, _: &str) -> Result<(), NetError> {
            Ok(())
        }
        fn apply_rate(&self, _: &str, _: u64, _: u64) -> Result<(), NetError> {
            Ok(())
        }
    }

    fn write_counters(root: &std::path::Path, iface: &str, stats: NicStats) {
        let dir = root.join(iface).join("statistics");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rx_bytes"), format!("{}\n", stats.rx_bytes)).unwrap();
        std::fs::write(dir.join("tx_bytes"), format!("{}\n", stats.tx_bytes)).unwrap();
        std::fs::write(dir.join("rx_packets"), format!("{}\n", stats.rx_packets)).unwrap();
        std::fs::write(dir.join("tx_packets"), format!("{}\n", stats.tx_packets)).unwrap();
    }

    fn sampler(root: &std::path::Path, ifaces: &[&str]) -> (Arc<Registry>, NicSampler) {
        let registry = Arc::new(Registry::new());
        let links = Arc::new(FakeLinks {
            ifaces: Mutex::new(ifaces.iter().map(|s| (*s).to_string()).collect()),
        });
        let sampler =
            NicSampler::new(Arc::clone(&registry), links).with_sysfs_root(root);
        (registry, sampler)
    }

    #[test]
    fn rates_flow_from_the_second_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, sampler) = sampler(dir.path(), &["vxlan0"]);

        write_counters(
            dir.path(),
            "vxlan0",
            NicStats {
                rx_bytes: 1_000,
                tx_bytes: 5_000,
                rx_packets: 10,
                tx_packets: 50,
            },
        );
        sampler.tick();
        assert_eq!(registry.get("vxlan0").unwrap().network().tx_bytes_per_s, 0.0);

        write_counters(
            dir.path(),
            "vxlan0",
            NicStats {
                rx_bytes: 3_000,
                tx_bytes: 15_000,
                rx_packets: 30,
                tx_packets: 150,
            },
        );
        sampler.tick();

        let usage = registry.get("vxlan0").unwrap().network();
        assert!((usage.rx_bytes_per_s - 2_000.0).abs() < f64::EPSILON);
        assert!((usage.tx_bytes_per_s - 10_000.0).abs() < f64::EPSILON);
        assert!((usage.tx_packets_per_s - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn one_broken_interface_does_not_abort_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, sampler) = sampler(dir.path(), &["vxlan0", "vxlan1"]);

        // vxlan0 has no counter files at all.
        write_counters(dir.path(), "vxlan1", NicStats::default());
        sampler.tick();

        assert!(registry.get("vxlan0").is_none());
        assert!(registry.get("vxlan1").is_some());
    }

    #[test]
    fn garbage_counter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, sampler) = sampler(dir.path(), &["vxlan0"]);

        write_counters(dir.path(), "vxlan0", NicStats::default());
        std::fs::write(
            dir.path().join("vxlan0/statistics/tx_bytes"),
            "not-a-number\n",
        )
        .unwrap();
        sampler.tick();

        assert!(registry.get("vxlan0").is_none());
    }
}
