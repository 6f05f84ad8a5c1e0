//! Graduated bandwidth squeeze for virtual interfaces.
//!
//! A misbehaving interface is not cut off outright: each mitigation call
//! advances it one rung down a bandwidth-and-latency ladder. Only an
//! interface that exhausts the ladder, or breaches the hard transmit
//! thresholds, is administratively shut down.

use std::sync::atomic::Ordering;

use crate::activity::{KillContext, NicActivity};
use crate::error::Result;
use crate::klog::{Action, State};

/// Hard transmit-byte threshold (≈ 70% of 2 Gbit/s). At or above this the
/// interface is shut down without squeezing.
pub const TX_BYTES_SHUTDOWN: f64 = 175_000_000.0;
/// Hard transmit-packet threshold (70% of 40 kpps).
pub const TX_PACKETS_SHUTDOWN: f64 = 28_000.0;

/// Number of rungs on the ladder; past the last one the interface goes down.
pub const MAX_RUNG: u32 = 11;

/// One rung: a token-bucket rate and an optional emulator delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    /// Token-bucket rate in bytes per second.
    pub bandwidth: u64,
    /// Network-emulator delay in microseconds; zero means no delay rule.
    pub delay_us: u64,
}

/// The ladder, indexed by rung − 1.
pub const LADDER: [Rung; MAX_RUNG as usize] = [
    Rung { bandwidth: 250_000_000, delay_us: 0 },
    Rung { bandwidth: 125_000_000, delay_us: 0 },
    Rung { bandwidth: 62_500_000, delay_us: 0 },
    Rung { bandwidth: 25_000_000, delay_us: 0 },
    Rung { bandwidth: 12_500_000, delay_us: 0 },
    Rung { bandwidth: 6_250_000, delay_us: 0 },
    Rung { bandwidth: 1_250_000, delay_us: 10_000 },
    Rung { bandwidth: 250_000, delay_us: 20_000 },
    Rung { bandwidth: 125_000, delay_us: 50_000 },
    Rung { bandwidth: 62_500, delay_us: 100_000 },
    Rung { bandwidth: 25_000, delay_us: 200 },
];

/// Mitigates one interface: shutdown on hard-threshold breach, otherwise
/// one squeeze step down the ladder.
pub fn kill(ctx: &KillContext, nic: &NicActivity) -> Result<()> {
    let usage = nic.usage();
    if usage.tx_bytes_per_s >= TX_BYTES_SHUTDOWN || usage.tx_packets_per_s >= TX_PACKETS_SHUTDOWN {
        return shutdown(ctx, nic);
    }
    squeeze(ctx, nic)
}

fn shutdown(ctx: &KillContext, nic: &NicActivity) -> Result<()> {
    let name = nic.name();
    ctx.actions
        .kernel(format_args!("attempting to set down interface {name}"));

    if let Err(e) = ctx.links.set_down(name) {
        ctx.actions
            .kernel(format_args!("error setting down interface {name}"));
        ctx.actions.action(Action::NicShutdown, name, State::Error);
        tracing::error!("failed to set down '{name}': {e}");
        return Err(e.into());
    }

    ctx.actions
        .kernel(format_args!("successfully set down interface {name}"));
    ctx.actions.action(Action::NicShutdown, name, State::Success);
    Ok(())
}

fn squeeze(ctx: &KillContext, nic: &NicActivity) -> Result<()> {
    let name = nic.name();
    let rung = nic.rung().fetch_add(1, Ordering::SeqCst) + 1;
    if rung > MAX_RUNG {
        return shutdown(ctx, nic);
    }

    let step = LADDER[(rung - 1) as usize];
    ctx.actions.kernel(format_args!(
        "attempting to squeeze interface {name} to {} bytes/s",
        step.bandwidth
    ));

    if let Err(e) = ctx.links.apply_rate(name, step.bandwidth, step.delay_us) {
        ctx.actions
            .kernel(format_args!("error squeezing interface {name}"));
        tracing::error!("failed to squeeze '{name}' to rung {rung}: {e}");
        return Err(e.into());
    }

    ctx.actions.kernel(format_args!(
        "successfully squeezed interface {name} (rung {rung})"
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::NicStats;
    use crate::error::{HypervisorError, NetError};
    use crate::hypervisor::{DomainInfo, Hypervisor};
    use crate::klog::ActionLogger;
    use crate::net::LinkControl;
    use std::sync::{Arc, Mutex};

    struct NullHypervisor;

    impl Hypervisor for NullHypervisor {
        fn list_domains(&self) -> std::result::Result<Vec<DomainInfo>, HypervisorError> {
            Ok(Vec::new())
        }
        fn vcpu_count(&self, _: &str) -> std::result::Result<u32, HypervisorError> {
            Ok(0)
        }
        fn vcpu_pins(&self, _: &str) -> std::result::Result<Vec<Vec<bool>>, HypervisorError> {
            Ok(Vec::new())
        }
        fn pin_vcpu(
            &self,
            _: &str,
            _: u32,
            _: &[bool],
        ) -> std::result::Result<(), HypervisorError> {
            Ok(())
        }
        fn destroy(&self, _: &str) -> std::result::Result<(), HypervisorError> {
            Ok(())
        }
        fn cpu_time_seconds(&self, _: &str) -> std::result::Result<f64, HypervisorError> {
            Ok(0.0)
        }
    }

    #[derive(Default)]
    struct MockLinks {
        downs: Mutex<Vec<String>>,
        rates: Mutex<Vec<(String, u64, u64)>>,
        fail_apply: bool,
    }

    impl LinkControl for MockLinks {
        fn vxlan_links(&self) -> std::result::Result<Vec<String>, NetError> {
            Ok(Vec::new())
        }
        fn set_down(&self, iface: &str) -> std::result::Result<(), NetError> {
            self.downs.lock().unwrap().push(iface.to_string());
            Ok(())
        }
        fn apply_rate(
            &self,
            iface: &str,
            rate: u64,
            delay: u64,
        ) -> std::result::Result<(), NetError> {
            if self.fail_apply {
                return Err(NetError::Tc {
                    verb: "add",
                    iface: iface.to_string(),
                    detail: "boom".to_string(),
                });
            }
            self.rates.lock().unwrap().push((iface.to_string(), rate, delay));
            Ok(())
        }
    }

    fn context(links: Arc<MockLinks>) -> KillContext {
        let dir = std::env::temp_dir().join("ork-shaper-test-kmsg");
        KillContext {
            hv: Arc::new(NullHypervisor),
            links,
            actions: Arc::new(ActionLogger::new(dir)),
        }
    }

    fn quiet_nic(tx_bytes_per_tick: u64) -> NicActivity {
        let mut nic = NicActivity::new("vxlan0", NicStats::default());
        nic.observe(NicStats {
            tx_bytes: tx_bytes_per_tick,
            ..NicStats::default()
        });
        nic
    }

    #[test]
    fn squeeze_walks_the_whole_ladder_then_shuts_down() {
        let links = Arc::new(MockLinks::default());
        let ctx = context(Arc::clone(&links));
        let nic = quiet_nic(10_000_000); // below hard threshold

        for _ in 0..MAX_RUNG {
            kill(&ctx, &nic).unwrap();
        }

        let rates = links.rates.lock().unwrap();
        assert_eq!(rates.len() as u32, MAX_RUNG);
        assert_eq!(rates[0], ("vxlan0".to_string(), 250_000_000, 0));
        assert_eq!(rates[6], ("vxlan0".to_string(), 1_250_000, 10_000));
        assert_eq!(rates[10], ("vxlan0".to_string(), 25_000, 200));
        assert!(links.downs.lock().unwrap().is_empty());
        drop(rates);

        // Rung 12 does not exist: the interface goes down.
        kill(&ctx, &nic).unwrap();
        assert_eq!(*links.downs.lock().unwrap(), vec!["vxlan0"]);
    }

    #[test]
    fn hard_byte_threshold_shuts_down_immediately() {
        let links = Arc::new(MockLinks::default());
        let ctx = context(Arc::clone(&links));
        let nic = quiet_nic(200_000_000); // first delta ≥ hard threshold

        kill(&ctx, &nic).unwrap();
        assert_eq!(*links.downs.lock().unwrap(), vec!["vxlan0"]);
        assert!(links.rates.lock().unwrap().is_empty());
    }

    #[test]
    fn hard_packet_threshold_shuts_down_immediately() {
        let links = Arc::new(MockLinks::default());
        let ctx = context(Arc::clone(&links));
        let mut nic = NicActivity::new("vxlan0", NicStats::default());
        nic.observe(NicStats {
            tx_packets: 30_000,
            ..NicStats::default()
        });

        kill(&ctx, &nic).unwrap();
        assert_eq!(*links.downs.lock().unwrap(), vec!["vxlan0"]);
    }

    #[test]
    fn apply_failure_propagates() {
        let links = Arc::new(MockLinks {
            fail_apply: true,
            ..MockLinks::default()
        });
        let ctx = context(Arc::clone(&links));
        let nic = quiet_nic(10_000_000);

        assert!(kill(&ctx, &nic).is_err());
    }
}
