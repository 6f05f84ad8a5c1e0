//! Activity records: the workloads the guardian measures and mitigates.
//!
//! Three concrete kinds exist (VMs, processes, and virtual network
//! interfaces), sharing one capability set: a name, a kill priority, and
//! current memory / CPU / network measurements. The registry stores the
//! tagged [`Activity`] value; monitors decide on the shared capabilities and
//! call [`Activity::kill`], whose meaning differs per kind (destroy the
//! domain, SIGKILL the process, squeeze or shut down the interface).
//!
//! Registry values are cloned on every read, so state that must survive a
//! sampler's read-modify-write refresh (the fair-usage phase and the NIC
//! shaping rung) is held behind `Arc` and shared by all clones.

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::fairusage::state::FairState;
use crate::hypervisor::Hypervisor;
use crate::klog::ActionLogger;
use crate::net::LinkControl;
use crate::shaper;
use crate::stats::{DeltaCounter, Ewma};

/// Kill priority of a VM. Higher priorities are killed first under
/// memory/CPU pressure.
pub const VM_PRIORITY: u32 = 100;
/// Kill priority of a virtual interface.
pub const NIC_PRIORITY: u32 = 50;
/// Kill priority of a plain process.
pub const PROCESS_PRIORITY: u32 = 10;

/// Sample span for VM and process CPU-share averages.
pub const CPU_EWMA_SPAN: u32 = 60;
/// Sample span for interface rate averages.
pub const NET_EWMA_SPAN: u32 = 180;

/// EWMA-smoothed absolute traffic rates for one activity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkUsage {
    /// Received bytes per second.
    pub rx_bytes_per_s: f64,
    /// Transmitted bytes per second.
    pub tx_bytes_per_s: f64,
    /// Received packets per second.
    pub rx_packets_per_s: f64,
    /// Transmitted packets per second.
    pub tx_packets_per_s: f64,
}

/// Everything a mitigation needs: the hypervisor for VM destruction, the
/// link surface for NIC shaping, and the action logger for the records
/// every mitigation must leave behind.
#[derive(Clone)]
pub struct KillContext {
    /// Hypervisor control surface.
    pub hv: Arc<dyn Hypervisor>,
    /// Netlink / traffic-control surface.
    pub links: Arc<dyn LinkControl>,
    /// Kernel-log + structured-stdout sink.
    pub actions: Arc<ActionLogger>,
}

/// A workload under guard.
#[derive(Clone)]
pub enum Activity {
    /// A running virtual machine.
    Vm(VmActivity),
    /// A killable user process.
    Process(ProcessActivity),
    /// A virtual overlay network interface.
    Nic(NicActivity),
}

impl Activity {
    /// The registry key: domain name, stringified PID, or interface name.
    pub fn name(&self) -> &str {
        match self {
            Self::Vm(vm) => &vm.name,
            Self::Process(p) => &p.name,
            Self::Nic(n) => &n.name,
        }
    }

    /// Kill priority; higher is killed first.
    pub fn priority(&self) -> u32 {
        match self {
            Self::Vm(_) => VM_PRIORITY,
            Self::Process(_) => PROCESS_PRIORITY,
            Self::Nic(_) => NIC_PRIORITY,
        }
    }

    /// Current memory footprint in bytes.
    pub fn memory(&self) -> u64 {
        match self {
            Self::Vm(vm) => vm.memory_bytes,
            Self::Process(p) => p.rss_bytes,
            Self::Nic(_) => 0,
        }
    }

    /// Smoothed CPU share in cores-equivalent.
    pub fn cpu(&self) -> f64 {
        match self {
            Self::Vm(vm) => vm.cpu_share(),
            Self::Process(p) => p.cpu_share(),
            Self::Nic(_) => 0.0,
        }
    }

    /// Smoothed traffic rates.
    pub fn network(&self) -> NetworkUsage {
        match self {
            Self::Nic(n) => n.usage,
            Self::Vm(_) | Self::Process(_) => NetworkUsage::default(),
        }
    }

    /// Applies the kind-specific mitigation.
    ///
    /// # Errors
    ///
    /// Propagates the hypervisor, signal, or link error when the mitigation
    /// could not be applied; the caller keeps the registry entry in place.
    pub fn kill(&self, ctx: &KillContext) -> Result<()> {
        match self {
            Self::Vm(vm) => vm.kill(ctx),
            Self::Process(p) => p.kill(ctx),
            Self::Nic(n) => shaper::kill(ctx, n),
        }
    }
}

// ── VM ──────────────────────────────────────────────────────────────

/// A running guest domain.
#[derive(Clone)]
pub struct VmActivity {
    name: String,
    memory_bytes: u64,
    cpu_delta: DeltaCounter,
    cpu_share: Ewma,
    fair: Arc<Mutex<FairState>>,
}

impl VmActivity {
    /// Creates a record for a newly observed domain, priming the delta on
    /// the current cumulative vCPU time.
    pub fn new(name: impl Into<String>, cpu_time_ns: u64, memory_bytes: u64) -> Self {
        Self {
            name: name.into(),
            memory_bytes,
            cpu_delta: DeltaCounter::new(cpu_time_ns),
            cpu_share: Ewma::new(CPU_EWMA_SPAN),
            fair: Arc::new(Mutex::new(FairState::default())),
        }
    }

    /// Feeds the next cumulative vCPU-time observation. The per-tick delta
    /// is normalized to cores-equivalent (seconds of CPU per wall second at
    /// the 1 Hz sampling cadence) before smoothing.
    pub fn observe_cpu_time(&mut self, cpu_time_ns: u64) {
        let delta_ns = self.cpu_delta.next(cpu_time_ns);
        #[allow(clippy::cast_precision_loss)]
        self.cpu_share.add(delta_ns as f64 / 1e9);
    }

    /// Refreshes the memory measurement.
    pub fn set_memory(&mut self, bytes: u64) {
        self.memory_bytes = bytes;
    }

    /// Domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Smoothed CPU share in cores-equivalent.
    pub fn cpu_share(&self) -> f64 {
        self.cpu_share.value()
    }

    /// Locks the fair-usage state shared by all clones of this record.
    pub fn fair_state(&self) -> MutexGuard<'_, FairState> {
        self.fair.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kill(&self, ctx: &KillContext) -> Result<()> {
        ctx.actions
            .kernel(format_args!("attempting to destroy machine {}", self.name));

        if let Err(e) = ctx.hv.destroy(&self.name) {
            ctx.actions
                .kernel(format_args!("error destroying machine {}", self.name));
            tracing::error!("failed to destroy domain '{}': {e}", self.name);
            return Err(e.into());
        }

        ctx.actions
            .kernel(format_args!("successfully destroyed machine {}", self.name));
        Ok(())
    }
}

// ── Process ─────────────────────────────────────────────────────────

/// A killable user process, keyed by its stringified PID.
#[derive(Clone)]
pub struct ProcessActivity {
    name: String,
    pid: u32,
    exe: String,
    rss_bytes: u64,
    cpu_delta: DeltaCounter,
    cpu_share: Ewma,
}

impl ProcessActivity {
    /// Creates a record for a newly observed process, priming the delta on
    /// its current cumulative CPU time.
    pub fn new(pid: u32, exe: impl Into<String>, cpu_time_ns: u64, rss_bytes: u64) -> Self {
        Self {
            name: pid.to_string(),
            pid,
            exe: exe.into(),
            rss_bytes,
            cpu_delta: DeltaCounter::new(cpu_time_ns),
            cpu_share: Ewma::new(CPU_EWMA_SPAN),
        }
    }

    /// Feeds the next cumulative CPU-time observation (user + system).
    pub fn observe_cpu_time(&mut self, cpu_time_ns: u64) {
        let delta_ns = self.cpu_delta.next(cpu_time_ns);
        #[allow(clippy::cast_precision_loss)]
        self.cpu_share.add(delta_ns as f64 / 1e9);
    }

    /// Refreshes the resident-set measurement.
    pub fn set_rss(&mut self, bytes: u64) {
        self.rss_bytes = bytes;
    }

    /// The process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Smoothed CPU share in cores-equivalent.
    pub fn cpu_share(&self) -> f64 {
        self.cpu_share.value()
    }

    fn kill(&self, ctx: &KillContext) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        ctx.actions.kernel(format_args!(
            "attempting to kill process with pid {} and name {}",
            self.pid, self.exe
        ));

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            ctx.actions.kernel(format_args!(
                "error killing process with pid {} and name {}",
                self.pid, self.exe
            ));
            tracing::error!("failed to kill process {} ({}): {e}", self.pid, self.exe);
            return Err(crate::error::OrkError::Kill {
                pid: pid.as_raw(),
                source: e,
            });
        }

        ctx.actions.kernel(format_args!(
            "successfully killed process with pid {} and name {}",
            self.pid, self.exe
        ));
        Ok(())
    }
}

// ── NIC ─────────────────────────────────────────────────────────────

/// One reading of the four sysfs counters for an interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct NicStats {
    /// Cumulative received bytes.
    pub rx_bytes: u64,
    /// Cumulative transmitted bytes.
    pub tx_bytes: u64,
    /// Cumulative received packets.
    pub rx_packets: u64,
    /// Cumulative transmitted packets.
    pub tx_packets: u64,
}

#[derive(Clone)]
struct CounterTrack {
    delta: DeltaCounter,
    ewma: Ewma,
}

impl CounterTrack {
    fn new(initial: u64) -> Self {
        Self {
            delta: DeltaCounter::new(initial),
            ewma: Ewma::new(NET_EWMA_SPAN),
        }
    }

    fn observe(&mut self, current: u64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let delta = self.delta.next(current) as f64;
        self.ewma.add(delta);
        self.ewma.value()
    }
}

/// A virtual overlay interface under shaping.
#[derive(Clone)]
pub struct NicActivity {
    name: String,
    rx_bytes: CounterTrack,
    tx_bytes: CounterTrack,
    rx_packets: CounterTrack,
    tx_packets: CounterTrack,
    usage: NetworkUsage,
    rung: Arc<AtomicU32>,
}

impl NicActivity {
    /// Creates a record for a newly observed interface, priming the four
    /// deltas on the current counters.
    pub fn new(name: impl Into<String>, initial: NicStats) -> Self {
        Self {
            name: name.into(),
            rx_bytes: CounterTrack::new(initial.rx_bytes),
            tx_bytes: CounterTrack::new(initial.tx_bytes),
            rx_packets: CounterTrack::new(initial.rx_packets),
            tx_packets: CounterTrack::new(initial.tx_packets),
            usage: NetworkUsage::default(),
            rung: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Feeds the next counter reading and refreshes the smoothed rates.
    pub fn observe(&mut self, stats: NicStats) {
        self.usage = NetworkUsage {
            rx_bytes_per_s: self.rx_bytes.observe(stats.rx_bytes),
            tx_bytes_per_s: self.tx_bytes.observe(stats.tx_bytes),
            rx_packets_per_s: self.rx_packets.observe(stats.rx_packets),
            tx_packets_per_s: self.tx_packets.observe(stats.tx_packets),
        };
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Smoothed traffic rates.
    pub fn usage(&self) -> NetworkUsage {
        self.usage
    }

    /// The shaping-rung counter, shared by all clones of this record.
    pub fn rung(&self) -> &Arc<AtomicU32> {
        &self.rung
    }
}

// ── Kill-order snapshots ────────────────────────────────────────────

/// One activity with its sort keys pre-materialised, so ordering decisions
/// never have to call back into a fallible measurement source.
pub struct Victim {
    /// Registry key.
    pub name: String,
    /// Kill priority.
    pub priority: u32,
    /// Memory footprint at snapshot time.
    pub memory: u64,
    /// CPU share at snapshot time.
    pub cpu: f64,
    /// The activity itself.
    pub activity: Activity,
}

/// Materialises sort keys for a registry snapshot.
pub fn victims(snapshot: Vec<(String, Activity)>) -> Vec<Victim> {
    snapshot
        .into_iter()
        .map(|(name, activity)| Victim {
            priority: activity.priority(),
            memory: activity.memory(),
            cpu: activity.cpu(),
            name,
            activity,
        })
        .collect()
}

/// Orders victims for the memory monitor: higher priority first, then more
/// memory first.
pub fn sort_by_memory(victims: &mut [Victim]) {
    victims.sort_unstable_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.memory.cmp(&a.memory))
    });
}

/// Orders victims for the CPU monitor: higher priority first, then more
/// CPU first.
pub fn sort_by_cpu(victims: &mut [Victim]) {
    victims.sort_unstable_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.cpu.total_cmp(&a.cpu))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, memory: u64, cpu_samples: &[u64]) -> Activity {
        let mut vm = VmActivity::new(name, 0, memory);
        let mut total = 0;
        for s in cpu_samples {
            total += s;
            vm.observe_cpu_time(total);
        }
        Activity::Vm(vm)
    }

    fn process(pid: u32, rss: u64) -> Activity {
        Activity::Process(ProcessActivity::new(pid, "stress", 0, rss))
    }

    #[test]
    fn priorities_follow_the_kind() {
        assert_eq!(vm("vm1", 0, &[]).priority(), 100);
        assert_eq!(process(42, 0).priority(), 10);
        assert_eq!(
            Activity::Nic(NicActivity::new("vxlan0", NicStats::default())).priority(),
            50
        );
    }

    #[test]
    fn vm_cpu_share_is_normalized_to_cores() {
        // 950 ms of vCPU time per 1 s tick → share ≈ 0.95.
        let activity = vm("vm1", 0, &[950_000_000; 20]);
        assert!((activity.cpu() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn memory_sort_puts_vms_before_fatter_processes() {
        let mut list = victims(vec![
            ("100".into(), process(100, 8 << 30)),
            ("vm1".into(), vm("vm1", 1 << 30, &[])),
            ("vxlan0".into(), Activity::Nic(NicActivity::new("vxlan0", NicStats::default()))),
        ]);
        sort_by_memory(&mut list);
        let order: Vec<_> = list.iter().map(|v| v.name.as_str()).collect();
        // Priority dominates: VM (100) first despite the 8 GiB process.
        assert_eq!(order, vec!["vm1", "vxlan0", "100"]);
    }

    #[test]
    fn memory_sort_breaks_priority_ties_by_size() {
        let mut list = victims(vec![
            ("small".into(), process(1, 1 << 20)),
            ("big".into(), process(2, 1 << 30)),
        ]);
        sort_by_memory(&mut list);
        assert_eq!(list[0].name, "big");
    }

    #[test]
    fn cpu_sort_breaks_priority_ties_by_share() {
        let mut busy = ProcessActivity::new(1, "busy", 0, 0);
        let mut idle = ProcessActivity::new(2, "idle", 0, 0);
        for i in 1..=20u64 {
            busy.observe_cpu_time(i * 900_000_000);
            idle.observe_cpu_time(i * 10_000_000);
        }
        let mut list = victims(vec![
            ("2".into(), Activity::Process(idle)),
            ("1".into(), Activity::Process(busy)),
        ]);
        sort_by_cpu(&mut list);
        assert_eq!(list[0].name, "1");
    }

    #[test]
    fn nic_rates_are_absolute_per_second() {
        let mut nic = NicActivity::new(
            "vxlan0",
            NicStats {
                rx_bytes: 1_000,
                tx_bytes: 2_000,
                rx_packets: 10,
                tx_packets: 20,
            },
        );
        for i in 1..=5u64 {
            nic.observe(NicStats {
                rx_bytes: 1_000 + i * 500,
                tx_bytes: 2_000 + i * 1_000,
                rx_packets: 10 + i * 5,
                tx_packets: 20 + i * 7,
            });
        }
        let usage = nic.usage();
        assert!((usage.rx_bytes_per_s - 500.0).abs() < f64::EPSILON);
        assert!((usage.tx_bytes_per_s - 1_000.0).abs() < f64::EPSILON);
        assert!((usage.rx_packets_per_s - 5.0).abs() < f64::EPSILON);
        assert!((usage.tx_packets_per_s - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rung_is_shared_across_clones() {
        use std::sync::atomic::Ordering;

        let nic = NicActivity::new("vxlan0", NicStats::default());
        let clone = nic.clone();
        nic.rung().store(3, Ordering::SeqCst);
        assert_eq!(clone.rung().load(Ordering::SeqCst), 3);
    }
}
