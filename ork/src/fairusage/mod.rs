//! Fair-usage enforcement.
//!
//! Once per second the engine walks every VM in the registry and compares
//! its smoothed CPU share against the fair-usage threshold. A VM over the
//! threshold climbs the warn → quarantine ladder; a VM below it walks back
//! out through a probation window. Quarantine means pinning the VM's vCPUs
//! onto the shared guest cores so it competes for a bounded slice of the
//! host instead of the whole machine.

pub mod slots;
pub mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::activity::{Activity, VmActivity};
use crate::error::{FairUsageError, Result};
use crate::hypervisor::Hypervisor;
use crate::klog::{Action, ActionLogger, State};
use crate::registry::Registry;

use self::slots::{OVERSUBSCRIPTION, Placement, SlotTable};
use self::state::{CpuSample, Phase};

/// Tunables of the fair-usage ladder.
#[derive(Debug, Clone, Copy)]
pub struct FairUsageParams {
    /// Seconds over threshold before the warning.
    pub warn_secs: i64,
    /// Seconds over threshold before quarantine.
    pub quarantine_secs: i64,
    /// Base seconds in quarantine before a release attempt.
    pub release_secs: i64,
    /// CPU share (cores-equivalent against one vCPU) that triggers the ladder.
    pub cpu_share_threshold: f64,
    /// Length of the probation measurement window.
    pub window_secs: i64,
}

impl Default for FairUsageParams {
    fn default() -> Self {
        Self {
            warn_secs: 300,
            quarantine_secs: 600,
            release_secs: 300,
            cpu_share_threshold: 0.8,
            window_secs: 5,
        }
    }
}

/// The fair-usage engine: slot table, pinned set, and the per-tick ladder.
pub struct FairUsageEngine {
    hv: Arc<dyn Hypervisor>,
    actions: Arc<ActionLogger>,
    table: Mutex<SlotTable>,
    params: FairUsageParams,
}

impl FairUsageEngine {
    /// Builds the engine for a host with `total_cores` physical cores.
    ///
    /// # Errors
    ///
    /// Fails when the host reservation leaves no guest cores.
    pub fn new(
        hv: Arc<dyn Hypervisor>,
        actions: Arc<ActionLogger>,
        total_cores: usize,
    ) -> std::result::Result<Self, FairUsageError> {
        Self::with_params(hv, actions, total_cores, FairUsageParams::default())
    }

    /// Builds the engine with explicit parameters.
    ///
    /// # Errors
    ///
    /// Fails when the host reservation leaves no guest cores.
    pub fn with_params(
        hv: Arc<dyn Hypervisor>,
        actions: Arc<ActionLogger>,
        total_cores: usize,
        params: FairUsageParams,
    ) -> std::result::Result<Self, FairUsageError> {
        Ok(Self {
            hv,
            actions,
            table: Mutex::new(SlotTable::new(total_cores, OVERSUBSCRIPTION)?),
            params,
        })
    }

    fn table(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuilds quarantine bookkeeping after an agent restart: any vCPU
    /// pinned to exactly one physical CPU means its VM is still under
    /// quarantine from a previous run.
    ///
    /// # Errors
    ///
    /// Fails when the hypervisor cannot be reached at all; per-domain
    /// errors are skipped.
    pub fn reconcile(&self) -> Result<()> {
        let domains = self.hv.list_domains().map_err(crate::error::OrkError::from)?;
        let mut table = self.table();

        for dom in domains {
            let pins = match self.hv.vcpu_pins(&dom.name) {
                Ok(pins) => pins,
                Err(e) => {
                    tracing::warn!("cannot read pins of '{}': {e}", dom.name);
                    continue;
                }
            };

            let mut seats = 0;
            for mask in pins {
                if mask.iter().filter(|set| **set).count() == 1 {
                    let core = mask.iter().position(|set| *set).unwrap_or_default();
                    table.credit_core(&dom.name, core);
                    seats += 1;
                }
            }
            if seats > 0 {
                tracing::info!(
                    "recovered quarantined machine '{}' ({seats} pinned vcpus)",
                    dom.name
                );
            }
        }
        Ok(())
    }

    /// One engine tick: refresh probation windows, then walk the ladder for
    /// every VM in the registry.
    pub fn tick(&self, registry: &Registry, now: i64) {
        self.aggregate_windows(registry, now);

        for (_, activity) in registry.items() {
            let Activity::Vm(vm) = activity else { continue };
            if vm.cpu_share() > self.params.cpu_share_threshold {
                tracing::debug!("machine '{}' exceeds its fair cpu share", vm.name());
                self.limit(&vm, now);
            } else {
                self.unlimit(&vm, now);
            }
        }
    }

    /// Whether a VM currently holds quarantine seats.
    pub fn is_pinned(&self, name: &str) -> bool {
        self.table().is_pinned(name)
    }

    /// Names of all quarantined VMs.
    pub fn pinned_vms(&self) -> Vec<String> {
        self.table().pinned_names()
    }

    /// Snapshot of the slot table.
    pub fn slots(&self) -> Vec<slots::CpuSlot> {
        self.table().slots()
    }

    /// Free quarantine seats.
    pub fn free_capacity(&self) -> u32 {
        self.table().free_capacity()
    }

    /// Escalation path for a VM over its share.
    fn limit(&self, vm: &VmActivity, now: i64) {
        let name = vm.name();
        let mut st = vm.fair_state();

        match st.phase {
            Phase::Idle | Phase::Release { .. } => {
                st.enter_threshold(now);
            }
            Phase::Threshold { since } => {
                if now - since >= self.params.warn_secs {
                    st.enter_warn(now);
                    self.actions.kernel(format_args!(
                        "machine {name} is exceeding its cpu share and will be quarantined"
                    ));
                    self.actions.action(Action::VmQuarantine, name, State::Warning);
                }
            }
            Phase::Warn { threshold_since, .. } => {
                if now - threshold_since >= self.params.quarantine_secs {
                    self.actions
                        .kernel(format_args!("attempting to quarantine machine {name}"));
                    match self.start_quarantine(name) {
                        Ok(()) => {
                            st.enter_quarantine(now);
                            self.actions.kernel(format_args!(
                                "successfully quarantined machine {name}"
                            ));
                            self.actions.action(Action::VmQuarantine, name, State::Success);
                        }
                        Err(e) => {
                            tracing::error!("failed to quarantine '{name}': {e}");
                            self.actions
                                .kernel(format_args!("error quarantining machine {name}"));
                            self.actions.action(Action::VmQuarantine, name, State::Error);
                        }
                    }
                }
            }
            Phase::Quarantine { .. } => {}
        }
    }

    /// De-escalation path for a VM below its share.
    fn unlimit(&self, vm: &VmActivity, now: i64) {
        let name = vm.name();
        let mut st = vm.fair_state();

        match st.phase {
            Phase::Quarantine { since } => {
                let wait = self.params.release_secs * i64::from(st.factor());
                if now - since >= wait {
                    self.actions
                        .kernel(format_args!("attempting to release machine {name}"));
                    match self.stop_quarantine(name) {
                        Ok(()) => st.enter_release(now),
                        Err(e) => {
                            tracing::error!("failed to release '{name}': {e}");
                            self.actions
                                .kernel(format_args!("error releasing machine {name}"));
                            self.actions.action(Action::VmUnquarantine, name, State::Error);
                        }
                    }
                }
            }
            Phase::Release { .. } => {
                let Some(average) = st.agg.window_average() else {
                    return;
                };
                if average >= self.params.cpu_share_threshold {
                    // Hot during probation: back under quarantine, and the
                    // next probation is further away.
                    match self.start_quarantine(name) {
                        Ok(()) => {
                            st.release_factor = st.factor() * 2;
                            st.enter_quarantine(now);
                            self.actions.kernel(format_args!(
                                "machine {name} abused its probation, re-quarantined"
                            ));
                            self.actions.action(Action::VmQuarantine, name, State::Success);
                        }
                        Err(e) => {
                            tracing::error!("failed to re-quarantine '{name}': {e}");
                            st.agg.clear();
                        }
                    }
                } else {
                    st.reset_idle();
                    self.actions
                        .kernel(format_args!("successfully released machine {name}"));
                    self.actions.action(Action::VmUnquarantine, name, State::Success);
                }
            }
            Phase::Idle | Phase::Threshold { .. } | Phase::Warn { .. } => {
                if self.table().is_pinned(name) {
                    // The pins survived an agent restart; resume quarantine
                    // from here.
                    st.enter_quarantine(now);
                } else if !matches!(st.phase, Phase::Idle) {
                    st.reset_idle();
                }
            }
        }
    }

    /// Refreshes the probation windows of all released VMs.
    fn aggregate_windows(&self, registry: &Registry, now: i64) {
        for (_, activity) in registry.items() {
            let Activity::Vm(vm) = activity else { continue };
            let mut st = vm.fair_state();

            if !matches!(st.phase, Phase::Release { .. }) {
                st.agg.clear();
                continue;
            }
            if st.agg.is_complete() {
                continue;
            }

            let total_seconds = match self.hv.cpu_time_seconds(vm.name()) {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!("no cpu time for '{}': {e}", vm.name());
                    continue;
                }
            };

            match st.agg.start {
                None => {
                    st.agg.start = Some(CpuSample {
                        timestamp: now,
                        total_seconds,
                    });
                }
                Some(start) if now - start.timestamp >= self.params.window_secs => {
                    st.agg.end = Some(CpuSample {
                        timestamp: now,
                        total_seconds,
                    });
                }
                Some(_) => {}
            }
        }
    }

    /// Pins all of a VM's vCPUs onto guest cores and credits the seats.
    fn start_quarantine(&self, name: &str) -> std::result::Result<(), FairUsageError> {
        let needed = self
            .hv
            .vcpu_count(name)
            .map_err(|source| FairUsageError::Query {
                name: name.to_string(),
                source,
            })?;

        let mut table = self.table();
        let placement = table.plan(name, needed)?;
        let total_cores = table.total_cores();

        if let Err(e) = self.pin_placement(name, &placement, total_cores) {
            // Undo any partial pins before reporting failure.
            self.unpin_all(name, needed, total_cores);
            return Err(e);
        }

        table.credit(name, &placement);
        Ok(())
    }

    /// Re-pins all of a VM's vCPUs to the full host mask and releases its
    /// seats.
    fn stop_quarantine(&self, name: &str) -> std::result::Result<(), FairUsageError> {
        let needed = self
            .hv
            .vcpu_count(name)
            .map_err(|source| FairUsageError::Query {
                name: name.to_string(),
                source,
            })?;

        let mut table = self.table();
        let full = vec![true; table.total_cores()];
        for vcpu in 0..needed {
            self.hv
                .pin_vcpu(name, vcpu, &full)
                .map_err(|source| FairUsageError::Unpin {
                    name: name.to_string(),
                    vcpu,
                    source,
                })?;
        }

        table.decredit(name);
        Ok(())
    }

    fn pin_placement(
        &self,
        name: &str,
        placement: &Placement,
        total_cores: usize,
    ) -> std::result::Result<(), FairUsageError> {
        for (core, vcpus) in placement {
            let mut mask = vec![false; total_cores];
            mask[*core] = true;
            for vcpu in vcpus {
                self.hv
                    .pin_vcpu(name, *vcpu, &mask)
                    .map_err(|source| FairUsageError::Pin {
                        name: name.to_string(),
                        vcpu: *vcpu,
                        core: *core,
                        source,
                    })?;
            }
        }
        Ok(())
    }

    fn unpin_all(&self, name: &str, vcpus: u32, total_cores: usize) {
        let full = vec![true; total_cores];
        for vcpu in 0..vcpus {
            if let Err(e) = self.hv.pin_vcpu(name, vcpu, &full) {
                tracing::warn!("undo unpin of '{name}' vcpu {vcpu} failed: {e}");
            }
        }
    }
}
