//! Guest-core slot accounting.
//!
//! The first cores of the host are reserved for the host itself; the rest
//! are guest cores, each with a fixed oversubscription capacity. Quarantine
//! packs a VM's vCPUs onto the guest cores greedily, and the slot table
//! tracks exactly which VM holds how many seats on which core.
//!
//! Invariants, checked by the tests below:
//! - every slot's `count` equals the sum of its per-VM seat counts;
//! - a VM is in the pinned set iff it holds at least one seat somewhere.

use std::collections::{HashMap, HashSet};

use crate::error::FairUsageError;

/// Maximum quarantined vCPUs per guest core.
pub const OVERSUBSCRIPTION: u32 = 4;

/// Cores kept for the host: 1 on small boxes, up to 4 on large ones.
pub fn host_reserved_cores(total_cores: usize) -> usize {
    if total_cores <= 16 {
        1
    } else if total_cores <= 32 {
        2
    } else {
        4
    }
}

/// Seat bookkeeping for one guest core.
#[derive(Debug, Clone)]
pub struct CpuSlot {
    /// Physical core index.
    pub core: usize,
    /// Seats taken on this core.
    pub count: u32,
    /// Seats per VM name.
    pub vms: HashMap<String, u32>,
}

/// Placement of one VM's vCPUs: `(core, vcpu indices)` pairs.
pub type Placement = Vec<(usize, Vec<u32>)>;

/// The slot table plus the pinned-VM set, kept together because they share
/// one invariant and must change under the same lock.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<CpuSlot>,
    pinned: HashSet<String>,
    oversubscription: u32,
    total_cores: usize,
}

impl SlotTable {
    /// Builds the table for a host with `total_cores` physical cores.
    ///
    /// # Errors
    ///
    /// Fails when the host reservation leaves no guest cores.
    pub fn new(total_cores: usize, oversubscription: u32) -> Result<Self, FairUsageError> {
        let reserved = host_reserved_cores(total_cores);
        if total_cores <= reserved {
            return Err(FairUsageError::NoGuestCores {
                total: total_cores,
                reserved,
            });
        }

        let slots = (reserved..total_cores)
            .map(|core| CpuSlot {
                core,
                count: 0,
                vms: HashMap::new(),
            })
            .collect();

        Ok(Self {
            slots,
            pinned: HashSet::new(),
            oversubscription,
            total_cores,
        })
    }

    /// Physical core count of the host (sizes pin masks).
    pub fn total_cores(&self) -> usize {
        self.total_cores
    }

    /// Free seats across all guest cores.
    pub fn free_capacity(&self) -> u32 {
        self.slots
            .iter()
            .map(|s| self.oversubscription.saturating_sub(s.count))
            .sum()
    }

    /// Greedily places `needed` consecutive vCPU indices onto guest cores.
    ///
    /// # Errors
    ///
    /// Fails without touching the table when capacity is insufficient.
    pub fn plan(&self, name: &str, needed: u32) -> Result<Placement, FairUsageError> {
        let mut placement = Placement::new();
        let mut next_vcpu = 0u32;
        let mut remaining = needed;

        for slot in &self.slots {
            if remaining == 0 {
                break;
            }
            let available = self.oversubscription.saturating_sub(slot.count);
            if available == 0 {
                continue;
            }
            let take = available.min(remaining);
            placement.push((slot.core, (next_vcpu..next_vcpu + take).collect()));
            next_vcpu += take;
            remaining -= take;
        }

        if remaining > 0 {
            return Err(FairUsageError::InsufficientCapacity {
                name: name.to_string(),
                needed,
                available: self.free_capacity(),
            });
        }
        Ok(placement)
    }

    /// Records a successfully pinned placement and registers the VM.
    pub fn credit(&mut self, name: &str, placement: &Placement) {
        for (core, vcpus) in placement {
            if let Some(slot) = self.slots.iter_mut().find(|s| s.core == *core) {
                #[allow(clippy::cast_possible_truncation)]
                let seats = vcpus.len() as u32;
                slot.count += seats;
                *slot.vms.entry(name.to_string()).or_insert(0) += seats;
            }
        }
        self.pinned.insert(name.to_string());
    }

    /// Records one reconciled seat for a VM found already pinned at startup.
    pub fn credit_core(&mut self, name: &str, core: usize) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.core == core) {
            slot.count += 1;
            *slot.vms.entry(name.to_string()).or_insert(0) += 1;
        }
        self.pinned.insert(name.to_string());
    }

    /// Releases every seat a VM holds and deregisters it.
    pub fn decredit(&mut self, name: &str) {
        for slot in &mut self.slots {
            if let Some(seats) = slot.vms.remove(name) {
                slot.count = slot.count.saturating_sub(seats);
            }
        }
        self.pinned.remove(name);
    }

    /// Whether the VM currently holds seats.
    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.contains(name)
    }

    /// Names of all pinned VMs.
    pub fn pinned_names(&self) -> Vec<String> {
        self.pinned.iter().cloned().collect()
    }

    /// Snapshot of the slots (for inspection and tests).
    pub fn slots(&self) -> Vec<CpuSlot> {
        self.slots.clone()
    }
}
