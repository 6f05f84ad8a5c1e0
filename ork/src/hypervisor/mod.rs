//! Hypervisor control surface.
//!
//! The guardian only needs five capabilities from the hypervisor: enumerate
//! running domains with their cumulative CPU time and maximum memory, read
//! and write vCPU pinning, destroy a domain, and read cumulative CPU time
//! for the release-window measurement. [`Hypervisor`] is that surface;
//! [`virsh::VirshHypervisor`] implements it against the libvirt CLI, and the
//! integration tests implement it in memory.

pub mod stats;
pub mod virsh;

use crate::error::HypervisorError;

/// One running guest as seen by the enumeration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    /// Domain name.
    pub name: String,
    /// Cumulative vCPU time in nanoseconds.
    pub cpu_time_ns: u64,
    /// Maximum memory in bytes.
    pub max_memory_bytes: u64,
}

/// The hypervisor capabilities the guardian consumes.
///
/// Implementations open whatever connection they need per operation and
/// release it before returning; no long-lived handles cross this boundary.
pub trait Hypervisor: Send + Sync {
    /// Enumerates running domains.
    ///
    /// # Errors
    ///
    /// Fails when the hypervisor cannot be reached; per-domain read errors
    /// should be skipped by the implementation, not surfaced here.
    fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError>;

    /// Number of live vCPUs of a domain.
    ///
    /// # Errors
    ///
    /// Fails when the domain does not exist or the hypervisor is down.
    fn vcpu_count(&self, name: &str) -> Result<u32, HypervisorError>;

    /// Current pin mask per vCPU, one `bool` per host CPU.
    ///
    /// # Errors
    ///
    /// Fails when the domain does not exist or the mask cannot be read.
    fn vcpu_pins(&self, name: &str) -> Result<Vec<Vec<bool>>, HypervisorError>;

    /// Pins one vCPU to the given host-CPU mask.
    ///
    /// # Errors
    ///
    /// Fails when the pin cannot be applied; the caller is responsible for
    /// undoing any pins already applied in the same batch.
    fn pin_vcpu(&self, name: &str, vcpu: u32, mask: &[bool]) -> Result<(), HypervisorError>;

    /// Forcefully destroys a domain.
    ///
    /// # Errors
    ///
    /// Fails when the domain cannot be destroyed; the registry entry is
    /// kept so the next tick can retry.
    fn destroy(&self, name: &str) -> Result<(), HypervisorError>;

    /// Cumulative CPU time of a domain in seconds.
    ///
    /// # Errors
    ///
    /// Fails when the domain does not exist or the counter cannot be read.
    fn cpu_time_seconds(&self, name: &str) -> Result<f64, HypervisorError>;
}
