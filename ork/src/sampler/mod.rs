//! Periodic samplers feeding the activity registry.
//!
//! Three independent 1 Hz loops: guests from the hypervisor, killable
//! processes from the OS, vxlan overlays from netlink + sysfs. Each tick
//! refreshes (or creates) registry entries and resets their TTL; a transient
//! read failure for one entity skips that entity, never the tick.

pub mod nic;
pub mod process;
pub mod vm;

pub use nic::NicSampler;
pub use process::ProcessSampler;
pub use vm::VmSampler;
