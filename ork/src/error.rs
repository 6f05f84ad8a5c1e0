//! Error types for the resource guardian.

use thiserror::Error;

/// The main error type for all guardian operations.
///
/// Every subsystem (hypervisor access, netlink, sampling, fair-usage
/// accounting, configuration) has its own error enum; this type folds them
/// together so loop bodies can propagate with `?` and log one error per tick.
#[derive(Error, Debug)]
pub enum OrkError {
    /// Error talking to the hypervisor.
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// Error on the netlink / traffic-control surface.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Error while sampling an OS or hypervisor source.
    #[error("sampler error: {0}")]
    Sampler(#[from] SamplerError),

    /// Error in fair-usage slot accounting or pinning.
    #[error("fair usage error: {0}")]
    FairUsage(#[from] FairUsageError),

    /// Error resolving boot-time configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to deliver a signal to a process.
    #[error("failed to signal pid {pid}: {source}")]
    Kill {
        /// The target process.
        pid: i32,
        /// The errno from the kill(2) call.
        #[source]
        source: nix::Error,
    },

    /// A periodic loop thread could not be spawned.
    #[error("failed to spawn '{name}' loop: {source}")]
    SpawnLoop {
        /// The loop name.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the hypervisor interface.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// An external control command could not be spawned.
    #[error("failed to run '{command}': {source}")]
    Spawn {
        /// The command line that failed to start.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An external control command ran but reported failure.
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// The exit status.
        status: String,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// Command output did not match the expected shape.
    #[error("unparseable {what}: {detail}")]
    Parse {
        /// What was being parsed (e.g. "domstats output").
        what: &'static str,
        /// Description of the mismatch.
        detail: String,
    },

    /// The named domain is not known to the hypervisor.
    #[error("domain '{name}' not found")]
    DomainNotFound {
        /// The domain name that failed to resolve.
        name: String,
    },

    /// The statistics stream returned invalid YAML.
    #[error("invalid statistics stream for key '{key}': {source}")]
    Statistics {
        /// The statistics key that was queried.
        key: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors raised by the netlink / traffic-control surface.
#[derive(Error, Debug)]
pub enum NetError {
    /// The netlink connection could not be established.
    #[error("netlink connection failed: {0}")]
    Connection(std::io::Error),

    /// A netlink request failed.
    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// No link with the given name exists.
    #[error("link '{name}' not found")]
    LinkNotFound {
        /// The interface name.
        name: String,
    },

    /// A `tc` invocation failed.
    #[error("tc {verb} on '{iface}' failed: {detail}")]
    Tc {
        /// The tc subcommand (show / del / add).
        verb: &'static str,
        /// The interface being shaped.
        iface: String,
        /// Stderr or spawn error text.
        detail: String,
    },
}

/// Errors raised while sampling.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// A procfs or sysfs file could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// The file that failed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A counter file held something other than a decimal integer.
    #[error("invalid counter in '{path}': {content}")]
    InvalidCounter {
        /// The file that was read.
        path: String,
        /// The first line of what it contained.
        content: String,
    },

    /// A process vanished or has no readable parent chain.
    #[error("process {pid} has no record for ancestor {ancestor}")]
    MissingAncestor {
        /// The process being classified.
        pid: u32,
        /// The pid missing from the process table.
        ancestor: u32,
    },

    /// Filesystem usage could not be read.
    #[error("statvfs '{path}' failed: {source}")]
    Statvfs {
        /// The mountpoint that was probed.
        path: String,
        /// The errno from the statvfs(2) call.
        #[source]
        source: nix::Error,
    },
}

/// Errors raised by fair-usage pinning and slot accounting.
#[derive(Error, Debug)]
pub enum FairUsageError {
    /// Not enough free slot capacity to quarantine the VM.
    #[error("insufficient slot capacity for '{name}': need {needed} vcpus, {available} free")]
    InsufficientCapacity {
        /// The VM being quarantined.
        name: String,
        /// Number of vCPUs that needed placement.
        needed: u32,
        /// Free slot capacity across all guest cores.
        available: u32,
    },

    /// A vCPU pin operation failed mid-quarantine.
    #[error("failed to pin vcpu {vcpu} of '{name}' to core {core}: {source}")]
    Pin {
        /// The VM being pinned.
        name: String,
        /// The vCPU index.
        vcpu: u32,
        /// The physical core it was being pinned to.
        core: usize,
        /// The underlying hypervisor error.
        #[source]
        source: HypervisorError,
    },

    /// The host has no cores left for guests after the host reservation.
    #[error("no guest cores available ({total} total, {reserved} reserved)")]
    NoGuestCores {
        /// Total physical cores on the host.
        total: usize,
        /// Cores reserved for the host itself.
        reserved: usize,
    },

    /// A hypervisor query needed for pinning failed.
    #[error("hypervisor query for '{name}' failed: {source}")]
    Query {
        /// The VM being quarantined or released.
        name: String,
        /// The underlying hypervisor error.
        #[source]
        source: HypervisorError,
    },

    /// A vCPU could not be re-pinned to the full host mask.
    #[error("failed to unpin vcpu {vcpu} of '{name}': {source}")]
    Unpin {
        /// The VM being released.
        name: String,
        /// The vCPU index.
        vcpu: u32,
        /// The underlying hypervisor error.
        #[source]
        source: HypervisorError,
    },
}

/// Errors raised while resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The kernel command line could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// The cmdline path (normally /proc/cmdline).
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A quoted token was never closed.
    #[error("unterminated quote in kernel command line")]
    UnterminatedQuote,
}

/// Type alias for `Result<T, OrkError>`.
pub type Result<T> = std::result::Result<T, OrkError>;
