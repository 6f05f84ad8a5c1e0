//! Mitigation action logging.
//!
//! Every mitigation produces two records: a human-readable breadcrumb in the
//! kernel log (so it survives in `dmesg` even if the agent's own stdout is
//! lost) and a structured line on stdout for the supervising process.
//!
//! The kernel sink is best-effort: a node that is out of memory may not be
//! able to open `/dev/kmsg`, and the structured line must still go out.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

/// Prefix marking a structured action line on stdout.
const ACTION_PREFIX: &str = "20::";

/// Default kernel log device.
const KMSG_PATH: &str = "/dev/kmsg";

/// Mitigation kinds reported on the structured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// A VM was moved into (or warned about) CPU quarantine.
    #[serde(rename = "VM_QUARANTINE")]
    VmQuarantine,
    /// A VM was released from CPU quarantine.
    #[serde(rename = "VM_UNQUARANTINE")]
    VmUnquarantine,
    /// A network interface was administratively shut down.
    #[serde(rename = "NIC_SHUTDOWN")]
    NicShutdown,
}

/// Outcome attached to a structured action record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    /// The mitigation was applied.
    #[serde(rename = "SUCCESS")]
    Success,
    /// The mitigation failed.
    #[serde(rename = "ERROR")]
    Error,
    /// Advance notice that a mitigation is imminent.
    #[serde(rename = "WARNING")]
    Warning,
}

#[derive(Serialize)]
struct ActionRecord<'a> {
    action: Action,
    name: &'a str,
    state: State,
}

/// Sink for mitigation records.
///
/// Holds only the kernel device path; the device is opened per write so a
/// transient failure on one record does not wedge the logger.
#[derive(Debug)]
pub struct ActionLogger {
    kmsg_path: PathBuf,
}

impl Default for ActionLogger {
    fn default() -> Self {
        Self::new(KMSG_PATH)
    }
}

impl ActionLogger {
    /// Creates a logger writing kernel breadcrumbs to `kmsg_path`.
    pub fn new(kmsg_path: impl Into<PathBuf>) -> Self {
        Self {
            kmsg_path: kmsg_path.into(),
        }
    }

    /// Writes a human-readable line to the kernel log. Best-effort.
    pub fn kernel(&self, message: fmt::Arguments<'_>) {
        let line = format!("ORK: {message}\n");
        tracing::info!("{}", line.trim_end());

        let result = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.kmsg_path)
            .and_then(|mut f| f.write_all(line.as_bytes()));

        if let Err(e) = result {
            tracing::warn!("failed to write to {}: {e}", self.kmsg_path.display());
        }
    }

    /// Emits a structured action record on stdout.
    pub fn action(&self, action: Action, name: &str, state: State) {
        let line = format_action(action, name, state);
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{line}");
        let _ = lock.flush();
    }
}

/// Renders one structured action line.
fn format_action(action: Action, name: &str, state: State) -> String {
    let record = ActionRecord {
        action,
        name,
        state,
    };
    // Serializing a flat struct of unit enums cannot fail.
    let json = serde_json::to_string(&record).unwrap_or_default();
    format!("{ACTION_PREFIX}{json}")
}
