//! Process sampler and killability classification.
//!
//! Only killable processes enter the registry. A process is killable when
//! neither it nor any ancestor is on the node whitelist, with one carve-out:
//! the container supervisors (`core0`, `coreX`) are themselves protected
//! but their children are fair game.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sysinfo::{PidExt, ProcessExt, System, SystemExt};

use crate::activity::{Activity, ProcessActivity};
use crate::error::SamplerError;
use crate::registry::Registry;

/// Executable names that must never be killed.
const WHITELIST: &[&str] = &[
    "0-ork",
    "qemu-system-x86_64",
    "libvirtd",
    "coreX",
    "core0",
    "kthreadd",
    "g8ufs",
];

/// Whitelisted supervisors whose children are nevertheless killable.
const KILLABLE_KIDS_PARENTS: &[&str] = &["core0", "coreX"];

/// Minimal view of one process used by the killability walk.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    /// Executable name.
    pub name: String,
    /// Parent pid, when readable.
    pub ppid: Option<u32>,
}

/// Snapshot of the process tree, pid → record.
pub type ProcessTable = HashMap<u32, ProcessRecord>;

/// Splits the table into whitelisted pids and the subset whose children
/// are killable.
pub fn classify_table(table: &ProcessTable) -> (HashSet<u32>, HashSet<u32>) {
    let mut whitelist = HashSet::new();
    let mut killable_kids = HashSet::new();
    for (pid, record) in table {
        if WHITELIST.contains(&record.name.as_str()) {
            whitelist.insert(*pid);
            if KILLABLE_KIDS_PARENTS.contains(&record.name.as_str()) {
                killable_kids.insert(*pid);
            }
        }
    }
    (whitelist, killable_kids)
}

/// Decides whether a pid may be killed.
///
/// Walks the parent chain upward. Hitting a whitelisted ancestor stops the
/// walk: killable only if that ancestor is a killable-kids supervisor.
/// Reaching PID 1 without a whitelist hit means killable.
///
/// # Errors
///
/// Fails when the chain cannot be walked (missing record or unreadable
/// parent); the caller skips the candidate.
pub fn is_killable(
    pid: u32,
    table: &ProcessTable,
    whitelist: &HashSet<u32>,
    killable_kids: &HashSet<u32>,
) -> Result<bool, SamplerError> {
    if pid == 1 || pid == 2 {
        return Ok(false);
    }
    if whitelist.contains(&pid) {
        return Ok(false);
    }

    let mut current = pid;
    loop {
        let record = table
            .get(&current)
            .ok_or(SamplerError::MissingAncestor {
                pid,
                ancestor: current,
            })?;
        let ppid = record.ppid.ok_or(SamplerError::MissingAncestor {
            pid,
            ancestor: current,
        })?;

        if whitelist.contains(&ppid) {
            return Ok(killable_kids.contains(&ppid));
        }
        if ppid == 1 {
            return Ok(true);
        }
        if ppid == 0 || !table.contains_key(&ppid) {
            return Err(SamplerError::MissingAncestor { pid, ancestor: ppid });
        }
        current = ppid;
    }
}

/// Refreshes one registry entry per killable process each tick.
pub struct ProcessSampler {
    registry: Arc<Registry>,
    sys: System,
    ns_per_tick: u64,
}

impl ProcessSampler {
    /// Creates a sampler over the live process table.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sys: System::new(),
            ns_per_tick: ns_per_clock_tick(),
        }
    }

    /// One sampling tick.
    pub fn tick(&mut self) {
        self.sys.refresh_processes();

        let table: ProcessTable = self
            .sys
            .processes()
            .iter()
            .map(|(pid, process)| {
                (
                    pid.as_u32(),
                    ProcessRecord {
                        name: process.name().to_string(),
                        ppid: process.parent().map(|p| p.as_u32()),
                    },
                )
            })
            .collect();
        let (whitelist, killable_kids) = classify_table(&table);

        for (pid, process) in self.sys.processes() {
            let pid = pid.as_u32();
            match is_killable(pid, &table, &whitelist, &killable_kids) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::debug!("skipping pid {pid}: {e}");
                    continue;
                }
            }

            let cpu_time_ns = match read_cpu_time_ns(pid, self.ns_per_tick) {
                Ok(ns) => ns,
                Err(e) => {
                    tracing::debug!("skipping pid {pid}: {e}");
                    continue;
                }
            };
            let rss = process.memory();

            let key = pid.to_string();
            let mut record = match self.registry.get(&key) {
                Some(Activity::Process(mut p)) => {
                    p.observe_cpu_time(cpu_time_ns);
                    p
                }
                _ => ProcessActivity::new(pid, process.name(), cpu_time_ns, rss),
            };
            record.set_rss(rss);
            self.registry.insert(key, Activity::Process(record));
        }
    }
}

/// Nanoseconds per clock tick (`1e9 / CLK_TCK`).
fn ns_per_clock_tick() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if clk_tck <= 0 {
        10_000_000 // assume the usual 100 Hz
    } else {
        #[allow(clippy::cast_sign_loss)]
        {
            1_000_000_000 / clk_tck as u64
        }
    }
}

/// Reads cumulative user+system CPU time of a pid in nanoseconds.
fn read_cpu_time_ns(pid: u32, ns_per_tick: u64) -> Result<u64, SamplerError> {
    let path = format!("/proc/{pid}/stat");
    let content = std::fs::read_to_string(&path).map_err(|source| SamplerError::Read {
        path: path.clone(),
        source,
    })?;
    let ticks = parse_stat_cpu_ticks(&content).ok_or_else(|| SamplerError::InvalidCounter {
        path,
        content: content.lines().next().unwrap_or_default().to_string(),
    })?;
    Ok(ticks.saturating_mul(ns_per_tick))
}

/// Extracts `utime + stime` (clock ticks) from a `/proc/<pid>/stat` line.
///
/// The comm field may contain spaces and parentheses, so parsing starts
/// after the last `)`.
fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // After comm: state ppid pgrp session tty_nr tpgid flags
    //             minflt cminflt majflt cmajflt utime stime …
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}
