//! libvirt CLI implementation of the [`Hypervisor`] trait.
//!
//! Every operation is one `virsh` invocation: spawn, wait, parse. Nothing
//! is cached and no connection outlives a call, so a hypervisor restart
//! costs one failed tick and nothing else.

use std::process::Command;

use crate::error::HypervisorError;
use crate::hypervisor::{DomainInfo, Hypervisor};

/// [`Hypervisor`] implementation shelling out to `virsh`.
pub struct VirshHypervisor {
    virsh: String,
    host_cpus: usize,
}

impl VirshHypervisor {
    /// Creates a client using the `virsh` binary on `$PATH`.
    ///
    /// `host_cpus` sizes the pin masks returned by
    /// [`vcpu_pins`](Hypervisor::vcpu_pins).
    pub fn new(host_cpus: usize) -> Self {
        Self {
            virsh: "virsh".to_string(),
            host_cpus,
        }
    }

    /// Overrides the `virsh` binary path.
    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.virsh = path.into();
        self
    }

    fn run(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let command = format!("{} --quiet {}", self.virsh, args.join(" "));
        let output = Command::new(&self.virsh)
            .arg("--quiet")
            .args(args)
            .output()
            .map_err(|source| HypervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("failed to get domain") || stderr.contains("Domain not found") {
                // virsh reports a missing domain on stderr; the second arg
                // of every per-domain subcommand is the name.
                let name = args.get(1).copied().unwrap_or_default().to_string();
                return Err(HypervisorError::DomainNotFound { name });
            }
            return Err(HypervisorError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn domstats(&self, name: &str) -> Result<(u64, u64), HypervisorError> {
        let out = self.run(&["domstats", name, "--balloon", "--cpu-total"])?;
        parse_domstats(&out)
    }
}

impl Hypervisor for VirshHypervisor {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        let out = self.run(&["list", "--name"])?;
        let mut domains = Vec::new();
        for name in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // A domain can disappear between the list and the stats read.
            match self.domstats(name) {
                Ok((cpu_time_ns, max_memory_bytes)) => domains.push(DomainInfo {
                    name: name.to_string(),
                    cpu_time_ns,
                    max_memory_bytes,
                }),
                Err(e) => tracing::debug!("skipping domain '{name}': {e}"),
            }
        }
        Ok(domains)
    }

    fn vcpu_count(&self, name: &str) -> Result<u32, HypervisorError> {
        let out = self.run(&["vcpucount", name, "--live", "--active"])?;
        out.trim()
            .parse()
            .map_err(|_| HypervisorError::Parse {
                what: "vcpucount output",
                detail: out.trim().to_string(),
            })
    }

    fn vcpu_pins(&self, name: &str) -> Result<Vec<Vec<bool>>, HypervisorError> {
        let out = self.run(&["vcpupin", name])?;
        parse_vcpupin(&out, self.host_cpus)
    }

    fn pin_vcpu(&self, name: &str, vcpu: u32, mask: &[bool]) -> Result<(), HypervisorError> {
        let cpulist = mask_to_cpulist(mask);
        let vcpu = vcpu.to_string();
        self.run(&["vcpupin", name, &vcpu, &cpulist, "--live"])?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["destroy", name])?;
        Ok(())
    }

    fn cpu_time_seconds(&self, name: &str) -> Result<f64, HypervisorError> {
        let (cpu_time_ns, _) = self.domstats(name)?;
        #[allow(clippy::cast_precision_loss)]
        Ok(cpu_time_ns as f64 / 1e9)
    }
}

/// Extracts `(cpu.time ns, balloon.maximum bytes)` from `virsh domstats`
/// key=value output.
fn parse_domstats(output: &str) -> Result<(u64, u64), HypervisorError> {
    let mut cpu_time_ns = None;
    let mut max_memory_kib = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "cpu.time" => cpu_time_ns = value.parse::<u64>().ok(),
            "balloon.maximum" => max_memory_kib = value.parse::<u64>().ok(),
            _ => {}
        }
    }

    match (cpu_time_ns, max_memory_kib) {
        (Some(cpu), Some(mem)) => Ok((cpu, mem * 1024)),
        _ => Err(HypervisorError::Parse {
            what: "domstats output",
            detail: format!("missing cpu.time or balloon.maximum in {output:?}"),
        }),
    }
}

/// Parses `virsh vcpupin` output into one mask per vCPU.
///
/// Accepts both the tabular format (`" 0      0-3"`) and the legacy
/// colon-separated one (`"0: 0-3"`).
fn parse_vcpupin(output: &str, host_cpus: usize) -> Result<Vec<Vec<bool>>, HypervisorError> {
    let mut pins: Vec<(u32, Vec<bool>)> = Vec::new();

    for line in output.lines() {
        let line = line.trim().trim_start_matches('-');
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else { continue };
        let Ok(vcpu) = first.trim_end_matches(':').parse::<u32>() else {
            // Header line.
            continue;
        };
        let Some(cpulist) = parts.next() else {
            continue;
        };
        let mask = cpulist_to_mask(cpulist, host_cpus)?;
        pins.push((vcpu, mask));
    }

    pins.sort_by_key(|(vcpu, _)| *vcpu);
    Ok(pins.into_iter().map(|(_, mask)| mask).collect())
}

/// Expands a cpulist like `0-3,6` into a boolean mask of `host_cpus` slots.
fn cpulist_to_mask(cpulist: &str, host_cpus: usize) -> Result<Vec<bool>, HypervisorError> {
    let mut mask = vec![false; host_cpus];
    for part in cpulist.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (parse_cpu(a)?, parse_cpu(b)?),
            None => {
                let cpu = parse_cpu(part)?;
                (cpu, cpu)
            }
        };
        for cpu in start..=end {
            if cpu < host_cpus {
                mask[cpu] = true;
            }
        }
    }
    Ok(mask)
}

fn parse_cpu(s: &str) -> Result<usize, HypervisorError> {
    s.trim().parse().map_err(|_| HypervisorError::Parse {
        what: "cpulist",
        detail: s.to_string(),
    })
}

/// Renders a boolean mask as the cpulist `virsh vcpupin` expects.
pub(crate) fn mask_to_cpulist(mask: &[bool]) -> String {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (cpu, set) in mask.iter().enumerate() {
        if !set {
            continue;
        }
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == cpu => *end = cpu,
            _ => ranges.push((cpu, cpu)),
        }
    }
    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
