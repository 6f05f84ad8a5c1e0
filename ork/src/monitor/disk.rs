//! Disk space reclamation.
//!
//! Every five seconds, each real partition is checked for free bytes and
//! free inodes; a partition under its thresholds gets its assigned log
//! locations cleaned (whole directories emptied, glob patterns removed)
//! one at a time until it recovers.

use std::path::{Path, PathBuf};

use crate::error::SamplerError;

/// Default minimum free bytes per partition (100 MB).
pub const FREE_BYTES_THRESHOLD: u64 = 104_857_600;
/// Default minimum free inodes per partition.
pub const FREE_INODES_THRESHOLD: u64 = 104_858;

/// The root filesystem keeps a larger reserve.
const ROOT_FREE_BYTES_THRESHOLD: u64 = 209_715_200;
const ROOT_FREE_INODES_THRESHOLD: u64 = 524_288;

/// Log directories whose contents may be deleted.
const DELETABLE_DIRS: &[&str] = &["/opt/jumpscale7/var/log/", "/var/log/ovs/"];
/// Log file patterns that may be deleted.
const DELETABLE_PATTERNS: &[&str] = &["/var/log/syslog*"];

/// A mounted real filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Backing device.
    pub device: String,
    /// Mount point.
    pub mountpoint: String,
}

/// One reclaimable location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    /// Empty the directory, keeping the directory itself.
    DirContents(String),
    /// Remove every entry matching the glob pattern.
    Pattern(String),
}

impl Cleanup {
    fn path(&self) -> &str {
        match self {
            Self::DirContents(p) | Self::Pattern(p) => p,
        }
    }

    fn apply(&self) {
        match self {
            Self::DirContents(dir) => remove_dir_contents(Path::new(dir)),
            Self::Pattern(pattern) => remove_matching(pattern),
        }
    }
}

/// Frees log space on partitions that run out of bytes or inodes.
pub struct DiskMonitor {
    mounts_path: PathBuf,
    cleanups: Vec<Cleanup>,
}

impl Default for DiskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskMonitor {
    /// Creates the monitor with the built-in deletable locations.
    pub fn new() -> Self {
        let mut cleanups: Vec<Cleanup> = DELETABLE_DIRS
            .iter()
            .map(|d| Cleanup::DirContents((*d).to_string()))
            .collect();
        cleanups.extend(
            DELETABLE_PATTERNS
                .iter()
                .map(|p| Cleanup::Pattern((*p).to_string())),
        );
        Self {
            mounts_path: PathBuf::from("/proc/mounts"),
            cleanups,
        }
    }

    /// One monitor tick.
    pub fn tick(&self) {
        let mounts = match std::fs::read_to_string(&self.mounts_path) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("cannot read {}: {e}", self.mounts_path.display());
                return;
            }
        };
        let partitions = parse_mounts(&mounts);

        for (partition, cleanups) in assign_cleanups(&partitions, &self.cleanups) {
            let (bytes_threshold, inodes_threshold) = thresholds_for(&partition.mountpoint);
            let mut free = match free_space(&partition.mountpoint) {
                Ok(free) => free,
                Err(e) => {
                    tracing::warn!("cannot stat '{}': {e}", partition.mountpoint);
                    continue;
                }
            };

            for cleanup in cleanups {
                if free.bytes >= bytes_threshold && free.inodes >= inodes_threshold {
                    break;
                }
                tracing::info!(
                    "partition '{}' at '{}' under threshold, cleaning {:?}",
                    partition.device,
                    partition.mountpoint,
                    cleanup.path()
                );
                cleanup.apply();

                free = match free_space(&partition.mountpoint) {
                    Ok(free) => free,
                    Err(e) => {
                        tracing::warn!("cannot stat '{}': {e}", partition.mountpoint);
                        break;
                    }
                };
            }
        }
    }
}

/// Free capacity of a filesystem.
struct FreeSpace {
    bytes: u64,
    inodes: u64,
}

fn free_space(mountpoint: &str) -> Result<FreeSpace, SamplerError> {
    let stat =
        nix::sys::statvfs::statvfs(mountpoint).map_err(|source| SamplerError::Statvfs {
            path: mountpoint.to_string(),
            source,
        })?;
    #[allow(clippy::useless_conversion)]
    Ok(FreeSpace {
        bytes: u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()),
        inodes: u64::from(stat.files_available()),
    })
}

/// Thresholds for one mountpoint (the root keeps a larger reserve).
fn thresholds_for(mountpoint: &str) -> (u64, u64) {
    if mountpoint == "/" {
        (ROOT_FREE_BYTES_THRESHOLD, ROOT_FREE_INODES_THRESHOLD)
    } else {
        (FREE_BYTES_THRESHOLD, FREE_INODES_THRESHOLD)
    }
}

/// Real (device-backed) partitions from `/proc/mounts`.
fn parse_mounts(text: &str) -> Vec<Partition> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            device.starts_with("/dev/").then(|| Partition {
                device: device.to_string(),
                mountpoint: mountpoint.to_string(),
            })
        })
        .collect()
}

/// Assigns every cleanup location to the partition with the longest
/// mountpoint prefix; locations on unmounted paths are dropped.
fn assign_cleanups<'a>(
    partitions: &'a [Partition],
    cleanups: &[Cleanup],
) -> Vec<(&'a Partition, Vec<Cleanup>)> {
    let mut assigned: Vec<(&Partition, Vec<Cleanup>)> = Vec::new();

    for cleanup in cleanups {
        let best = partitions
            .iter()
            .filter(|p| cleanup.path().starts_with(&p.mountpoint))
            .max_by_key(|p| p.mountpoint.len());
        let Some(partition) = best else {
            tracing::debug!("no mountpoint for '{}'", cleanup.path());
            continue;
        };

        match assigned.iter_mut().find(|(p, _)| *p == partition) {
            Some((_, list)) => list.push(cleanup.clone()),
            None => assigned.push((partition, vec![cleanup.clone()])),
        }
    }
    assigned
}

/// Glob match supporting `*` wildcards.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Empties a directory, keeping the directory itself. Best-effort.
fn remove_dir_contents(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("cannot list '{}': {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::debug!("cannot remove '{}': {e}", path.display());
        }
    }
}

/// Removes every directory entry matching a glob pattern. Best-effort.
fn remove_matching(pattern: &str) {
    let path = Path::new(pattern);
    let (Some(parent), Some(name_pattern)) =
        (path.parent(), path.file_name().and_then(|n| n.to_str()))
    else {
        return;
    };

    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("cannot list '{}': {e}", parent.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !glob_match(name_pattern, name) {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::debug!("cannot remove '{}': {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_backed_mounts_are_partitions() {
        let mounts = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw 0 0
tmpfs /tmp tmpfs rw 0 0
/dev/sdb1 /var/log ext4 rw 0 0
";
        let partitions = parse_mounts(mounts);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].mountpoint, "/");
        assert_eq!(partitions[1].mountpoint, "/var/log");
    }

    #[test]
    fn cleanups_bind_to_the_longest_mountpoint() {
        let partitions = parse_mounts("/dev/sda1 / ext4 rw 0 0\n/dev/sdb1 /var/log ext4 rw 0 0\n");
        let cleanups = vec![
            Cleanup::Pattern("/var/log/syslog*".to_string()),
            Cleanup::DirContents("/opt/jumpscale7/var/log/".to_string()),
        ];
        let assigned = assign_cleanups(&partitions, &cleanups);

        let log_partition = assigned
            .iter()
            .find(|(p, _)| p.mountpoint == "/var/log")
            .unwrap();
        assert_eq!(log_partition.1, vec![cleanups[0].clone()]);

        let root_partition = assigned.iter().find(|(p, _)| p.mountpoint == "/").unwrap();
        assert_eq!(root_partition.1, vec![cleanups[1].clone()]);
    }

    #[test]
    fn unmounted_locations_are_dropped() {
        let partitions = parse_mounts("/dev/sdb1 /data ext4 rw 0 0\n");
        let cleanups = vec![Cleanup::Pattern("/var/log/syslog*".to_string())];
        assert!(assign_cleanups(&partitions, &cleanups).is_empty());
    }

    #[test]
    fn root_keeps_a_larger_reserve() {
        assert_eq!(
            thresholds_for("/"),
            (ROOT_FREE_BYTES_THRESHOLD, ROOT_FREE_INODES_THRESHOLD)
        );
        assert_eq!(
            thresholds_for("/var/log"),
            (FREE_BYTES_THRESHOLD, FREE_INODES_THRESHOLD)
        );
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("syslog*", "syslog"));
        assert!(glob_match("syslog*", "syslog.1.gz"));
        assert!(!glob_match("syslog*", "kern.log"));
        assert!(glob_match("*.log", "kern.log"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("a*b*c", "a-x-b-y"));
    }

    #[test]
    fn dir_contents_removal_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.log"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/two.log"), "y").unwrap();

        remove_dir_contents(dir.path());

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn pattern_removal_only_touches_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("syslog"), "x").unwrap();
        std::fs::write(dir.path().join("syslog.1"), "x").unwrap();
        std::fs::write(dir.path().join("kern.log"), "x").unwrap();

        let pattern = dir.path().join("syslog*");
        remove_matching(pattern.to_str().unwrap());

        assert!(!dir.path().join("syslog").exists());
        assert!(!dir.path().join("syslog.1").exists());
        assert!(dir.path().join("kern.log").exists());
    }
}
