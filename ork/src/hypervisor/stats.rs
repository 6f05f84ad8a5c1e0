//! Domain statistics stream.
//!
//! The node's management layer aggregates per-domain counters and serves
//! them through an external command as a YAML map keyed
//! `<metric-type>/<domain-name>`. The guardian consumes the
//! `kvm.memory.max` series to refresh VM memory measurements.

use std::collections::HashMap;
use std::process::Command;

use serde::Deserialize;

use crate::error::HypervisorError;

/// Statistics key for a domain's maximum memory in bytes.
pub const KEY_MEMORY_MAX: &str = "kvm.memory.max";

/// One aggregated sample window.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Sample {
    /// Mean over the window.
    #[serde(default)]
    pub avg: f64,
    /// Sum over the window.
    #[serde(default)]
    pub total: f64,
    /// Maximum over the window.
    #[serde(default)]
    pub max: f64,
    /// Number of raw samples folded in.
    #[serde(default)]
    pub count: u64,
    /// Window start, seconds since epoch.
    #[serde(default)]
    pub start: i64,
}

/// Current state of one series in the stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesState {
    /// Aggregation operation applied to the series.
    #[serde(default)]
    pub op: String,
    /// Most recent raw value.
    #[serde(default)]
    pub last_value: f64,
    /// Timestamp of the most recent raw value.
    #[serde(default)]
    pub last_time: i64,
    /// Open sample windows keyed by window span in seconds.
    #[serde(default)]
    pub current: HashMap<String, Sample>,
    /// Closed sample windows keyed by window span in seconds.
    #[serde(default)]
    pub history: HashMap<String, Vec<Sample>>,
}

/// Client for the external statistics command.
pub struct StatisticsClient {
    command: String,
}

impl Default for StatisticsClient {
    fn default() -> Self {
        Self::new("corectl")
    }
}

impl StatisticsClient {
    /// Creates a client running the given statistics binary.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Fetches the raw series map for one statistics key.
    ///
    /// # Errors
    ///
    /// Fails when the command cannot run or its output is not the expected
    /// YAML map.
    pub fn fetch(&self, key: &str) -> Result<HashMap<String, SeriesState>, HypervisorError> {
        let command = format!("{} statistics {key}", self.command);
        let output = Command::new(&self.command)
            .args(["statistics", key])
            .output()
            .map_err(|source| HypervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(HypervisorError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_statistics(key, &String::from_utf8_lossy(&output.stdout))
    }

    /// Fetches one key and reduces it to `domain name → last_value`,
    /// dropping malformed keys.
    ///
    /// # Errors
    ///
    /// Fails when the underlying fetch fails.
    pub fn domain_values(&self, key: &str) -> Result<HashMap<String, f64>, HypervisorError> {
        let series = self.fetch(key)?;
        Ok(domain_values(series))
    }
}

/// Parses the YAML series map returned by the statistics command.
fn parse_statistics(
    key: &str,
    text: &str,
) -> Result<HashMap<String, SeriesState>, HypervisorError> {
    serde_yaml::from_str(text).map_err(|source| HypervisorError::Statistics {
        key: key.to_string(),
        source,
    })
}

/// Reduces a series map keyed `<type>/<domain>` to `domain → last_value`.
fn domain_values(series: HashMap<String, SeriesState>) -> HashMap<String, f64> {
    let mut values = HashMap::new();
    for (key, state) in series {
        let mut parts = key.splitn(2, '/');
        let (Some(_), Some(domain)) = (parts.next(), parts.next()) else {
            tracing::debug!("statistics key '{key}' does not match <type>/<domain>");
            continue;
        };
        if domain.is_empty() {
            tracing::debug!("statistics key '{key}' has an empty domain");
            continue;
        }
        values.insert(domain.to_string(), state.last_value);
    }
    values
}
