//! Boot-time configuration from the kernel command line.
//!
//! The node's boot loader passes guardian flags as one or more `ork=` keys,
//! each holding a whitespace-separated list of sub-flags, possibly quoted:
//!
//! ```text
//! console=ttyS0 ork="nomem nocpu" ork=nofairusage
//! ```

use crate::error::ConfigError;

/// Path of the kernel command line.
const CMDLINE_PATH: &str = "/proc/cmdline";

/// Which loops the agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Development node: the agent idles completely.
    pub development: bool,
    /// Run the memory monitor.
    pub memory: bool,
    /// Run the CPU monitor.
    pub cpu: bool,
    /// Run the network monitor.
    pub network: bool,
    /// Run the fair-usage engine.
    pub fairusage: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            development: false,
            memory: true,
            cpu: true,
            network: true,
            fairusage: true,
        }
    }
}

impl Config {
    /// Reads and parses `/proc/cmdline`.
    ///
    /// # Errors
    ///
    /// Fails when the command line cannot be read or tokenized.
    pub fn from_kernel_cmdline() -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(CMDLINE_PATH).map_err(|source| ConfigError::Read {
                path: CMDLINE_PATH.to_string(),
                source,
            })?;
        Self::parse(&text)
    }

    /// Parses a kernel command line.
    ///
    /// # Errors
    ///
    /// Fails on an unterminated quote.
    pub fn parse(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for token in tokenize(cmdline)? {
            let Some(value) = token.strip_prefix("ork=") else {
                continue;
            };
            for flag in value.split_whitespace() {
                match flag {
                    "development" => config.development = true,
                    "nomem" => config.memory = false,
                    "nocpu" => config.cpu = false,
                    "nonetwork" => config.network = false,
                    "nofairusage" => config.fairusage = false,
                    other => tracing::warn!("unknown ork flag '{other}'"),
                }
            }
        }
        Ok(config)
    }

    /// Whether the memory monitor runs.
    pub fn memory_monitor(&self) -> bool {
        !self.development && self.memory
    }

    /// Whether the CPU monitor runs.
    pub fn cpu_monitor(&self) -> bool {
        !self.development && self.cpu
    }

    /// Whether the network monitor runs.
    pub fn network_monitor(&self) -> bool {
        !self.development && self.network
    }

    /// Whether the fair-usage engine runs.
    pub fn fairusage_engine(&self) -> bool {
        !self.development && self.fairusage
    }

    /// Whether the samplers and peripheral loops run at all.
    pub fn active(&self) -> bool {
        !self.development
    }
}

/// Splits a kernel command line into tokens, honoring single and double
/// quotes the way a shell would (quotes group, they do not nest).
fn tokenize(text: &str) -> Result<Vec<String>, ConfigError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(ConfigError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_cmdline_enables_everything() {
        let config = Config::parse("console=ttyS0 root=/dev/sda1 quiet").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.memory_monitor());
        assert!(config.fairusage_engine());
    }

    #[test]
    fn single_flag() {
        let config = Config::parse("console=ttyS0 ork=nomem").unwrap();
        assert!(!config.memory_monitor());
        assert!(config.cpu_monitor());
    }

    #[test]
    fn quoted_value_carries_multiple_flags() {
        let config = Config::parse(r#"ork="nomem nocpu" root=/dev/sda1"#).unwrap();
        assert!(!config.memory_monitor());
        assert!(!config.cpu_monitor());
        assert!(config.network_monitor());
    }

    #[test]
    fn repeated_keys_accumulate() {
        let config = Config::parse("ork=nonetwork ork=nofairusage").unwrap();
        assert!(!config.network_monitor());
        assert!(!config.fairusage_engine());
        assert!(config.memory_monitor());
    }

    #[test]
    fn development_disables_everything() {
        let config = Config::parse("ork=development").unwrap();
        assert!(!config.active());
        assert!(!config.memory_monitor());
        assert!(!config.cpu_monitor());
        assert!(!config.network_monitor());
        assert!(!config.fairusage_engine());
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let config = Config::parse("ork=nodisk").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(Config::parse(r#"ork="nomem"#).is_err());
    }

    #[test]
    fn single_quotes_group_too() {
        let config = Config::parse("ork='nomem nofairusage'").unwrap();
        assert!(!config.memory_monitor());
        assert!(!config.fairusage_engine());
    }
}
