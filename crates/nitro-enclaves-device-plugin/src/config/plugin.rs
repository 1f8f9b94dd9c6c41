use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::config::Cli;

/// An EC2 instance with the Nitro Enclaves option enabled supports up to
/// four enclaves.
pub const MAX_ENCLAVES_PER_INSTANCE: i64 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "max devices per node must be greater than 0 and smaller or equal to {max} - set value to max"
    )]
    MaxEnclavesOutOfRange { max: i64 },
}

/// Parameters shared by the enclave device plugin and the enclave CPU plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub max_enclaves_per_node: i64,
    pub enclave_cpu_advertisement: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            max_enclaves_per_node: MAX_ENCLAVES_PER_INSTANCE,
            enclave_cpu_advertisement: false,
        }
    }
}

impl PluginConfig {
    /// Builds a config from raw setting values. Unset or unparsable values
    /// fall back to their defaults; range checks are left to [`Self::validate`].
    pub fn load(
        max_enclaves_per_node: Option<&str>,
        enclave_cpu_advertisement: Option<&str>,
    ) -> Self {
        let enclave_cpu_advertisement = match enclave_cpu_advertisement.map(parse_bool) {
            Some(Some(value)) => value,
            _ => {
                warn!(
                    "error parsing ENCLAVE_CPU_ADVERTISEMENT: {:?}, setting it to false",
                    enclave_cpu_advertisement
                );
                false
            }
        };

        let max_enclaves_per_node = match max_enclaves_per_node.map(|v| v.parse::<i64>()) {
            Some(Ok(value)) => value,
            _ => {
                warn!(
                    "error parsing MAX_ENCLAVES_PER_NODE: {:?}, setting it to {}",
                    max_enclaves_per_node, MAX_ENCLAVES_PER_INSTANCE
                );
                MAX_ENCLAVES_PER_INSTANCE
            }
        };

        let config = Self {
            max_enclaves_per_node,
            enclave_cpu_advertisement,
        };
        info!("loaded plugin config: {:?}", config);
        config
    }

    /// Clamps `max_enclaves_per_node` into `1..=4`. An out of range value is
    /// replaced by the maximum and reported as an error.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.max_enclaves_per_node <= 0 || self.max_enclaves_per_node > MAX_ENCLAVES_PER_INSTANCE
        {
            self.max_enclaves_per_node = MAX_ENCLAVES_PER_INSTANCE;
            return Err(ConfigError::MaxEnclavesOutOfRange {
                max: MAX_ENCLAVES_PER_INSTANCE,
            });
        }
        Ok(())
    }
}

impl From<&Cli> for PluginConfig {
    fn from(cli: &Cli) -> Self {
        Self::load(
            cli.max_enclaves_per_node.as_deref(),
            cli.enclave_cpu_advertisement.as_deref(),
        )
    }
}

/// Accepts the boolean spellings used by the deployment manifests:
/// `1, t, T, TRUE, true, True, 0, f, F, FALSE, false, False`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
