// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FederationConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<FederationConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: FederationConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${DATA_DIR:-/data/series} -> /data/series (if DATA_DIR not set)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}")
            .context("Invalid substitution pattern")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string())
    }

    /// Validate configuration
    fn validate(config: &FederationConfig) -> Result<()> {
        if config.storages.is_empty() {
            bail!("at least one storage must be declared");
        }

        for (name, storage) in &config.storages {
            match storage.backend.as_str() {
                "memory" => {}
                "filesystem" => match storage.backend_config.as_filesystem() {
                    None => bail!("storage '{}': filesystem backend selected but filesystem config missing", name),
                    Some(fs) if fs.max_blob_bytes == 0 => {
                        bail!("storage '{}': filesystem.max_blob_bytes must be > 0", name)
                    }
                    Some(_) => {}
                },
                unknown => bail!(
                    "storage '{}': unknown backend '{}'. Supported: memory, filesystem",
                    name,
                    unknown
                ),
            }

            if storage.concurrency.max_reads == 0 || storage.concurrency.max_writes == 0 {
                bail!("storage '{}': concurrency limits must be > 0", name);
            }
        }

        if config.topology.dynamic.is_empty() {
            bail!("topology.dynamic must declare at least one window");
        }

        for (tier, rules) in [
            ("dynamic", &config.topology.dynamic),
            ("volume", &config.topology.volume),
        ] {
            for rule in rules {
                if !config.storages.contains_key(&rule.storage) {
                    bail!("topology.{}: undeclared storage '{}'", tier, rule.storage);
                }
                if let Some(pattern) = &rule.pattern {
                    Regex::new(pattern).with_context(|| {
                        format!("topology.{}: invalid pattern '{}'", tier, pattern)
                    })?;
                }
                if let (Some(from), Some(to)) = (rule.from, rule.to) {
                    if from >= to {
                        bail!(
                            "topology.{}: window for '{}' is empty ({} >= {})",
                            tier,
                            rule.storage,
                            from,
                            to
                        );
                    }
                }
            }
        }

        if config.client.batch_size == 0 {
            bail!("client.batch_size must be > 0");
        }

        if config.client.flush_interval_ms == 0 {
            bail!("client.flush_interval_ms must be > 0");
        }

        if config.migration.segment_size == 0 {
            bail!("migration.segment_size must be > 0");
        }

        if config.migration.interval_seconds == 0 {
            bail!("migration.interval_seconds must be > 0");
        }

        if config.migration.enabled && config.topology.volume.is_empty() {
            bail!("migration enabled but topology.volume is empty");
        }

        match config.temporary.backend.as_str() {
            "none" | "memory" => {}
            "filesystem" => {
                if config.temporary.path.is_none() {
                    bail!("temporary.path is required for the filesystem temporary backend");
                }
            }
            unknown => bail!(
                "Unknown temporary backend: '{}'. Supported: none, memory, filesystem",
                unknown
            ),
        }

        Ok(())
    }
}
