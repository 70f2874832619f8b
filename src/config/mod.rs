// Configuration module for series-federation
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FederationConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<FederationConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut FederationConfig) -> Result<()> {
    // Re-root every filesystem storage under a common data directory
    if let Ok(data_dir) = std::env::var("FEDERATION_DATA_DIR") {
        for (name, storage) in config.storages.iter_mut() {
            if let Some(fs) = storage.backend_config.as_filesystem_mut() {
                fs.base_path = Path::new(&data_dir).join(name).to_string_lossy().to_string();
            }
        }
    }

    if let Ok(interval) = std::env::var("FEDERATION_SWEEP_INTERVAL") {
        config.migration.interval_seconds = interval
            .parse()
            .context("FEDERATION_SWEEP_INTERVAL must be a number of seconds")?;
    }

    Ok(())
}
