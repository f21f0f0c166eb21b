/// `load_config` module: builds the [`ServiceConfig`] the service runs with.
///
/// Sources, later ones winning:
/// 1. built-in defaults
/// 2. an optional YAML file
/// 3. the `DOXYGEN_TEMPLATE_CONF` environment variable (template location)
///
/// The result is resolved exactly once at start-up and then passed by
/// reference; nothing re-reads the environment per request.
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::config::ServiceConfig;

pub const TEMPLATE_ENV: &str = "DOXYGEN_TEMPLATE_CONF";

pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => {
            info!("No config file given, using defaults");
            ServiceConfig::default()
        }
    };

    if let Ok(template) = std::env::var(TEMPLATE_ENV) {
        if template.is_empty() {
            error!(var = TEMPLATE_ENV, "Ignoring empty template override");
        } else {
            info!(var = TEMPLATE_ENV, template = %template, "Setting template from environment variable");
            config.template_conf = PathBuf::from(template);
        }
    }

    if config.generator.max_concurrent == 0 {
        error!("generator.max_concurrent must be at least 1");
        anyhow::bail!("generator.max_concurrent must be at least 1");
    }
    if config.generator.timeout_secs == 0 {
        error!("generator.timeout_secs must be at least 1");
        anyhow::bail!("generator.timeout_secs must be at least 1");
    }

    Ok(config)
}

fn read_file(path: &Path) -> Result<ServiceConfig> {
    info!(config_path = ?path, "Loading configuration from file");

    let content = match fs::read_to_string(path) {
        Ok(content) => {
            info!(config_path = ?path, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path, e));
        }
    };

    match serde_yaml::from_str(&content) {
        Ok(config) => {
            info!(config_path = ?path, "Parsed config YAML successfully");
            Ok(config)
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
            Err(anyhow::anyhow!("Failed to parse config YAML: {e}"))
        }
    }
}
