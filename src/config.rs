//! Configuration loading and schema definitions for simfleet.
//!
//! This module provides types and functions for loading simfleet configuration
//! from TOML files or strings. The configuration schema defines the node pool,
//! the test driver, the simulator profile, collaborator hooks and reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads simfleet configuration from a TOML file.
///
/// The file must be valid TOML and conform to the simfleet configuration
/// schema. Cross-field rules are checked with [`Config::validate`].
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The configuration fails validation
///
/// # Example
///
/// ```no_run
/// use simfleet::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("simfleet.toml"))?;
/// println!("Nodes: {}", config.nodes.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads simfleet configuration from a TOML string.
///
/// # Example
///
/// ```
/// use simfleet::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [driver]
///     xctestrun = "build/App.xctestrun"
///     target = "AppUITests"
///
///     [device]
///     name = "iPhone 15"
///     runtime = "17.2"
///
///     [[nodes]]
///     name = "local"
///     address = "local"
///     concurrency = 2
/// "#)?;
///
/// assert_eq!(config.nodes.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.validate().context("Invalid config")?;

    Ok(config)
}
