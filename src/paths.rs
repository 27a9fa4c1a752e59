//! Path utilities for steadykv.
//!
//! # Base Directory
//! - [`get_home_dir`] - `~/.steadykv/` (base directory for all steadykv data)
//!
//! # Files
//! - [`get_data_dir`] - `~/.steadykv/data/` (one redb file per database)
//! - [`get_markers_path`] - `~/.steadykv/clearable.json` (reconciliation markers)
//! - [`get_config_path`] - `~/.steadykv/config.toml` (store settings)

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::constants;

/// Get the steadykv base directory.
///
/// Resolution order:
/// 1. `STEADYKV_HOME` environment variable (if set and not empty)
/// 2. `~/.steadykv/` (default)
pub fn get_home_dir() -> Result<PathBuf> {
    resolve_home(std::env::var(constants::HOME_ENV_VAR).ok())
}

fn resolve_home(env_value: Option<String>) -> Result<PathBuf> {
    if let Some(home) = env_value
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".steadykv"))
}

/// Get the data directory: `<home>/data/`
pub fn get_data_dir(home: &Path) -> PathBuf {
    home.join("data")
}

/// Get the marker registry path: `<home>/clearable.json`
pub fn get_markers_path(home: &Path) -> PathBuf {
    home.join(constants::MARKERS_FILE)
}

/// Get the config path: `<home>/config.toml`
pub fn get_config_path(home: &Path) -> PathBuf {
    home.join("config.toml")
}
