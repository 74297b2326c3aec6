// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Read and deserialize a config file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Load and validate. A missing file at the default location yields the
/// built-in defaults; an explicitly named file must exist.
pub fn load_and_validate(path: impl AsRef<Path>, explicit: bool) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw = if !explicit && !path.exists() {
        debug!(path = ?path, "no config file; using defaults");
        RawConfigFile::default()
    } else {
        load_from_path(path)?
    };
    ConfigFile::try_from(raw)
}

/// `Gangway.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Gangway.toml")
}
