//! Configuration loading
//!
//! Optional TOML file providing defaults for the CLI flags. Resolution
//! priority is CLI argument > environment variable > TOML file > compiled
//! default; a missing file never prevents startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{Error, Result};

/// Values loadable from `config.toml`. All optional; the CLI overrides
/// everything here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Address of the server to mirror (client mode)
    pub server_address: Option<String>,
    /// Port to serve on (server mode)
    pub port: Option<u16>,
    /// Initial volume, 0.0 - 1.0
    pub volume: Option<f32>,
    /// Path of the persisted service data file
    pub data_file: Option<PathBuf>,
    /// Filesystem roots feeding the source playlist
    pub media_sources: Option<Vec<String>>,
    /// Log filter, e.g. "tremolo=debug"
    pub log_level: Option<String>,
}

/// Default configuration file location for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tremolo").join("config.toml"))
}

/// Load the configuration file, tolerating its absence.
///
/// A missing file yields defaults with a warning; a present but malformed
/// file is a hard error so typos do not silently vanish.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => path,
        None => {
            warn!("no config directory on this platform, using defaults");
            return Ok(TomlConfig::default());
        }
    };

    if !path.exists() {
        warn!("config file {} not found, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
