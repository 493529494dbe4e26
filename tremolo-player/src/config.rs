//! Launch configuration
//!
//! Merges CLI overrides with the optional TOML file into one plain
//! [`LaunchConfig`]. Resolution priority is CLI > TOML > compiled default.
//! No business logic here; the build lifecycle interprets the result.

use std::path::PathBuf;

use tremolo_common::config::TomlConfig;
use tremolo_common::model::PlayState;

use crate::error::{Error, Result};

/// Port used when an address or serve request does not name one.
pub const DEFAULT_PORT: u16 = 1704;

/// How this instance participates in replication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Local model only, no transport
    Standalone,
    /// Own the library, accept clients
    Server { port: u16 },
    /// Mirror a remote server
    Client { address: String },
}

/// Everything the build lifecycle needs to assemble a service.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub mode: RunMode,
    pub volume: Option<f32>,
    pub play_state: Option<PlayState>,
    pub shuffle: bool,
    pub search_key: Option<String>,
    pub media_sources: Vec<String>,
    pub data_file: Option<PathBuf>,
}

/// Raw CLI values before merging with the TOML file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub serve: Option<u16>,
    pub connect: Option<String>,
    pub shuffle: bool,
    pub search_key: Option<String>,
    pub volume: Option<f32>,
    pub play_state: Option<String>,
    pub data_file: Option<PathBuf>,
    pub media_sources: Vec<String>,
}

/// Merge CLI overrides over the config file. Mode precedence: `--serve`,
/// then `--connect`, then a configured server address, then standalone.
pub fn resolve(overrides: Overrides, file: &TomlConfig) -> Result<LaunchConfig> {
    let mode = if let Some(port) = overrides.serve {
        RunMode::Server { port }
    } else if let Some(address) = overrides.connect {
        RunMode::Client {
            address: normalize_address(address),
        }
    } else if let Some(address) = file.server_address.clone() {
        RunMode::Client {
            address: normalize_address(address),
        }
    } else {
        RunMode::Standalone
    };

    let volume = overrides.volume.or(file.volume);
    if let Some(volume) = volume {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::Config(format!(
                "volume {volume} out of range 0.0 - 1.0"
            )));
        }
    }

    let play_state = overrides.play_state.as_deref().map(parse_play_state).transpose()?;

    let media_sources = if overrides.media_sources.is_empty() {
        file.media_sources.clone().unwrap_or_default()
    } else {
        overrides.media_sources
    };

    Ok(LaunchConfig {
        mode,
        volume,
        play_state,
        shuffle: overrides.shuffle,
        search_key: overrides.search_key,
        media_sources,
        data_file: overrides.data_file.or_else(|| file.data_file.clone()),
    })
}

fn parse_play_state(value: &str) -> Result<PlayState> {
    match value.to_ascii_lowercase().as_str() {
        "stopped" => Ok(PlayState::Stopped),
        "playing" => Ok(PlayState::Playing),
        "paused" => Ok(PlayState::Paused),
        other => Err(Error::Config(format!(
            "unknown play state {other:?}, expected stopped, playing or paused"
        ))),
    }
}

fn normalize_address(address: String) -> String {
    if address.contains(':') {
        address
    } else {
        format!("{address}:{DEFAULT_PORT}")
    }
}
