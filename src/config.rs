// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration struct for the dispenser host: serial link, mechanics
/// geometry, on-disk paths, and the web surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub mechanics: MechanicsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            mechanics: MechanicsConfig::default(),
            paths: PathsConfig::default(),
            web: WebConfig::default(),
        }
    }
}

/// Serial link to the motion controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Some firmware builds emit one extra acknowledgment after a Z move
    /// sequence. When true, the protocol machine burns exactly one extra
    /// `ok` before leaving the Z-move wait state.
    #[serde(default)]
    pub z_move_extra_ack: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            z_move_extra_ack: false,
        }
    }
}

/// Axis targets and feed rates for the dispense sequence. Distances in mm,
/// feed rates in mm/min, matching what the firmware expects in `G0`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MechanicsConfig {
    #[serde(default = "default_x_start")]
    pub x_start: f64,
    #[serde(default = "default_x_tab_lift")]
    pub x_tab_lift: f64,
    #[serde(default = "default_x_lid_peel")]
    pub x_lid_peel: f64,
    #[serde(default = "default_x_eject")]
    pub x_eject: f64,
    #[serde(default = "default_feed_fast")]
    pub feed_fast: f64,
    #[serde(default = "default_feed_slow")]
    pub feed_slow: f64,
    /// Z lift applied to a just-opened can so it clears the magazine.
    #[serde(default = "default_can_to_eject")]
    pub can_to_eject: f64,
    /// Z lift after eject that brings the next can level for opening.
    #[serde(default = "default_next_can")]
    pub next_can: f64,
    #[serde(default = "default_cartridge_height")]
    pub cartridge_height: f64,
    #[serde(default = "default_max_cans")]
    pub max_cans: u32,
}

impl Default for MechanicsConfig {
    fn default() -> Self {
        Self {
            x_start: default_x_start(),
            x_tab_lift: default_x_tab_lift(),
            x_lid_peel: default_x_lid_peel(),
            x_eject: default_x_eject(),
            feed_fast: default_feed_fast(),
            feed_slow: default_feed_slow(),
            can_to_eject: default_can_to_eject(),
            next_can: default_next_can(),
            cartridge_height: default_cartridge_height(),
            max_cans: default_max_cans(),
        }
    }
}

/// File locations for the persisted snapshot and the pending web command.
/// Relative paths are resolved under the user's home directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_command_file")]
    pub command_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            command_file: default_command_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_web_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: default_web_enabled(),
            bind: default_bind(),
        }
    }
}

// Default value functions
fn default_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud() -> u32 { 115200 }
fn default_x_start() -> f64 { 165.0 }
fn default_x_tab_lift() -> f64 { 248.0 }
fn default_x_lid_peel() -> f64 { 25.0 }
fn default_x_eject() -> f64 { 248.0 }
fn default_feed_fast() -> f64 { 600.0 }
fn default_feed_slow() -> f64 { 150.0 }
fn default_can_to_eject() -> f64 { 21.0 }
fn default_next_can() -> f64 { 37.0 }
fn default_cartridge_height() -> f64 { 58.0 }
fn default_max_cans() -> u32 { 6 }
fn default_state_file() -> String { "machine_state.json".to_string() }
fn default_command_file() -> String { "web_commands.json".to_string() }
fn default_web_enabled() -> bool { true }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

/// Resolve a snapshot/command filename under the user's home directory,
/// falling back to the current directory when HOME is unset.
pub fn home_file_path(filename: &str) -> std::path::PathBuf {
    let path = std::path::Path::new(filename);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::var_os("HOME") {
        Some(home) => std::path::Path::new(&home).join(filename),
        None => {
            tracing::warn!("HOME not set, using current directory for '{}'", filename);
            path.to_path_buf()
        }
    }
}
