//! # Board and transport configuration
//!
//! ```toml
//! [board]
//! name = "bench rig"
//! sampling_interval = 10
//! i2c_bus = "B"
//!
//! [transport]
//! kind = "serial"
//! port_a = "/dev/ttyACM0"
//! port_b = "/dev/ttyACM1"
//! baud = 115200
//! ```
//!
//! Every key is optional; an empty file yields the on-device defaults.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::address::BusRef;
use crate::board::BoardOptions;
use crate::error::TransportError;
use crate::hardware::Transport;
use crate::hardware::bridge::SocketTransport;
use crate::scheduler::{DEFAULT_SAMPLING_INTERVAL, clamp_interval};
use crate::simulator::SimTransport;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoardConfig {
    pub name: Option<String>,
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval: u32,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: String,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: None,
            sampling_interval: default_sampling_interval(),
            i2c_bus: default_i2c_bus(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix sockets exposed by the on-device bridge daemon
    #[default]
    Socket,
    /// Coprocessor ports attached as serial devices
    Serial,
    /// In-memory simulator
    Sim,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_port_a")]
    pub port_a: PathBuf,
    #[serde(default = "default_port_b")]
    pub port_b: PathBuf,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Brightness files for L0..L3
    #[serde(default = "default_leds")]
    pub leds: Vec<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            port_a: default_port_a(),
            port_b: default_port_b(),
            baud: default_baud(),
            leds: default_leds(),
        }
    }
}

fn default_sampling_interval() -> u32 {
    DEFAULT_SAMPLING_INTERVAL
}
fn default_i2c_bus() -> String {
    "A".to_string()
}
fn default_port_a() -> PathBuf {
    PathBuf::from("/var/run/tessel/port_a")
}
fn default_port_b() -> PathBuf {
    PathBuf::from("/var/run/tessel/port_b")
}
fn default_baud() -> u32 {
    115_200
}
fn default_leds() -> Vec<PathBuf> {
    ["red:error", "amber:wlan", "blue:user1", "green:user2"]
        .iter()
        .map(|led| PathBuf::from(format!("/sys/devices/leds/leds/tessel:{}/brightness", led)))
        .collect()
}

impl Config {
    pub fn board_options(&self) -> BoardOptions {
        BoardOptions {
            name: self.board.name.clone(),
            sampling_interval: clamp_interval(self.board.sampling_interval as i64),
            i2c_bus: Some(BusRef::from(self.board.i2c_bus.as_str())),
        }
    }
}

impl TransportConfig {
    /// Opens the configured transport. Must run inside a tokio runtime.
    pub async fn open(&self) -> Result<Arc<dyn Transport>, TransportError> {
        match self.kind {
            TransportKind::Sim => Ok(Arc::new(SimTransport::new())),
            TransportKind::Serial => Ok(Arc::new(SocketTransport::open_serial(
                &self.port_a,
                &self.port_b,
                self.baud,
                self.leds.clone(),
            )?)),
            #[cfg(unix)]
            TransportKind::Socket => Ok(Arc::new(
                SocketTransport::connect_unix(&self.port_a, &self.port_b, self.leds.clone()).await?,
            )),
            #[cfg(not(unix))]
            TransportKind::Socket => Err(TransportError::Unsupported(
                "socket transport requires Unix domain sockets".to_string(),
            )),
        }
    }
}

/// Load configuration from a TOML file.
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
