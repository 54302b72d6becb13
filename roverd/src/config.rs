//! # config
//!
//! Runtime configuration: a TOML file (`--config`) with env-var fallbacks
//! for the values people most often override in the field. Every section
//! has working defaults so `roverd` starts with no file at all.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub hub: HubConfig,
    pub serial: SerialConfig,
    pub flir: FlirConfig,
    pub mapping: MappingConfig,
    pub motion: crate::motion::MotionTuning,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// TCP port for every WebSocket endpoint plus /status
    pub port: u16,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: std::env::var("ROVER_HUB_PORT")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(8080),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path of the MCU link
    pub port: String,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: std::env::var("ROVER_SERIAL_PORT")
                .unwrap_or_else(|_| "/dev/ttyUSB0".to_string()),
            baud: 115_200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlirConfig {
    pub enabled: bool,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for FlirConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // FLIR One G2
            vendor_id: 0x09CB,
            product_id: 0x1996,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Where map snapshots and recorded datasets land
    pub data_dir: PathBuf,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::var("ROVER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file when present, defaults otherwise.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }
}
