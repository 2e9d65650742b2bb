//! Broker configuration: TOML file + CLI overrides, per §10.1.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub signaling_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".parse().unwrap(),
            signaling_port: 8443,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_server: String,
    pub turn_servers: Vec<String>,
    pub ice_udp_port_min: u16,
    pub ice_udp_port_max: u16,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            turn_servers: Vec::new(),
            ice_udp_port_min: 51200,
            ice_udp_port_max: 51299,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb_serial: Option<String>,
    pub server_jar_path: String,
    pub remote_jar_path: String,
    pub control_queue_depth: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_serial: None,
            server_jar_path: "scrcpy-server.jar".to_string(),
            remote_jar_path: "/data/local/tmp/scrcpy-server.jar".to_string(),
            control_queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub webrtc: WebRtcConfig,
    pub device: DeviceConfig,
    pub log: LogConfig,
}

impl Config {
    /// Loads a TOML config file; falls back to fully-defaulted config if the
    /// file does not exist, since a missing file still yields a working
    /// broker bound to loopback with the public STUN server.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(AppError::Io)?;
        toml::from_str(&raw).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(port) = overrides.signaling_port {
            self.server.signaling_port = port;
        }
        if let Some(addr) = overrides.bind_address {
            self.server.bind_address = addr;
        }
        if let Some(ref serial) = overrides.adb_serial {
            self.device.adb_serial = Some(serial.clone());
        }
        if let Some(ref level) = overrides.log_level {
            self.log.level = level.clone();
        }
        if let Some(ref stun) = overrides.stun_server {
            self.webrtc.stun_server = stun.clone();
        }
    }
}

/// CLI-supplied overrides, applied on top of the loaded TOML config. Kept as
/// a plain struct rather than a `clap::Parser` impl so `main.rs` owns the
/// actual argument grammar and help text.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub signaling_port: Option<u16>,
    pub bind_address: Option<IpAddr>,
    pub adb_serial: Option<String>,
    pub log_level: Option<String>,
    pub stun_server: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_loopback_equivalent_and_public_stun() {
        let cfg = Config::default();
        assert_eq!(cfg.server.signaling_port, 8443);
        assert_eq!(cfg.webrtc.stun_server, "stun:stun.l.google.com:19302");
        assert_eq!(cfg.webrtc.ice_udp_port_min, 51200);
        assert_eq!(cfg.webrtc.ice_udp_port_max, 51299);
    }

    #[test]
    fn missing_file_yields_default() {
        let cfg = Config::load(Path::new("/nonexistent/path/streambroker.toml")).unwrap();
        assert_eq!(cfg.server.signaling_port, Config::default().server.signaling_port);
    }

    #[test]
    fn cli_overrides_apply_selectively() {
        let mut cfg = Config::default();
        let overrides = CliOverrides {
            signaling_port: Some(9000),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        cfg.apply_cli_overrides(&overrides);
        assert_eq!(cfg.server.signaling_port, 9000);
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.webrtc.stun_server, WebRtcConfig::default().stun_server);
    }

    #[test]
    fn parses_toml_with_partial_sections() {
        let toml_str = r#"
            [server]
            signaling_port = 9443

            [log]
            level = "warn"
            format = "json"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.signaling_port, 9443);
        assert_eq!(cfg.log.level, "warn");
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.device.server_jar_path, DeviceConfig::default().server_jar_path);
    }
}
