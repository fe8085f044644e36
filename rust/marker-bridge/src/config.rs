// marker-bridge: configuration support
//
// The config file is a JSON document (`device_config.json` by default).
// Every section and key is optional; anything missing falls back to the
// defaults below, so a partial file only overrides what it names.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub devices: DevicesSection,
    pub server: ServerSection,
    pub app: AppSection,
    pub timeouts: TimeoutsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesSection {
    #[serde(rename = "BOARD_RELAY")]
    pub board_relay: RelayDeviceSection,
    #[serde(rename = "SOFTWARE_COMMAND")]
    pub software_command: MarkerDeviceSection,
}

/// Relay/PLC board on the Modbus-RTU bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayDeviceSection {
    pub com_port: Option<String>,
    pub baud_rate: u32,
    pub slave_id: u8,
    pub read_settings: ReadSettings,
    pub dry_run: bool,
    pub dry_run_state: DryRunRegisters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSettings {
    pub start_address: u16,
    pub num_registers: u16,
    pub interval_ms: u64,
}

/// Simulated PLC input registers used when the relay board runs dry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DryRunRegisters {
    pub ready: u16,
    pub home: u16,
    pub reset: u16,
    pub other_registers: Vec<u16>,
}

/// Marking engine on the command serial line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerDeviceSection {
    pub com_port: Option<String>,
    pub baud_rate: u32,
    pub xonxoff: bool,
    pub dry_run: bool,
    pub dry_run_complete_ms: u64,
    pub print_mode: String,
    pub emit_options: EmitOptions,
    pub templates: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitOptions {
    pub debounce_ms: u64,
    pub edge_only: bool,
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub position: PositionSection,
}

/// Where axis positions live in the PLC register vector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSection {
    pub x_index: usize,
    pub y_index: usize,
    pub scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub ui_op_timeout_ms: u64,
    pub sc_complete_ms: u64,
    pub get_job_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub timestamps: bool,
    pub console: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            devices: DevicesSection::default(),
            server: ServerSection::default(),
            app: AppSection::default(),
            timeouts: TimeoutsSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            board_relay: RelayDeviceSection::default(),
            software_command: MarkerDeviceSection::default(),
        }
    }
}

impl Default for RelayDeviceSection {
    fn default() -> Self {
        Self {
            com_port: None,
            baud_rate: 9600,
            slave_id: 1,
            read_settings: ReadSettings::default(),
            dry_run: false,
            dry_run_state: DryRunRegisters::default(),
        }
    }
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            start_address: 129,
            num_registers: 8,
            interval_ms: 500,
        }
    }
}

impl Default for DryRunRegisters {
    fn default() -> Self {
        Self {
            ready: 1,
            home: 0,
            reset: 0,
            other_registers: Vec::new(),
        }
    }
}

impl Default for MarkerDeviceSection {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert("HOME".to_string(), "%H<CR>".to_string());
        templates.insert("RESET".to_string(), "<0x1D>".to_string());
        Self {
            com_port: None,
            baud_rate: 9600,
            xonxoff: true,
            dry_run: false,
            dry_run_complete_ms: 1000,
            print_mode: "hex_ascii".to_string(),
            emit_options: EmitOptions::default(),
            templates,
        }
    }
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            edge_only: false,
            min_interval_ms: 0,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5555".to_string(),
        }
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            position: PositionSection::default(),
        }
    }
}

impl Default for PositionSection {
    fn default() -> Self {
        Self {
            x_index: 0,
            y_index: 1,
            scale: 0.01,
        }
    }
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            ui_op_timeout_ms: 20_000,
            sc_complete_ms: 5_000,
            get_job_ms: 4_000,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
            console: true,
        }
    }
}

impl BridgeConfig {
    /// Load config from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Os(format!("read config {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::Os(format!("parse config {}: {e}", path.display())))
    }

    /// Persist the current config (pretty-printed, stable key order per serde).
    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::InternalInvariant(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| BridgeError::Os(format!("write config {}: {e}", path.display())))
    }

    /// Parse the configured marker print mode.
    pub fn print_mode(&self) -> marker_protocol::PrintMode {
        match self
            .devices
            .software_command
            .print_mode
            .to_ascii_lowercase()
            .as_str()
        {
            "hex" => marker_protocol::PrintMode::Hex,
            "ascii" => marker_protocol::PrintMode::Ascii,
            _ => marker_protocol::PrintMode::HexAscii,
        }
    }
}

/// Log levels accepted by `logging.level`, `--log-level`, and SET_LOG_LEVEL.
pub const LOG_LEVELS: [&str; 5] = ["off", "error", "warn", "info", "debug"];

/// Validate a log level name.
pub fn is_valid_log_level(level: &str) -> bool {
    LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_documentation() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.devices.board_relay.read_settings.start_address, 129);
        assert_eq!(cfg.devices.board_relay.read_settings.num_registers, 8);
        assert_eq!(cfg.devices.board_relay.read_settings.interval_ms, 500);
        assert_eq!(cfg.timeouts.ui_op_timeout_ms, 20_000);
        assert_eq!(cfg.server.bind_address, "0.0.0.0:5555");
        assert!(cfg.devices.software_command.xonxoff);
        assert_eq!(
            cfg.devices.software_command.templates.get("HOME").map(String::as_str),
            Some("%H<CR>")
        );
    }

    #[test]
    fn partial_file_only_overrides_named_keys() {
        let parsed: BridgeConfig = serde_json::from_str(
            r#"{"devices": {"BOARD_RELAY": {"com_port": "/dev/ttyUSB0", "slave_id": 2}}}"#,
        )
        .expect("parse");
        assert_eq!(parsed.devices.board_relay.com_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(parsed.devices.board_relay.slave_id, 2);
        // untouched keys keep their defaults
        assert_eq!(parsed.devices.board_relay.baud_rate, 9600);
        assert_eq!(parsed.timeouts.get_job_ms, 4_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = BridgeConfig::load(Path::new("/nonexistent/device_config.json")).expect("load");
        assert_eq!(cfg.devices.board_relay.slave_id, 1);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("device_config.json");
        let mut cfg = BridgeConfig::default();
        cfg.logging.level = "debug".to_string();
        cfg.save(&path).expect("save");
        let loaded = BridgeConfig::load(&path).expect("load");
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn log_level_validation() {
        assert!(is_valid_log_level("info"));
        assert!(is_valid_log_level("OFF"));
        assert!(!is_valid_log_level("verbose"));
    }
}
