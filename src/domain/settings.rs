use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_thread_names: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_thread_names: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "hydraulic_control".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A paired device and the serial node its RFCOMM channel is bound to
/// (e.g. `rfcomm bind 0 20:15:03:18:19:71` exposes `/dev/rfcomm0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub address: String,
    pub port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_target_address")]
    pub target_address: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_bindings")]
    pub paired_devices: Vec<DeviceBinding>,
    #[serde(default = "default_adapter_path")]
    pub adapter_sysfs_path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    // Timing
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_demo_tick_ms")]
    pub demo_tick_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    // Operator input
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: u8,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_address: default_target_address(),
            service_uuid: default_service_uuid(),
            paired_devices: default_bindings(),
            adapter_sysfs_path: default_adapter_path(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            demo_tick_ms: default_demo_tick_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            motion_threshold: default_motion_threshold(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_target_address() -> String {
    "20:15:03:18:19:71".to_string()
}
fn default_service_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::SERVICE_UUID.to_string()
}
fn default_bindings() -> Vec<DeviceBinding> {
    vec![DeviceBinding {
        address: default_target_address(),
        port: "/dev/rfcomm0".to_string(),
    }]
}
fn default_adapter_path() -> String {
    "/sys/class/bluetooth".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_settle_delay_ms() -> u64 {
    crate::infrastructure::bluetooth::protocol::SETTLE_DELAY.as_millis() as u64
}
fn default_demo_tick_ms() -> u64 {
    crate::domain::demo::DEMO_TICK.as_millis() as u64
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_motion_threshold() -> u8 {
    20
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from `path`, falling back to defaults when the file is missing or unreadable.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!(
                        "Ignoring unreadable settings at {}: {:#}",
                        settings_path.display(),
                        e
                    );
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HydraulicControl");
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)
            .with_context(|| format!("Failed to write {}", self.settings_path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}
