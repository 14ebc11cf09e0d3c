use crate::domain::sensors::{AccelRange, SensorKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
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
            show_file_line: default_false(),
            show_thread_ids: default_false(),
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
    "sensortag_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Where readings are sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            measurement: default_measurement(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8089
}
fn default_measurement() -> String {
    "sensortag".to_string()
}

/// Scan cadence, measurement cadence and per-tag measurement options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    #[serde(default = "default_discover_interval")]
    pub discover_interval_secs: f64,
    #[serde(default = "default_scan_window")]
    pub scan_window_secs: f64,
    #[serde(default = "default_measure_interval")]
    pub measure_interval_secs: f64,
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: f64,
    /// Extra time granted after a timeout for disable writes to land
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_secs: f64,
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i16,
    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorKind>,
    #[serde(default = "default_false")]
    pub measure_battery: bool,
    #[serde(default)]
    pub motion_acc_range: AccelRange,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            discover_interval_secs: default_discover_interval(),
            scan_window_secs: default_scan_window(),
            measure_interval_secs: default_measure_interval(),
            round_timeout_secs: default_round_timeout(),
            cleanup_grace_secs: default_cleanup_grace(),
            min_rssi: default_min_rssi(),
            sensors: default_sensors(),
            measure_battery: default_false(),
            motion_acc_range: AccelRange::default(),
        }
    }
}

impl FleetSettings {
    pub fn discover_interval(&self) -> Duration {
        Duration::from_secs_f64(self.discover_interval_secs)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs_f64(self.scan_window_secs)
    }

    pub fn measure_interval(&self) -> Duration {
        Duration::from_secs_f64(self.measure_interval_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.round_timeout_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_grace_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, secs) in [
            ("discover_interval_secs", self.discover_interval_secs),
            ("scan_window_secs", self.scan_window_secs),
            ("measure_interval_secs", self.measure_interval_secs),
            ("round_timeout_secs", self.round_timeout_secs),
            ("cleanup_grace_secs", self.cleanup_grace_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                anyhow::bail!("fleet.{name} must be a non-negative number, got {secs}");
            }
        }
        Ok(())
    }
}

fn default_discover_interval() -> f64 {
    60.0
}
fn default_scan_window() -> f64 {
    5.0
}
fn default_measure_interval() -> f64 {
    10.0
}
fn default_round_timeout() -> f64 {
    8.0
}
fn default_cleanup_grace() -> f64 {
    2.0
}
fn default_min_rssi() -> i16 {
    -110
}
fn default_sensors() -> Vec<SensorKind> {
    vec![SensorKind::Humidity, SensorKind::Pressure]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub fleet: FleetSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from `path`, or from the per-user config directory.
    ///
    /// A missing file is created with defaults; a malformed one is an error.
    pub fn new(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = match path {
            Some(p) => p,
            None => Self::get_settings_path()?,
        };
        let service = if settings_path.exists() {
            Self {
                settings: Self::load_from_file(&settings_path)?,
                settings_path,
            }
        } else {
            let service = Self {
                settings: Settings::default(),
                settings_path,
            };
            service.save()?;
            service
        };
        service.settings.fleet.validate()?;
        Ok(service)
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("sensortag-bridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("invalid settings file {}: {e}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
