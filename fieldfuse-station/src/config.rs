//! Station configuration file
//!
//! One TOML file describes the whole station. Every section is optional
//! and falls back to the values the station was first deployed with:
//!
//! ```toml
//! [station]
//! location = "site01"
//! timezone = "+08:00"
//! data_dir = "/mnt/data"
//! image_dir = "/mnt/data/images"
//! csv_file = "records.csv"
//! delay_tolerance_secs = 600
//!
//! [mqtt]
//! host = "192.168.0.117"
//! username = "station"
//! password = "secret"
//! ca_cert = "/etc/fieldfuse/ca.crt"
//!
//! [ble]
//! device_name = "NiclaSenseME-B806"
//!
//! [bus]
//! device = "/dev/i2c-1"
//!
//! [camera]
//! settle_ms = 1000
//!
//! [[schedule]]
//! start_hour = 5
//! end_hour = 7
//! interval_secs = 600
//! bracket = { min = -2.0, max = 2.0, count = 5 }
//! ```
//!
//! A `[[schedule]]` list replaces the built-in band table entirely; the
//! `[fallback]` plan covers every hour no band matches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use fieldfuse_connectors::mqtt::TlsFiles;
use fieldfuse_connectors::{MqttConfig, RpicamConfig, WirelessConfig};
use fieldfuse_core::{Bracket, ScheduleBand, SchedulePlan, ScheduleTable, SetupError, StalenessPolicy, Zone};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationConfig {
    pub station: StationSection,
    pub mqtt: MqttSection,
    pub ble: BleSection,
    pub bus: BusSection,
    pub camera: CameraSection,
    pub fallback: FallbackSection,
    pub schedule: Vec<ScheduleBand>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationSection {
    /// Prefix of captured image filenames
    pub location: String,
    pub timezone: Zone,
    pub data_dir: PathBuf,
    pub image_dir: PathBuf,
    /// Record log; relative paths live under `data_dir`
    pub csv_file: PathBuf,
    pub delay_tolerance_secs: u64,
    pub log_level: String,
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            location: "station".into(),
            timezone: Zone::Local,
            data_dir: PathBuf::from("/mnt/data"),
            image_dir: PathBuf::from("/mnt/data/images"),
            csv_file: PathBuf::from("records.csv"),
            delay_tolerance_secs: 600,
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub keep_alive_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".into(),
            port: 1883,
            topic: "sensor/#".into(),
            client_id: None,
            username: None,
            password: None,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            keep_alive_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BleSection {
    pub enabled: bool,
    pub device_name: String,
    pub polling_interval_secs: u64,
    pub notification_wait_ms: u64,
    pub scan_window_secs: u64,
}

impl Default for BleSection {
    fn default() -> Self {
        let defaults = WirelessConfig::default();
        Self {
            enabled: true,
            device_name: defaults.device_name,
            polling_interval_secs: defaults.polling_interval.as_secs(),
            notification_wait_ms: defaults.notification_wait.as_millis() as u64,
            scan_window_secs: defaults.scan_window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[cfg_attr(not(feature = "i2c"), allow(dead_code))]
pub struct BusSection {
    pub enabled: bool,
    pub device: PathBuf,
    pub address: u8,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: true,
            device: PathBuf::from("/dev/i2c-1"),
            address: 0x39,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraSection {
    pub command: PathBuf,
    pub width: u32,
    pub height: u32,
    pub settle_ms: u64,
}

impl Default for CameraSection {
    fn default() -> Self {
        let defaults = RpicamConfig::default();
        Self {
            command: defaults.command,
            width: defaults.width,
            height: defaults.height,
            settle_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackSection {
    pub interval_secs: u64,
    pub bracket: Bracket,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            interval_secs: SchedulePlan::FALLBACK.interval.as_secs(),
            bracket: SchedulePlan::FALLBACK.bracket,
        }
    }
}

impl StationConfig {
    /// Read and parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.schedule_table()?;
        Ok(config)
    }

    /// Record log location
    pub fn csv_path(&self) -> PathBuf {
        self.station.data_dir.join(&self.station.csv_file)
    }

    pub fn policy(&self) -> StalenessPolicy {
        StalenessPolicy::from_secs(self.station.delay_tolerance_secs)
    }

    /// Configured band table, or the built-in one when none is given
    pub fn schedule_table(&self) -> Result<ScheduleTable, SetupError> {
        if self.schedule.is_empty() {
            return Ok(ScheduleTable::default());
        }
        let fallback = SchedulePlan {
            interval: Duration::from_secs(self.fallback.interval_secs),
            bracket: self.fallback.bracket,
        };
        ScheduleTable::new(self.schedule.clone(), fallback)
    }

    pub fn mqtt(&self) -> Result<MqttConfig, SetupError> {
        let section = &self.mqtt;
        let mut config = MqttConfig::new(&section.host)
            .port(section.port)
            .topic(&section.topic)
            .keep_alive(Duration::from_secs(section.keep_alive_secs));

        if let Some(id) = &section.client_id {
            config = config.client_id(id);
        }
        match (&section.username, &section.password) {
            (Some(user), Some(pass)) => config = config.credentials(user, pass),
            (None, None) => {}
            _ => return Err(SetupError::Config("mqtt username and password must be set together".into())),
        }

        let client = match (&section.client_cert, &section.client_key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            (None, None) => None,
            _ => return Err(SetupError::Config("mqtt client_cert and client_key must be set together".into())),
        };
        match (&section.ca_cert, client) {
            (Some(ca), client) => config = config.tls(TlsFiles { ca: ca.clone(), client }),
            (None, Some(_)) => return Err(SetupError::Config("mqtt client certificate needs ca_cert".into())),
            (None, None) => {}
        }
        Ok(config)
    }

    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    pub fn wireless(&self) -> WirelessConfig {
        WirelessConfig::new(&self.ble.device_name)
            .polling_interval(Duration::from_secs(self.ble.polling_interval_secs))
            .notification_wait(Duration::from_millis(self.ble.notification_wait_ms))
            .scan_window(Duration::from_secs(self.ble.scan_window_secs))
    }

    pub fn camera(&self) -> RpicamConfig {
        RpicamConfig::default()
            .command(&self.camera.command)
            .size(self.camera.width, self.camera.height)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.camera.settle_ms)
    }
}
