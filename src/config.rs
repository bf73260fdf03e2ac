//! Static startup configuration.
//!
//! Read once from TOML before the hand core is built. There is no runtime
//! reconfiguration: the slot layout fixes the pool size for the whole process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, Level};

use crate::device::{Orientation, PhysicalDeviceIdentity};
use crate::hand::HandSettings;

const CONFIG_DIR: &str = ".config/hapticlink";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("No hand slots configured")]
    EmptyPool,

    #[error("Tick rate must be within 1..=1000 Hz, got {0}")]
    InvalidTickRate(u32),

    #[error("Pose channel capacity must be positive")]
    InvalidChannelCapacity,

    #[error("Unknown log level: {0}")]
    InvalidLogLevel(String),

    #[error("Duplicate simulated glove identity: {0}")]
    DuplicateDevice(PhysicalDeviceIdentity),

    #[error("Simulated {0} must be positive")]
    ZeroSimulatedPeriod(&'static str),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HapticConfig {
    /// Ordered slot layout
    pub slots: Vec<Orientation>,
    pub tick_rate_hz: u32,
    pub retention_grace_ticks: u32,
    pub pose_channel_capacity: usize,
    pub stats_interval_secs: u64,
    pub log_level: String,
    pub transport: TransportConfig,
}

impl Default for HapticConfig {
    fn default() -> Self {
        Self {
            slots: vec![Orientation::Left, Orientation::Right],
            tick_rate_hz: 90,
            retention_grace_ticks: 0,
            pose_channel_capacity: 64,
            stats_interval_secs: 10,
            log_level: "info".to_string(),
            transport: TransportConfig::default(),
        }
    }
}

/// Which device layer to drive. Only the loopback rig ships with this crate.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Simulated(SimulatedConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Simulated(SimulatedConfig::default())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulatedConfig {
    pub devices: Vec<SimulatedDevice>,
    pub motion_interval_ms: u64,
    /// Reconnect one glove under a new session id at this period
    pub reconnect_every_secs: Option<u64>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                SimulatedDevice {
                    identity: PhysicalDeviceIdentity::new("SIM-L-0001"),
                    orientation: Orientation::Left,
                },
                SimulatedDevice {
                    identity: PhysicalDeviceIdentity::new("SIM-R-0001"),
                    orientation: Orientation::Right,
                },
            ],
            motion_interval_ms: 20,
            reconnect_every_secs: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SimulatedDevice {
    pub identity: PhysicalDeviceIdentity,
    pub orientation: Orientation,
}

impl HapticConfig {
    /// `~/.config/hapticlink/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Picks the file to read: `explicit` if given, otherwise the default
    /// location when it exists. `None` means run on defaults.
    pub async fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let path = Self::default_path()?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Some(path)
        } else {
            None
        }
    }

    /// Loads and validates the configuration from `path`, or the defaults
    /// when there is no file. A given path must exist.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                debug!("Reading configuration from {}", path.display());
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        if !(1..=1000).contains(&self.tick_rate_hz) {
            return Err(ConfigError::InvalidTickRate(self.tick_rate_hz));
        }
        if self.pose_channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }
        self.log_level()?;

        let TransportConfig::Simulated(simulated) = &self.transport;
        if simulated.motion_interval_ms == 0 {
            return Err(ConfigError::ZeroSimulatedPeriod("motion_interval_ms"));
        }
        if simulated.reconnect_every_secs == Some(0) {
            return Err(ConfigError::ZeroSimulatedPeriod("reconnect_every_secs"));
        }
        for (i, device) in simulated.devices.iter().enumerate() {
            if simulated.devices[..i].iter().any(|d| d.identity == device.identity) {
                return Err(ConfigError::DuplicateDevice(device.identity.clone()));
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate_hz.max(1)))
    }

    pub fn hand_settings(&self) -> HandSettings {
        HandSettings {
            retention_grace_frames: self.retention_grace_ticks,
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HapticConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slots, vec![Orientation::Left, Orientation::Right]);
        assert_eq!(config.log_level().unwrap(), Level::INFO);
    }

    #[test]
    fn parses_full_document() {
        let config = HapticConfig::from_toml_str(
            r#"
            slots = ["left", "left", "right"]
            tick_rate_hz = 120
            retention_grace_ticks = 2
            log_level = "debug"

            [transport]
            kind = "simulated"
            reconnect_every_secs = 15

            [[transport.devices]]
            identity = "LG-1"
            orientation = "left"
            "#,
        )
        .unwrap();

        assert_eq!(config.slots.len(), 3);
        assert_eq!(config.tick_rate_hz, 120);
        assert_eq!(config.hand_settings().retention_grace_frames, 2);
        assert_eq!(config.pose_channel_capacity, 64);
        let TransportConfig::Simulated(simulated) = &config.transport;
        assert_eq!(simulated.reconnect_every_secs, Some(15));
        assert_eq!(simulated.devices[0].identity.as_str(), "LG-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_layout_is_rejected() {
        let config = HapticConfig::from_toml_str("slots = []").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPool)));
    }

    #[test]
    fn bad_values_are_rejected() {
        let config = HapticConfig {
            tick_rate_hz: 0,
            ..HapticConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTickRate(0))));

        let config = HapticConfig {
            log_level: "loud".to_string(),
            ..HapticConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLogLevel(_))));

        assert!(matches!(
            HapticConfig::from_toml_str("slots = [\"middle\"]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn duplicate_simulated_gloves_are_rejected() {
        let config = HapticConfig::from_toml_str(
            r#"
            [transport]
            kind = "simulated"
            [[transport.devices]]
            identity = "X"
            orientation = "left"
            [[transport.devices]]
            identity = "X"
            orientation = "right"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateDevice(_))));
    }

    #[test]
    fn zero_simulated_periods_are_rejected() {
        let config = HapticConfig::from_toml_str(
            r#"
            [transport]
            kind = "simulated"
            reconnect_every_secs = 0
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSimulatedPeriod("reconnect_every_secs"))
        ));

        let config = HapticConfig::from_toml_str(
            r#"
            [transport]
            kind = "simulated"
            motion_interval_ms = 0
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSimulatedPeriod("motion_interval_ms"))
        ));
    }

    #[test]
    fn tick_period_matches_rate() {
        let config = HapticConfig {
            tick_rate_hz: 100,
            ..HapticConfig::default()
        };
        assert_eq!(config.tick_period(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("hapticlink-does-not-exist.toml");
        let result = HapticConfig::load(Some(path.as_path())).await;
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[tokio::test]
    async fn explicit_path_wins_and_no_path_means_defaults() {
        let explicit = std::env::temp_dir().join("hapticlink-explicit.toml");
        assert_eq!(HapticConfig::locate(Some(explicit.as_path())).await, Some(explicit.clone()));

        let config = HapticConfig::load(None).await.unwrap();
        assert_eq!(config, HapticConfig::default());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("hapticlink-config-{}.toml", std::process::id()));
        tokio::fs::write(&path, "slots = [\"right\"]\ntick_rate_hz = 60\n")
            .await
            .unwrap();

        let config = HapticConfig::load(Some(path.as_path())).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(config.slots, vec![Orientation::Right]);
        assert_eq!(config.tick_rate_hz, 60);
    }
}
