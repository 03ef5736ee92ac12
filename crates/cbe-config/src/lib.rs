// crates/cbe-config/src/lib.rs

use core::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "cbe.toml";

/// The two tick intervals and diagnostics the engine is configured
/// with. A zero interval disables the corresponding timer.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ConfigFile {
    #[serde(flatten)]
    pub tick: TickConfig,

    #[serde(default)]
    pub show_progress: bool,
}

impl ConfigFile {
    #[must_use]
    pub const fn new(tick: TickConfig, show_progress: bool) -> Self {
        Self {
            tick,
            show_progress,
        }
    }

    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(ConfigError::Parse)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TickConfig {
    /// 0 disables the sync tick (cache flush + snapshot creation).
    #[serde(rename = "sync_interval_ms", with = "serde_duration")]
    pub sync_interval: Duration,

    /// 0 disables the secure tick (superblock rotation).
    #[serde(rename = "secure_interval_ms", with = "serde_duration")]
    pub secure_interval: Duration,
}

impl TickConfig {
    #[must_use]
    pub const fn new(sync_interval: Duration, secure_interval: Duration) -> Self {
        Self {
            sync_interval,
            secure_interval,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            sync_interval: Duration::ZERO,
            secure_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
