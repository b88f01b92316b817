//! Bridge configuration
//!
//! Loaded from a TOML file; every field has a default so a missing or
//! partial file is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::SampleFormat;
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub multi: MultiConfig,
    pub logging: LoggingConfig,
    pub demo: DemoConfig,
}

/// Multi-client engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiConfig {
    /// Allow several playback clients to share one transport
    pub mix_enabled: bool,
    /// Allow several capture clients to share one transport
    pub snoop_enabled: bool,
    /// Scale applied to unmuted channels when the device controls volume
    pub native_volume: f64,
    pub max_clients: usize,
    /// Internal period time
    pub period_ms: u32,
    /// Mix buffer capacity, in periods
    pub buffer_periods: usize,
    /// Mixed periods required before the transport is started
    pub mix_threshold_periods: usize,
    /// Periods a playback client buffers before it joins the mix
    pub client_threshold_periods: usize,
    /// Wait after a client's audio left the mix before acknowledging Drain
    pub drain_settle_ms: u64,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            mix_enabled: true,
            snoop_enabled: true,
            native_volume: 1.0,
            max_clients: DEFAULT_MAX_CLIENTS,
            period_ms: DEFAULT_PERIOD_MS,
            buffer_periods: DEFAULT_BUFFER_PERIODS,
            mix_threshold_periods: MIX_THRESHOLD_PERIODS,
            client_threshold_periods: CLIENT_THRESHOLD_PERIODS,
            drain_settle_ms: DEFAULT_DRAIN_SETTLE_MS,
        }
    }
}

impl MultiConfig {
    pub fn drain_settle(&self) -> Duration {
        Duration::from_millis(self.drain_settle_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.period_ms == 0 {
            return Err(Error::Config("multi.period_ms must be positive".into()));
        }
        if self.buffer_periods == 0 || self.mix_threshold_periods == 0 {
            return Err(Error::Config(
                "multi.buffer_periods and multi.mix_threshold_periods must be positive".into(),
            ));
        }
        if self.mix_threshold_periods > self.buffer_periods {
            return Err(Error::Config(format!(
                "multi.mix_threshold_periods ({}) exceeds multi.buffer_periods ({})",
                self.mix_threshold_periods, self.buffer_periods
            )));
        }
        if self.client_threshold_periods == 0 {
            return Err(Error::Config(
                "multi.client_threshold_periods must be positive".into(),
            ));
        }
        if self.max_clients == 0 {
            return Err(Error::Config("multi.max_clients must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.native_volume) {
            return Err(Error::Config(format!(
                "multi.native_volume {} is outside [0, 1]",
                self.native_volume
            )));
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Settings for the loopback demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub rate: u32,
    pub channels: u8,
    pub format: SampleFormat,
    /// Number of synthetic tone clients
    pub clients: usize,
    pub duration_secs: u64,
    /// Raw PCM output file for the mix, discarded when unset
    pub output: Option<PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            format: SampleFormat::S16Le,
            clients: 2,
            duration_secs: 5,
            output: None,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.multi.validate()?;
        Ok(config)
    }

    /// Load from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from the per-user default location, falling back to defaults
    /// when no file exists there
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `$XDG_CONFIG_HOME/bluemix/bluemix.toml` on Linux
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "bluemix", "bluemix")
            .map(|dirs| dirs.config_dir().join("bluemix.toml"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            [multi]
            max_clients = 4
            native_volume = 0.5

            [demo]
            format = "s32_le"
            "#,
        )
        .unwrap();
        assert_eq!(config.multi.max_clients, 4);
        assert_eq!(config.multi.native_volume, 0.5);
        assert_eq!(config.multi.period_ms, DEFAULT_PERIOD_MS);
        assert_eq!(config.demo.format, SampleFormat::S32Le);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_threshold_beyond_buffer() {
        let err = BridgeConfig::from_toml(
            r#"
            [multi]
            buffer_periods = 2
            mix_threshold_periods = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = BridgeConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = BridgeConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.multi.drain_settle_ms, config.multi.drain_settle_ms);
    }
}
