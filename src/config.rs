/*
 * Amapiano Host - Real-time Plugin Host
 * Copyright (c) 2025 MACHIKO LAB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Host configuration
//!
//! Loaded from TOML (`amapiano-host.toml`). Every field has a default so a partial
//! file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::processing::MAX_CHANNELS;

/// ホスト設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub sample_rate: f32,
    /// Largest block the render graph accepts; bigger requests are truncated.
    pub max_block_size: usize,
    pub channels: usize,
    pub max_plugins: usize,
    pub command_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// Length of automation ramps.
    pub automation_ramp_ms: f32,
    /// Use render-side ramps for automation when a plugin is connected.
    pub native_ramps: bool,
    /// Root directory for file-backed plugin artifacts.
    pub artifact_root: PathBuf,
    /// Voice count for instruments whose descriptor gives none.
    pub default_polyphony: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        let artifact_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("amapiano-host")
            .join("plugins");
        Self {
            sample_rate: 44100.0,
            max_block_size: 512,
            channels: 2,
            max_plugins: 32,
            command_queue_capacity: 256,
            event_queue_capacity: 256,
            automation_ramp_ms: 10.0,
            native_ramps: true,
            artifact_root,
            default_polyphony: 8,
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            reason: format!("Invalid config format: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "sample_rate",
                reason: format!("must be positive, got {}", self.sample_rate),
            });
        }
        if self.max_block_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_block_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(ConfigError::Invalid {
                field: "channels",
                reason: format!("must be within 1..={}, got {}", MAX_CHANNELS, self.channels),
            });
        }
        if self.max_plugins == 0 {
            return Err(ConfigError::Invalid {
                field: "max_plugins",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.command_queue_capacity < 4 || self.event_queue_capacity < 4 {
            return Err(ConfigError::Invalid {
                field: "command_queue_capacity",
                reason: "queues need room for at least 4 entries".to_string(),
            });
        }
        if !self.automation_ramp_ms.is_finite() || self.automation_ramp_ms < 0.0 {
            return Err(ConfigError::Invalid {
                field: "automation_ramp_ms",
                reason: format!("must be non-negative, got {}", self.automation_ramp_ms),
            });
        }
        if !(1..=32).contains(&self.default_polyphony) {
            return Err(ConfigError::Invalid {
                field: "default_polyphony",
                reason: format!("must be within 1..=32, got {}", self.default_polyphony),
            });
        }
        Ok(())
    }

    /// Ramp length in samples at the configured rate.
    pub fn ramp_samples(&self) -> u32 {
        (self.automation_ramp_ms as f64 * 0.001 * self.sample_rate as f64).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ramp_samples(), 441);
    }

    #[test]
    fn test_partial_toml() {
        let config = HostConfig::from_toml_str("sample_rate = 48000.0\nmax_block_size = 128\n").unwrap();
        assert_eq!(config.sample_rate, 48000.0);
        assert_eq!(config.max_block_size, 128);
        assert_eq!(config.channels, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = HostConfig::from_toml_str("sample_rate = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sample_rate", .. }));

        let err = HostConfig::from_toml_str("channels = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "channels", .. }));
        assert!(HostConfig::from_toml_str("channels = 8").is_ok());

        let err = HostConfig::from_toml_str("default_polyphony = 64").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "default_polyphony", .. }));

        let err = HostConfig::from_toml_str("sample_rate = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("host.toml");
        let config = HostConfig {
            native_ramps: false,
            artifact_root: dir.path().to_path_buf(),
            ..HostConfig::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(HostConfig::load_from_file(&path).unwrap(), config);

        let missing = HostConfig::load_from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
