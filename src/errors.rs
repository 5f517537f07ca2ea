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

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// パラメーターエラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Parameter '{id}' not found")]
    Unknown { id: String },

    #[error("Parameter '{id}' value out of range: {reason}")]
    OutOfRange { id: String, reason: String },

    #[error("Invalid value for parameter '{id}': expected {expected}, found {found}")]
    InvalidType {
        id: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Parameter '{id}' is not automatable")]
    NotAutomatable { id: String },
}

impl ParameterError {
    pub fn unknown(id: &str) -> Self {
        ParameterError::Unknown { id: id.to_string() }
    }
}

pub type ParameterResult<T> = Result<T, ParameterError>;

/// プラグインユニット内部のエラー
#[derive(Debug, Clone, Error)]
pub enum UnitError {
    #[error("Initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("Unit processed before initialize()")]
    NotInitialized,

    #[error("Unit used after dispose()")]
    Disposed,

    #[error("Block of {found} samples exceeds the prepared maximum of {max}")]
    BlockTooLarge { found: usize, max: usize },

    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

pub type UnitResult<T> = Result<T, UnitError>;

/// Phase of a plugin load in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadPhase {
    Format,
    Fetch,
    Verify,
    Compile,
    EntryPoint,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPhase::Format => "format",
            LoadPhase::Fetch => "fetch",
            LoadPhase::Verify => "verify",
            LoadPhase::Compile => "compile",
            LoadPhase::EntryPoint => "entry-point",
        };
        f.write_str(name)
    }
}

/// Why a bridge stopped rendering its unit.
#[derive(Debug, Clone)]
pub enum FaultReason {
    /// The unit panicked inside `process`.
    Panicked(String),
    /// The unit returned an error from `process`.
    Failed(UnitError),
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::Panicked(message) => write!(f, "panicked: {}", message),
            FaultReason::Failed(error) => write!(f, "{}", error),
        }
    }
}

/// A fault raised on the render path, delivered to the control path.
#[derive(Debug, Clone)]
pub struct RenderFault {
    pub plugin_id: Arc<str>,
    pub reason: FaultReason,
    /// Transport time of the block that faulted.
    pub at_time: f64,
}

impl fmt::Display for RenderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plugin {} faulted at {:.3}s: {}",
            self.plugin_id, self.at_time, self.reason
        )
    }
}

impl std::error::Error for RenderFault {}

/// ホスト全体のエラー型
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("Plugin not found: {plugin_id}")]
    PluginNotFound { plugin_id: String },

    #[error("Failed to load plugin {plugin_id} during {phase}: {reason}")]
    PluginLoad {
        plugin_id: String,
        phase: LoadPhase,
        reason: String,
    },

    #[error("Failed to initialize plugin {plugin_id}: {source}")]
    Initialization {
        plugin_id: String,
        #[source]
        source: UnitError,
    },

    #[error("Plugin {plugin_id} cannot {operation} while {state}")]
    InvalidState {
        plugin_id: String,
        state: String,
        operation: &'static str,
    },

    #[error("Parameter error on plugin {plugin_id}: {source}")]
    Parameter {
        plugin_id: String,
        #[source]
        source: ParameterError,
    },

    #[error("Routing error for {plugin_id}: {reason}")]
    Routing { plugin_id: String, reason: String },

    #[error("Preset error: {reason}")]
    Preset { reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RenderFault(#[from] RenderFault),
}

impl HostError {
    pub fn not_found(plugin_id: &str) -> Self {
        HostError::PluginNotFound {
            plugin_id: plugin_id.to_string(),
        }
    }

    pub fn load(plugin_id: &str, phase: LoadPhase, reason: impl Into<String>) -> Self {
        HostError::PluginLoad {
            plugin_id: plugin_id.to_string(),
            phase,
            reason: reason.into(),
        }
    }

    pub fn parameter(plugin_id: &str, source: ParameterError) -> Self {
        HostError::Parameter {
            plugin_id: plugin_id.to_string(),
            source,
        }
    }

    pub fn routing(plugin_id: &str, reason: impl Into<String>) -> Self {
        HostError::Routing {
            plugin_id: plugin_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Plugin id the error refers to, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            HostError::PluginNotFound { plugin_id }
            | HostError::PluginLoad { plugin_id, .. }
            | HostError::Initialization { plugin_id, .. }
            | HostError::InvalidState { plugin_id, .. }
            | HostError::Parameter { plugin_id, .. }
            | HostError::Routing { plugin_id, .. } => Some(plugin_id),
            HostError::RenderFault(fault) => Some(&fault.plugin_id),
            HostError::Preset { .. } | HostError::Config(_) => None,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// 設定ファイルのエラー
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Config I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Config parsing error: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HostError::not_found("eq-1");
        assert_eq!(error.to_string(), "Plugin not found: eq-1");
        assert_eq!(error.plugin_id(), Some("eq-1"));
    }

    #[test]
    fn test_load_error_carries_phase() {
        let error = HostError::load("synth", LoadPhase::EntryPoint, "no default export");
        let message = error.to_string();
        assert!(message.contains("synth"));
        assert!(message.contains("entry-point"));
        assert!(message.contains("no default export"));
    }

    #[test]
    fn test_parameter_error_conversion() {
        let unit_error: UnitError = ParameterError::unknown("gain").into();
        match unit_error {
            UnitError::Parameter(ParameterError::Unknown { id }) => assert_eq!(id, "gain"),
            other => panic!("Expected parameter error, got {:?}", other),
        }
    }

    #[test]
    fn test_render_fault_display() {
        let fault = RenderFault {
            plugin_id: Arc::from("drums"),
            reason: FaultReason::Panicked("index out of bounds".to_string()),
            at_time: 1.5,
        };
        let error: HostError = fault.into();
        assert_eq!(error.plugin_id(), Some("drums"));
        assert!(error.to_string().contains("index out of bounds"));
    }
}
