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

//! Script manifests and artifact integrity
//!
//! An interpreted plugin is shipped as a small TOML script manifest naming the
//! unit it exports and the parameter defaults to apply once it is initialized.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::parameters::ParameterValue;
use crate::plugin::api::PLUGIN_API_VERSION;

fn default_api_version() -> u32 {
    PLUGIN_API_VERSION
}

/// `[plugin]` section of a script manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSection {
    /// Entry point name resolved through the unit registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_export: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: u32,
}

/// Script manifest structure
///
/// ```toml
/// [plugin]
/// default_export = "parametric-eq"
/// api_version = 1
///
/// [defaults]
/// low_gain = 2.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptManifest {
    pub plugin: ScriptSection,
    #[serde(default)]
    pub defaults: BTreeMap<String, ParameterValue>,
}

impl ScriptManifest {
    pub fn new(default_export: &str) -> Self {
        Self {
            plugin: ScriptSection {
                default_export: Some(default_export.to_string()),
                api_version: PLUGIN_API_VERSION,
            },
            defaults: BTreeMap::new(),
        }
    }

    pub fn with_default(mut self, id: &str, value: impl Into<ParameterValue>) -> Self {
        self.defaults.insert(id.to_string(), value.into());
        self
    }

    /// Load manifest from TOML string
    pub fn load_from_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Invalid script manifest: {}", e))
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize script manifest: {}", e))
    }
}

/// Lower-case hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compare an artifact against an expected hex digest (case-insensitive).
pub fn verify_digest(bytes: &[u8], expected: &str) -> Result<String, String> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(actual)
    } else {
        Err(format!("checksum mismatch: expected {}, found {}", expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ScriptManifest::new("log-drum-synth")
            .with_default("tone", 0.5)
            .with_default("tune", -2);
        let text = manifest.to_toml().unwrap();
        assert_eq!(ScriptManifest::load_from_str(&text).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_defaults_section() {
        let manifest = ScriptManifest::load_from_str(
            "[plugin]\ndefault_export = \"parametric-eq\"\n\n[defaults]\nlow_gain = 3\nbypass = false\n",
        )
        .unwrap();
        assert_eq!(manifest.plugin.api_version, PLUGIN_API_VERSION);
        assert_eq!(manifest.defaults["low_gain"], ParameterValue::Number(3.0));
        assert_eq!(manifest.defaults["bypass"], ParameterValue::Bool(false));
    }

    #[test]
    fn test_missing_export_parses_as_none() {
        let manifest = ScriptManifest::load_from_str("[plugin]\napi_version = 1\n").unwrap();
        assert_eq!(manifest.plugin.default_export, None);
        assert!(ScriptManifest::load_from_str("not toml at all = = =").is_err());
    }

    #[test]
    fn test_digest() {
        // sha256("abc")
        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(sha256_hex(b"abc"), expected);
        assert!(verify_digest(b"abc", &expected.to_uppercase()).is_ok());
        assert!(verify_digest(b"abd", expected).is_err());
    }
}
