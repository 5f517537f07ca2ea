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

//! Plugin API - Core interfaces for hosted plugin units
//!
//! Defines the descriptor a plugin is published with, the immutable metadata the
//! host derives from it, and the [`PluginUnit`] trait every processing unit
//! implements. Shared libraries export their entry point through
//! [`export_plugin_entry!`].

use std::os::raw::c_char;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{HostError, HostResult, LoadPhase, ParameterResult, UnitResult};
use crate::parameters::{ParameterStore, ParameterValue};
use crate::preset::Preset;
use crate::processing::{AudioBuffer, MidiEvent, RenderContext};

/// Plugin API version - must match between host and plugin
pub const PLUGIN_API_VERSION: u32 = 1;

/// Upper bound on any instrument's voice pool.
pub const MAX_POLYPHONY: usize = 32;

/// Plugin category types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginCategory {
    Instrument,
    Effect,
    MidiEffect,
    Analyzer,
}

/// How a plugin artifact is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginFormat {
    #[serde(alias = "javascript")]
    Interpreted,
    #[serde(alias = "wasm")]
    PortableBytecode,
    #[serde(alias = "native")]
    NativelyCompiled,
}

impl std::fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PluginFormat::Interpreted => "interpreted",
            PluginFormat::PortableBytecode => "portable-bytecode",
            PluginFormat::NativelyCompiled => "natively-compiled",
        };
        f.write_str(name)
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Published plugin description (JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginCategory,
    pub format: PluginFormat,
    /// Free-form catalogue category such as "eq" or "drums".
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultural_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_polyphony: Option<usize>,
    #[serde(default)]
    pub latency: u32,
    #[serde(default)]
    pub supports_automation: bool,
    #[serde(default, rename = "supportsMIDI")]
    pub supports_midi: bool,
    #[serde(default, rename = "hasCustomUI")]
    pub has_custom_ui: bool,
    #[serde(default)]
    pub license: String,
    pub download_url: String,
    /// Hex SHA-256 of the artifact; verified when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl PluginDescriptor {
    pub fn new(
        id: &str,
        name: &str,
        plugin_type: PluginCategory,
        format: PluginFormat,
        download_url: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: default_version(),
            author: String::new(),
            description: String::new(),
            plugin_type,
            format,
            category: String::new(),
            tags: Vec::new(),
            cultural_context: None,
            max_polyphony: None,
            latency: 0,
            supports_automation: true,
            supports_midi: plugin_type == PluginCategory::Instrument,
            has_custom_ui: false,
            license: String::new(),
            download_url: download_url.to_string(),
            sha256: None,
        }
    }

    pub fn from_json(json: &str) -> HostResult<Self> {
        serde_json::from_str(json).map_err(|e| HostError::load("unknown", LoadPhase::Format, e.to_string()))
    }

    pub fn with_polyphony(mut self, voices: usize) -> Self {
        self.max_polyphony = Some(voices);
        self
    }

    pub fn with_sha256(mut self, digest: &str) -> Self {
        self.sha256 = Some(digest.to_string());
        self
    }
}

/// Immutable identity of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub category: PluginCategory,
    pub format: PluginFormat,
    /// Voice limit; instruments only.
    pub max_polyphony: Option<usize>,
    pub latency_samples: u32,
    pub supports_automation: bool,
    pub supports_midi: bool,
}

impl PluginMetadata {
    pub fn from_descriptor(descriptor: &PluginDescriptor, default_polyphony: usize) -> Self {
        let max_polyphony = (descriptor.plugin_type == PluginCategory::Instrument).then(|| {
            descriptor
                .max_polyphony
                .unwrap_or(default_polyphony)
                .clamp(1, MAX_POLYPHONY)
        });
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            author: descriptor.author.clone(),
            category: descriptor.plugin_type,
            format: descriptor.format,
            max_polyphony,
            latency_samples: descriptor.latency,
            supports_automation: descriptor.supports_automation,
            supports_midi: descriptor.supports_midi,
        }
    }
}

/// A hosted processing unit.
///
/// `process` runs on the render thread: it must not allocate, lock or block.
/// Parameter values are read from the shared [`ParameterStore`], which the control
/// side writes concurrently.
pub trait PluginUnit: Send {
    fn metadata(&self) -> &PluginMetadata;

    fn parameters(&self) -> &Arc<ParameterStore>;

    /// One-time setup. Re-initializing requires a new instance.
    fn initialize(&mut self, sample_rate: f32, max_block_size: usize) -> UnitResult<()>;

    fn process(
        &mut self,
        input: &AudioBuffer,
        output: &mut AudioBuffer,
        context: &RenderContext,
        midi: &[MidiEvent],
    ) -> UnitResult<()>;

    fn dispose(&mut self);

    /// Clear DSP history and voices without touching parameters.
    fn reset(&mut self) {}

    fn factory_presets(&self) -> &[Preset] {
        &[]
    }

    fn get_parameter(&self, id: &str) -> ParameterResult<ParameterValue> {
        self.parameters().get(id)
    }

    fn set_parameter(&mut self, id: &str, value: ParameterValue) -> ParameterResult<ParameterValue> {
        self.parameters().set(id, value)
    }

    /// Apply the preset's known ids; returns how many were applied.
    fn load_preset(&mut self, preset: &Preset) -> usize {
        self.parameters().apply_snapshot(&preset.parameters)
    }

    fn save_preset(&self, name: &str) -> Preset {
        Preset::new(name, self.parameters().snapshot())
    }
}

/// Validates the `(sample_rate, max_block_size)` pair passed to `initialize`.
pub fn check_initialize_args(sample_rate: f32, max_block_size: usize) -> UnitResult<()> {
    use crate::errors::UnitError;

    if !sample_rate.is_finite() || sample_rate <= 0.0 {
        return Err(UnitError::Initialization {
            reason: format!("invalid sample rate {}", sample_rate),
        });
    }
    if max_block_size == 0 {
        return Err(UnitError::Initialization {
            reason: "max block size must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Shared-library export returning the API version the library was built against.
///
/// Exported as `plugin_api_version`.
pub type PluginApiVersionFn = unsafe extern "C" fn() -> u32;

/// Shared-library export returning the NUL-terminated entry point name.
///
/// Exported as `plugin_entry_point`.
pub type PluginEntryPointFn = unsafe extern "C" fn() -> *const c_char;

/// Helper macro for implementing shared-library entry points
#[macro_export]
macro_rules! export_plugin_entry {
    ($entry:literal) => {
        #[no_mangle]
        pub extern "C" fn plugin_api_version() -> u32 {
            $crate::plugin::PLUGIN_API_VERSION
        }

        #[no_mangle]
        pub extern "C" fn plugin_entry_point() -> *const std::os::raw::c_char {
            concat!($entry, "\0").as_ptr() as *const std::os::raw::c_char
        }
    };
}
