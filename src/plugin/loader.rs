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

//! Plugin Loader - format-specific loading of plugin artifacts
//!
//! Each [`PluginFormat`] has one [`UnitLoader`]. A loader fetches the artifact,
//! verifies its digest, "compiles" it (parses or opens it), resolves the entry point
//! name and instantiates the unit through the [`UnitRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::errors::{HostError, HostResult, LoadPhase};
use crate::parameters::ParameterValue;
use crate::plugin::api::{
    PluginApiVersionFn, PluginDescriptor, PluginEntryPointFn, PluginFormat, PluginMetadata, PluginUnit,
    PLUGIN_API_VERSION,
};
use crate::plugin::manifest::{sha256_hex, verify_digest, ScriptManifest};
use crate::plugin::registry::UnitRegistry;
use crate::plugin::source::ArtifactSource;

/// Custom section holding the entry point name of a bytecode plugin.
pub const ENTRY_SECTION: &str = "plugin-entry";

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_VERSION: u32 = 1;

/// A freshly instantiated, not yet initialized unit.
pub struct LoadedUnit {
    pub unit: Box<dyn PluginUnit>,
    /// Keeps a native library mapped; dropped after `unit`.
    pub library: Option<Library>,
    pub digest: String,
    pub entry_point: String,
    /// Parameter values to apply after initialization.
    pub defaults: BTreeMap<String, ParameterValue>,
}

impl std::fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("plugin_id", &self.unit.metadata().id)
            .field("entry_point", &self.entry_point)
            .field("digest", &self.digest)
            .field("native", &self.library.is_some())
            .finish()
    }
}

/// Collaborators shared by every loader.
#[derive(Clone)]
pub struct LoadContext {
    pub source: Arc<dyn ArtifactSource>,
    pub registry: Arc<UnitRegistry>,
}

impl LoadContext {
    /// Fetch the artifact and check it against the descriptor's digest.
    fn fetch_verified(&self, descriptor: &PluginDescriptor) -> HostResult<(Vec<u8>, String)> {
        let bytes = self
            .source
            .fetch(&descriptor.download_url)
            .map_err(|e| HostError::load(&descriptor.id, LoadPhase::Fetch, e.to_string()))?;
        let digest = match &descriptor.sha256 {
            Some(expected) => verify_digest(&bytes, expected)
                .map_err(|reason| HostError::load(&descriptor.id, LoadPhase::Verify, reason))?,
            None => sha256_hex(&bytes),
        };
        Ok((bytes, digest))
    }

    fn instantiate(&self, entry_point: &str, metadata: &PluginMetadata) -> HostResult<Box<dyn PluginUnit>> {
        self.registry.create(entry_point, metadata).ok_or_else(|| {
            HostError::load(
                &metadata.id,
                LoadPhase::EntryPoint,
                format!("unknown entry point '{}'", entry_point),
            )
        })
    }
}

/// Loading strategy for one plugin format
pub trait UnitLoader: Send + Sync {
    fn format(&self) -> PluginFormat;

    fn load(
        &self,
        descriptor: &PluginDescriptor,
        metadata: &PluginMetadata,
        context: &LoadContext,
    ) -> HostResult<LoadedUnit>;
}

/// Interpreted plugins: a TOML script manifest.
#[derive(Debug, Default)]
pub struct ScriptLoader;

impl UnitLoader for ScriptLoader {
    fn format(&self) -> PluginFormat {
        PluginFormat::Interpreted
    }

    fn load(
        &self,
        descriptor: &PluginDescriptor,
        metadata: &PluginMetadata,
        context: &LoadContext,
    ) -> HostResult<LoadedUnit> {
        let id = descriptor.id.as_str();
        let (bytes, digest) = context.fetch_verified(descriptor)?;

        let text = std::str::from_utf8(&bytes)
            .map_err(|e| HostError::load(id, LoadPhase::Compile, format!("script is not UTF-8: {}", e)))?;
        let manifest =
            ScriptManifest::load_from_str(text).map_err(|reason| HostError::load(id, LoadPhase::Compile, reason))?;
        if manifest.plugin.api_version != PLUGIN_API_VERSION {
            return Err(HostError::load(
                id,
                LoadPhase::Compile,
                format!(
                    "API version mismatch: required {}, found {}",
                    PLUGIN_API_VERSION, manifest.plugin.api_version
                ),
            ));
        }

        let entry_point = manifest
            .plugin
            .default_export
            .ok_or_else(|| HostError::load(id, LoadPhase::EntryPoint, "script has no default export"))?;
        let unit = context.instantiate(&entry_point, metadata)?;

        Ok(LoadedUnit {
            unit,
            library: None,
            digest,
            entry_point,
            defaults: manifest.defaults,
        })
    }
}

/// Portable bytecode plugins: a WebAssembly module carrying a `plugin-entry` custom section.
#[derive(Debug, Default)]
pub struct BytecodeLoader;

impl BytecodeLoader {
    /// Validate the module header and return the entry point name.
    pub fn entry_point(module: &[u8]) -> Result<Option<String>, String> {
        if module.len() < 8 || &module[..4] != WASM_MAGIC {
            return Err("not a WebAssembly module".to_string());
        }
        let version = u32::from_le_bytes([module[4], module[5], module[6], module[7]]);
        if version != WASM_VERSION {
            return Err(format!("unsupported module version {}", version));
        }

        let mut cursor = 8;
        while cursor < module.len() {
            let section_id = module[cursor];
            cursor += 1;
            let size = read_leb128_u32(module, &mut cursor)? as usize;
            let end = cursor
                .checked_add(size)
                .filter(|&end| end <= module.len())
                .ok_or_else(|| format!("section {} overruns the module", section_id))?;

            if section_id == 0 {
                let mut inner = cursor;
                let name_len = read_leb128_u32(&module[..end], &mut inner)? as usize;
                let name_end = inner
                    .checked_add(name_len)
                    .filter(|&name_end| name_end <= end)
                    .ok_or_else(|| "custom section name overruns its section".to_string())?;
                let name = std::str::from_utf8(&module[inner..name_end])
                    .map_err(|_| "custom section name is not UTF-8".to_string())?;
                if name == ENTRY_SECTION {
                    let entry = std::str::from_utf8(&module[name_end..end])
                        .map_err(|_| "entry point name is not UTF-8".to_string())?;
                    return Ok(Some(entry.trim().to_string()));
                }
            }
            cursor = end;
        }
        Ok(None)
    }
}

fn read_leb128_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, String> {
    let mut result: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *bytes
            .get(*cursor)
            .ok_or_else(|| "truncated LEB128 value".to_string())?;
        *cursor += 1;
        if shift >= 32 {
            return Err("LEB128 value too large".to_string());
        }
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

impl UnitLoader for BytecodeLoader {
    fn format(&self) -> PluginFormat {
        PluginFormat::PortableBytecode
    }

    fn load(
        &self,
        descriptor: &PluginDescriptor,
        metadata: &PluginMetadata,
        context: &LoadContext,
    ) -> HostResult<LoadedUnit> {
        let id = descriptor.id.as_str();
        let (bytes, digest) = context.fetch_verified(descriptor)?;
        let entry_point = Self::entry_point(&bytes)
            .map_err(|reason| HostError::load(id, LoadPhase::Compile, reason))?
            .filter(|entry| !entry.is_empty())
            .ok_or_else(|| {
                HostError::load(id, LoadPhase::EntryPoint, format!("module has no '{}' section", ENTRY_SECTION))
            })?;
        let unit = context.instantiate(&entry_point, metadata)?;

        Ok(LoadedUnit {
            unit,
            library: None,
            digest,
            entry_point,
            defaults: BTreeMap::new(),
        })
    }
}

/// Natively compiled plugins: a shared library exporting `plugin_api_version` and
/// `plugin_entry_point` (see [`crate::export_plugin_entry`]).
#[derive(Debug, Default)]
pub struct NativeLoader;

impl UnitLoader for NativeLoader {
    fn format(&self) -> PluginFormat {
        PluginFormat::NativelyCompiled
    }

    fn load(
        &self,
        descriptor: &PluginDescriptor,
        metadata: &PluginMetadata,
        context: &LoadContext,
    ) -> HostResult<LoadedUnit> {
        let id = descriptor.id.as_str();
        let path = context.source.local_path(&descriptor.download_url).ok_or_else(|| {
            HostError::load(
                id,
                LoadPhase::Fetch,
                format!("{} is not available as a local file", descriptor.download_url),
            )
        })?;
        let (_, digest) = context.fetch_verified(descriptor)?;

        // Load the dynamic library
        let library = unsafe {
            Library::new(&path)
                .map_err(|e| HostError::load(id, LoadPhase::Compile, format!("Failed to load library: {}", e)))?
        };

        // Verify API version compatibility
        let version = unsafe {
            let get_version: Symbol<PluginApiVersionFn> = library.get(b"plugin_api_version").map_err(|e| {
                HostError::load(id, LoadPhase::EntryPoint, format!("Missing plugin_api_version: {}", e))
            })?;
            get_version()
        };
        if version != PLUGIN_API_VERSION {
            return Err(HostError::load(
                id,
                LoadPhase::Compile,
                format!("API version mismatch: required {}, found {}", PLUGIN_API_VERSION, version),
            ));
        }

        let entry_point = unsafe {
            let get_entry: Symbol<PluginEntryPointFn> = library.get(b"plugin_entry_point").map_err(|e| {
                HostError::load(id, LoadPhase::EntryPoint, format!("Missing plugin_entry_point: {}", e))
            })?;
            let ptr = get_entry();
            if ptr.is_null() {
                return Err(HostError::load(id, LoadPhase::EntryPoint, "plugin_entry_point returned null"));
            }
            CStr::from_ptr(ptr)
                .to_str()
                .map_err(|e| HostError::load(id, LoadPhase::EntryPoint, format!("Invalid entry point name: {}", e)))?
                .to_string()
        };
        let unit = context.instantiate(&entry_point, metadata)?;

        Ok(LoadedUnit {
            unit,
            library: Some(library),
            digest,
            entry_point,
            defaults: BTreeMap::new(),
        })
    }
}

/// Format → loader dispatch table plus the shared collaborators.
pub struct LoaderSet {
    loaders: HashMap<PluginFormat, Box<dyn UnitLoader>>,
    context: LoadContext,
}

impl LoaderSet {
    /// Every format supported.
    pub fn new(source: Arc<dyn ArtifactSource>, registry: Arc<UnitRegistry>) -> Self {
        Self::empty(source, registry)
            .with_loader(Box::new(ScriptLoader))
            .with_loader(Box::new(BytecodeLoader))
            .with_loader(Box::new(NativeLoader))
    }

    pub fn empty(source: Arc<dyn ArtifactSource>, registry: Arc<UnitRegistry>) -> Self {
        Self {
            loaders: HashMap::new(),
            context: LoadContext { source, registry },
        }
    }

    pub fn with_loader(mut self, loader: Box<dyn UnitLoader>) -> Self {
        self.loaders.insert(loader.format(), loader);
        self
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.context.registry
    }

    pub fn supports(&self, format: PluginFormat) -> bool {
        self.loaders.contains_key(&format)
    }

    /// Run the loader for the descriptor's format. Blocking.
    pub fn load(&self, descriptor: &PluginDescriptor, metadata: &PluginMetadata) -> HostResult<LoadedUnit> {
        let loader = self.loaders.get(&descriptor.format).ok_or_else(|| {
            HostError::load(
                &descriptor.id,
                LoadPhase::Format,
                format!("no loader for format {}", descriptor.format),
            )
        })?;
        loader.load(descriptor, metadata, &self.context)
    }
}
