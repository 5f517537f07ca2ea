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

//! Amapiano Host Plugin System
//!
//! - **Descriptors**: published JSON descriptions selecting a packaging format
//! - **Loaders**: one strategy per format, fed by an injected artifact source
//! - **Registry**: entry point names resolved to unit constructors
//! - **Host**: lifecycle, automation, presets and render graph wiring

pub mod api;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod source;

pub use api::*;
pub use host::{AutomationPath, FaultReport, PendingLoad, PluginHost, PluginInfo, PluginState};
pub use loader::{BytecodeLoader, LoadedUnit, LoaderSet, NativeLoader, ScriptLoader, UnitLoader};
pub use manifest::ScriptManifest;
pub use registry::{UnitRegistry, LOG_DRUM_SYNTH, PARAMETRIC_EQ};
pub use source::{ArtifactSource, FileSource, MemorySource, SourceError};
