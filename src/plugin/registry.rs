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

use std::sync::Arc;

use dashmap::DashMap;

use crate::plugin::api::{PluginMetadata, PluginUnit};
use crate::units::{EqualizerUnit, LogDrumUnit};

/// Entry point of the bundled 5-band equalizer.
pub const PARAMETRIC_EQ: &str = "parametric-eq";
/// Entry point of the bundled log drum synthesizer.
pub const LOG_DRUM_SYNTH: &str = "log-drum-synth";

pub type UnitConstructor = Arc<dyn Fn(&PluginMetadata) -> Box<dyn PluginUnit> + Send + Sync>;

/// Entry point name → unit constructor
pub struct UnitRegistry {
    constructors: DashMap<String, UnitConstructor>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            constructors: DashMap::new(),
        }
    }

    /// Registry with the bundled units.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(PARAMETRIC_EQ, |metadata| Box::new(EqualizerUnit::new(metadata.clone())));
        registry.register(LOG_DRUM_SYNTH, |metadata| Box::new(LogDrumUnit::new(metadata.clone())));
        registry
    }

    pub fn register<F>(&self, entry_point: &str, constructor: F)
    where
        F: Fn(&PluginMetadata) -> Box<dyn PluginUnit> + Send + Sync + 'static,
    {
        self.constructors.insert(entry_point.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.constructors.contains_key(entry_point)
    }

    pub fn create(&self, entry_point: &str, metadata: &PluginMetadata) -> Option<Box<dyn PluginUnit>> {
        // clone the constructor out so no shard lock is held while it runs
        let constructor = self.constructors.get(entry_point).map(|entry| entry.value().clone())?;
        Some(constructor(metadata))
    }

    pub fn entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
