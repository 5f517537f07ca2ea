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

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{HostError, HostResult};
use crate::parameters::ParameterValue;

/// プリセット - パラメーターのスナップショット
///
/// Presets carry no schema version. Loading applies only the ids the target unit
/// knows, so a preset saved by an older layout still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultural_context: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Preset {
    pub fn new(name: &str, parameters: BTreeMap<String, ParameterValue>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            author: None,
            description: None,
            parameters,
            cultural_context: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Build a preset from a static table of numeric values.
    pub fn from_values(name: &str, values: &[(&str, f32)]) -> Self {
        let parameters = values
            .iter()
            .map(|(id, value)| (id.to_string(), ParameterValue::from(*value)))
            .collect();
        Self::new(name, parameters)
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn with_cultural_context(mut self, context: &str) -> Self {
        self.cultural_context = Some(context.to_string());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }

    pub fn parameter(&self, id: &str) -> Option<&ParameterValue> {
        self.parameters.get(id)
    }

    pub fn to_json(&self) -> HostResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| HostError::Preset {
            reason: format!("Failed to serialize preset '{}': {}", self.name, e),
        })
    }

    pub fn from_json(json: &str) -> HostResult<Self> {
        serde_json::from_str(json).map_err(|e| HostError::Preset {
            reason: format!("Invalid preset JSON: {}", e),
        })
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> HostResult<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| HostError::Preset {
            reason: format!("Failed to write {}: {}", path.display(), e),
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> HostResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| HostError::Preset {
            reason: format!("Failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json(&json)
    }
}
