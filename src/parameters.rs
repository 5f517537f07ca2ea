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

//! Parameter registry
//!
//! Every unit type publishes one [`ParameterLayout`] (dense descriptor array plus an
//! id → index lookup) shared by all of its instances. Each instance owns a
//! [`ParameterStore`] holding the current values as atomic scalars, so the control
//! context can write while the render context reads without taking a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{ParameterError, ParameterResult};

/// パラメーター値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParameterValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Number(_) => "number",
            ParameterValue::Text(_) => "string",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(value) => Some(*value),
            ParameterValue::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            ParameterValue::Text(_) => None,
        }
    }
}

impl From<f32> for ParameterValue {
    fn from(value: f32) -> Self {
        ParameterValue::Number(value as f64)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Number(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Number(value as f64)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

/// 値の種類
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterKind {
    Float,
    Int,
    Bool,
    Enum { options: Vec<String> },
    Text,
}

/// パラメーター記述子 - 各パラメーターの特性を定義
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ParameterKind,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub step: f32,
    pub default_text: String,
    pub unit: String,
    pub automatable: bool,
    pub group: String,
}

impl ParameterDescriptor {
    fn numeric(id: &str, name: &str, kind: ParameterKind, min: f32, max: f32, default: f32) -> Self {
        debug_assert!(min <= max, "parameter {} has min > max", id);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            min,
            max,
            default: default.clamp(min, max),
            step: 0.0,
            default_text: String::new(),
            unit: String::new(),
            automatable: true,
            group: String::new(),
        }
    }

    pub fn float(id: &str, name: &str, min: f32, max: f32, default: f32) -> Self {
        Self::numeric(id, name, ParameterKind::Float, min, max, default)
    }

    pub fn int(id: &str, name: &str, min: i32, max: i32, default: i32) -> Self {
        let mut descriptor =
            Self::numeric(id, name, ParameterKind::Int, min as f32, max as f32, default as f32);
        descriptor.step = 1.0;
        descriptor
    }

    pub fn toggle(id: &str, name: &str, default: bool) -> Self {
        let mut descriptor = Self::numeric(
            id,
            name,
            ParameterKind::Bool,
            0.0,
            1.0,
            if default { 1.0 } else { 0.0 },
        );
        descriptor.step = 1.0;
        descriptor
    }

    pub fn choice(id: &str, name: &str, options: &[&str], default_index: usize) -> Self {
        let options: Vec<String> = options.iter().map(|option| option.to_string()).collect();
        let max = options.len().saturating_sub(1) as f32;
        let mut descriptor = Self::numeric(
            id,
            name,
            ParameterKind::Enum { options },
            0.0,
            max,
            default_index as f32,
        );
        descriptor.step = 1.0;
        descriptor
    }

    pub fn text(id: &str, name: &str, default: &str) -> Self {
        let mut descriptor = Self::numeric(id, name, ParameterKind::Text, 0.0, 0.0, 0.0);
        descriptor.default_text = default.to_string();
        descriptor.automatable = false;
        descriptor
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn with_step(mut self, step: f32) -> Self {
        self.step = step;
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn not_automatable(mut self) -> Self {
        self.automatable = false;
        self
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self.kind, ParameterKind::Text)
    }

    /// Clamp and quantize a raw number into this descriptor's range.
    ///
    /// NaN maps to the default; infinities clamp to the nearest bound.
    pub fn clamp_number(&self, value: f64) -> f32 {
        if value.is_nan() {
            return self.default;
        }
        let clamped = value.clamp(self.min as f64, self.max as f64) as f32;
        match self.kind {
            ParameterKind::Float | ParameterKind::Text => clamped,
            ParameterKind::Bool => {
                if clamped >= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
            ParameterKind::Int | ParameterKind::Enum { .. } => self.quantize(clamped),
        }
    }

    fn quantize(&self, value: f32) -> f32 {
        let step = if self.step > 0.0 { self.step } else { 1.0 };
        let steps = ((value - self.min) / step).round();
        let mut quantized = self.min + steps * step;
        if quantized > self.max {
            quantized -= step;
        }
        quantized.max(self.min)
    }

    fn coerce(&self, value: &ParameterValue) -> ParameterResult<Coerced> {
        match (&self.kind, value) {
            (ParameterKind::Text, ParameterValue::Text(text)) => Ok(Coerced::Text(text.clone())),
            (ParameterKind::Text, other) => Err(ParameterError::InvalidType {
                id: self.id.clone(),
                expected: "string",
                found: other.kind_name(),
            }),
            (ParameterKind::Enum { options }, ParameterValue::Text(label)) => options
                .iter()
                .position(|option| option == label)
                .map(|index| Coerced::Scalar(index as f32))
                .ok_or_else(|| ParameterError::OutOfRange {
                    id: self.id.clone(),
                    reason: format!("'{}' is not one of {:?}", label, options),
                }),
            (_, ParameterValue::Text(_)) => Err(ParameterError::InvalidType {
                id: self.id.clone(),
                expected: "number",
                found: "string",
            }),
            (_, other) => {
                // as_f64 only fails for Text, handled above
                let raw = other.as_f64().unwrap_or(f64::NAN);
                Ok(Coerced::Scalar(self.clamp_number(raw)))
            }
        }
    }

    /// Render a stored scalar back into a typed value.
    fn to_value(&self, scalar: f32) -> ParameterValue {
        match self.kind {
            ParameterKind::Bool => ParameterValue::Bool(scalar >= 0.5),
            _ => ParameterValue::Number(scalar as f64),
        }
    }
}

enum Coerced {
    Scalar(f32),
    Text(String),
}

/// Read-only descriptor table shared by every instance of a unit type.
#[derive(Debug)]
pub struct ParameterLayout {
    descriptors: Vec<ParameterDescriptor>,
    index: HashMap<String, usize>,
}

impl ParameterLayout {
    pub fn new(descriptors: Vec<ParameterDescriptor>) -> Self {
        let index = descriptors
            .iter()
            .enumerate()
            .map(|(position, descriptor)| (descriptor.id.clone(), position))
            .collect();
        Self { descriptors, index }
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn descriptor(&self, index: usize) -> Option<&ParameterDescriptor> {
        self.descriptors.get(index)
    }

    pub fn get(&self, id: &str) -> Option<&ParameterDescriptor> {
        self.index_of(id).and_then(|index| self.descriptors.get(index))
    }

    pub fn descriptors(&self) -> &[ParameterDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[derive(Debug)]
struct ParameterSlot {
    value: AtomicU32,
    changed: AtomicBool,
    text: Option<RwLock<String>>,
}

/// Per-instance current values.
///
/// Writes clamp through the descriptor, store a single atomic scalar and raise the
/// slot's change flag. Units consume the flag with [`ParameterStore::take_changed`]
/// at the start of a block to rebuild dependent DSP state.
#[derive(Debug)]
pub struct ParameterStore {
    layout: Arc<ParameterLayout>,
    slots: Vec<ParameterSlot>,
}

impl ParameterStore {
    pub fn new(layout: Arc<ParameterLayout>) -> Self {
        let slots = layout
            .descriptors()
            .iter()
            .map(|descriptor| ParameterSlot {
                value: AtomicU32::new(descriptor.default.to_bits()),
                // first block after construction rebuilds everything
                changed: AtomicBool::new(true),
                text: matches!(descriptor.kind, ParameterKind::Text)
                    .then(|| RwLock::new(descriptor.default_text.clone())),
            })
            .collect();
        Self { layout, slots }
    }

    pub fn layout(&self) -> &Arc<ParameterLayout> {
        &self.layout
    }

    pub fn descriptor(&self, id: &str) -> ParameterResult<&ParameterDescriptor> {
        self.layout.get(id).ok_or_else(|| ParameterError::unknown(id))
    }

    pub fn get(&self, id: &str) -> ParameterResult<ParameterValue> {
        let index = self
            .layout
            .index_of(id)
            .ok_or_else(|| ParameterError::unknown(id))?;
        Ok(self.get_index(index))
    }

    fn get_index(&self, index: usize) -> ParameterValue {
        let descriptor = &self.layout.descriptors[index];
        let slot = &self.slots[index];
        match &slot.text {
            Some(text) => ParameterValue::Text(text.read().clone()),
            None => descriptor.to_value(f32::from_bits(slot.value.load(Ordering::Relaxed))),
        }
    }

    /// Set a parameter and return the value actually stored.
    pub fn set(&self, id: &str, value: impl Into<ParameterValue>) -> ParameterResult<ParameterValue> {
        let index = self
            .layout
            .index_of(id)
            .ok_or_else(|| ParameterError::unknown(id))?;
        self.set_index(index, &value.into())
    }

    pub fn set_index(&self, index: usize, value: &ParameterValue) -> ParameterResult<ParameterValue> {
        let descriptor = self
            .layout
            .descriptor(index)
            .ok_or_else(|| ParameterError::unknown(&format!("#{}", index)))?;
        let slot = &self.slots[index];
        match descriptor.coerce(value)? {
            Coerced::Scalar(scalar) => {
                slot.value.store(scalar.to_bits(), Ordering::Relaxed);
                slot.changed.store(true, Ordering::Release);
                Ok(descriptor.to_value(scalar))
            }
            Coerced::Text(text) => {
                if let Some(lock) = &slot.text {
                    *lock.write() = text.clone();
                }
                slot.changed.store(true, Ordering::Release);
                Ok(ParameterValue::Text(text))
            }
        }
    }

    /// Clamp and store a scalar by index. Used by automation ramps.
    pub fn write_scalar(&self, index: usize, value: f32) {
        if let (Some(descriptor), Some(slot)) = (self.layout.descriptor(index), self.slots.get(index)) {
            if descriptor.is_numeric() {
                let scalar = descriptor.clamp_number(value as f64);
                slot.value.store(scalar.to_bits(), Ordering::Relaxed);
                slot.changed.store(true, Ordering::Release);
            }
        }
    }

    /// Current scalar value; render-path read.
    #[inline]
    pub fn value(&self, index: usize) -> f32 {
        self.slots
            .get(index)
            .map_or(0.0, |slot| f32::from_bits(slot.value.load(Ordering::Relaxed)))
    }

    #[inline]
    pub fn flag(&self, index: usize) -> bool {
        self.value(index) >= 0.5
    }

    /// Returns whether the slot changed since the last call, clearing the flag.
    #[inline]
    pub fn take_changed(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.changed.swap(false, Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BTreeMap<String, ParameterValue> {
        self.layout
            .descriptors()
            .iter()
            .enumerate()
            .map(|(index, descriptor)| (descriptor.id.clone(), self.get_index(index)))
            .collect()
    }

    /// Apply the subset of `values` known to this layout; returns how many were applied.
    ///
    /// Unknown ids and values of the wrong type are skipped.
    pub fn apply_snapshot(&self, values: &BTreeMap<String, ParameterValue>) -> usize {
        let mut applied = 0;
        for (id, value) in values {
            let Some(index) = self.layout.index_of(id) else {
                log::debug!("Ignoring unknown parameter '{}' in snapshot", id);
                continue;
            };
            match self.set_index(index, value) {
                Ok(_) => applied += 1,
                Err(e) => log::debug!("Skipping snapshot value: {}", e),
            }
        }
        applied
    }

    pub fn mark_all_changed(&self) {
        for slot in &self.slots {
            slot.changed.store(true, Ordering::Release);
        }
    }

    pub fn reset_to_defaults(&self) {
        for (index, descriptor) in self.layout.descriptors().iter().enumerate() {
            let slot = &self.slots[index];
            slot.value.store(descriptor.default.to_bits(), Ordering::Relaxed);
            if let Some(text) = &slot.text {
                *text.write() = descriptor.default_text.clone();
            }
            slot.changed.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ParameterStore {
        let layout = ParameterLayout::new(vec![
            ParameterDescriptor::float("frequency", "Frequency", 20.0, 20000.0, 440.0).with_unit("Hz"),
            ParameterDescriptor::int("tune", "Tune", -24, 24, 0).with_unit("st"),
            ParameterDescriptor::int("division", "Division", 0, 10, 4).with_step(4.0),
            ParameterDescriptor::toggle("bypass", "Bypass", false),
            ParameterDescriptor::choice("shape", "Shape", &["sine", "triangle", "square"], 0),
            ParameterDescriptor::text("label", "Label", "log drum"),
        ]);
        ParameterStore::new(Arc::new(layout))
    }

    #[test]
    fn test_float_clamping() {
        let store = test_store();
        assert_eq!(store.set("frequency", 880.0).unwrap(), ParameterValue::Number(880.0));
        assert_eq!(store.set("frequency", -5.0).unwrap(), ParameterValue::Number(20.0));
        assert_eq!(store.set("frequency", 1.0e9).unwrap(), ParameterValue::Number(20000.0));
        assert_eq!(store.set("frequency", f64::INFINITY).unwrap(), ParameterValue::Number(20000.0));
        assert_eq!(store.set("frequency", f64::NEG_INFINITY).unwrap(), ParameterValue::Number(20.0));
    }

    #[test]
    fn test_nan_falls_back_to_default() {
        let store = test_store();
        store.set("frequency", 1000.0).unwrap();
        assert_eq!(store.set("frequency", f64::NAN).unwrap(), ParameterValue::Number(440.0));
        assert_eq!(store.set("tune", f64::NAN).unwrap(), ParameterValue::Number(0.0));
    }

    #[test]
    fn test_int_rounds_to_step() {
        let store = test_store();
        assert_eq!(store.set("tune", 3.4).unwrap(), ParameterValue::Number(3.0));
        assert_eq!(store.set("tune", -7.6).unwrap(), ParameterValue::Number(-8.0));
        assert_eq!(store.set("tune", 99.0).unwrap(), ParameterValue::Number(24.0));

        // step 4 within [0, 10]: the top step that fits is 8
        assert_eq!(store.set("division", 9.9).unwrap(), ParameterValue::Number(8.0));
        assert_eq!(store.set("division", 5.0).unwrap(), ParameterValue::Number(4.0));
        assert_eq!(store.set("division", 6.5).unwrap(), ParameterValue::Number(8.0));
    }

    #[test]
    fn test_clamping_property_over_many_inputs() {
        let store = test_store();
        let inputs = [
            -1.0e12, -100.0, -24.5, -0.49, 0.0, 0.5, 1.5, 12.49, 12.51, 23.7, 1.0e12,
            f64::MIN_POSITIVE, f64::MAX, f64::MIN, f64::NAN,
        ];
        for id in ["frequency", "tune", "division", "shape"] {
            let descriptor = store.descriptor(id).unwrap().clone();
            for input in inputs {
                let stored = store.set(id, input).unwrap().as_f64().unwrap() as f32;
                assert!(stored >= descriptor.min && stored <= descriptor.max, "{} -> {}", input, stored);
                if descriptor.step > 0.0 {
                    let steps = (stored - descriptor.min) / descriptor.step;
                    assert!((steps - steps.round()).abs() < 1e-4, "{} not on step grid", stored);
                }
            }
        }
    }

    #[test]
    fn test_bool_enum_and_text() {
        let store = test_store();
        assert_eq!(store.set("bypass", true).unwrap(), ParameterValue::Bool(true));
        assert_eq!(store.set("bypass", 0.2).unwrap(), ParameterValue::Bool(false));
        assert_eq!(store.set("shape", "square").unwrap(), ParameterValue::Number(2.0));
        assert_eq!(store.set("shape", 7.0).unwrap(), ParameterValue::Number(2.0));
        assert!(matches!(
            store.set("shape", "sawtooth"),
            Err(ParameterError::OutOfRange { .. })
        ));
        assert_eq!(store.set("label", "deep").unwrap(), ParameterValue::Text("deep".to_string()));
        assert!(matches!(store.set("label", 1.0), Err(ParameterError::InvalidType { .. })));
        assert!(matches!(store.set("frequency", "loud"), Err(ParameterError::InvalidType { .. })));
    }

    #[test]
    fn test_unknown_parameter() {
        let store = test_store();
        assert_eq!(store.get("nonexistent"), Err(ParameterError::unknown("nonexistent")));
        assert!(store.set("nonexistent", 1.0).is_err());
    }

    #[test]
    fn test_change_flags() {
        let store = test_store();
        let index = store.layout().index_of("frequency").unwrap();
        // fresh stores report every slot as changed once
        assert!(store.take_changed(index));
        assert!(!store.take_changed(index));

        store.set("frequency", 100.0).unwrap();
        assert!(store.take_changed(index));
        assert!(!store.take_changed(index));

        store.write_scalar(index, 1.0e6);
        assert!(store.take_changed(index));
        assert_eq!(store.value(index), 20000.0);
    }

    #[test]
    fn test_snapshot_round_trip_ignores_unknown() {
        let store = test_store();
        store.set("frequency", 250.0).unwrap();
        store.set("label", "bright").unwrap();
        let mut snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 6);

        snapshot.insert("renamed_in_v2".to_string(), ParameterValue::Number(3.0));
        let other = test_store();
        assert_eq!(other.apply_snapshot(&snapshot), 6);
        assert_eq!(other.snapshot(), store.snapshot());
    }

    #[test]
    fn test_reset_to_defaults() {
        let store = test_store();
        store.set("frequency", 250.0).unwrap();
        store.set("label", "bright").unwrap();
        store.reset_to_defaults();
        assert_eq!(store.get("frequency").unwrap(), ParameterValue::Number(440.0));
        assert_eq!(store.get("label").unwrap(), ParameterValue::Text("log drum".to_string()));
    }
}
