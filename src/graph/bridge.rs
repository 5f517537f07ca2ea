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

//! Audio graph bridge
//!
//! Adapts one hosted unit into a render graph node. The bridge owns the unit's
//! input/output buffers and a fixed table of parameter ramps; it reaches the unit
//! through a `Weak` and never blocks on it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::errors::{FaultReason, RenderFault, UnitError};
use crate::parameters::ParameterStore;
use crate::plugin::api::PluginUnit;
use crate::processing::{AudioBuffer, MidiEvent, RenderContext};

/// Unit shared between the host (owner) and its bridge.
pub type SharedUnit = Arc<Mutex<Box<dyn PluginUnit>>>;

/// Concurrent ramps one bridge can run.
pub const MAX_RAMPS: usize = 16;

/// Linear block-rate parameter ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterRamp {
    pub param_index: usize,
    pub target: f32,
    /// Transport time the ramp starts at; `None` starts on the next block.
    pub start_time: Option<f64>,
    pub duration_samples: u32,
    from: f32,
    elapsed: u32,
    running: bool,
}

impl ParameterRamp {
    pub fn new(param_index: usize, target: f32, start_time: Option<f64>, duration_samples: u32) -> Self {
        Self {
            param_index,
            target,
            start_time,
            duration_samples,
            from: 0.0,
            elapsed: 0,
            running: false,
        }
    }

    /// Advance by one block; returns true once the target has been written.
    fn advance(&mut self, parameters: &ParameterStore, context: &RenderContext, frames: usize) -> bool {
        if !self.running {
            let block_end = context.current_time + frames as f64 / context.sample_rate.max(1.0) as f64;
            if self.start_time.is_some_and(|start| start >= block_end) {
                return false;
            }
            self.from = parameters.value(self.param_index);
            self.running = true;
        }

        self.elapsed = self.elapsed.saturating_add(frames as u32);
        if self.elapsed >= self.duration_samples {
            parameters.write_scalar(self.param_index, self.target);
            return true;
        }
        let progress = self.elapsed as f32 / self.duration_samples as f32;
        parameters.write_scalar(self.param_index, self.from + (self.target - self.from) * progress);
        false
    }
}

pub struct AudioGraphBridge {
    plugin_id: Arc<str>,
    unit: Weak<Mutex<Box<dyn PluginUnit>>>,
    parameters: Arc<ParameterStore>,
    input: AudioBuffer,
    output: AudioBuffer,
    ramps: [Option<ParameterRamp>; MAX_RAMPS],
    faulted: bool,
}

impl AudioGraphBridge {
    pub fn new(
        plugin_id: &str,
        unit: &SharedUnit,
        parameters: Arc<ParameterStore>,
        channels: usize,
        max_block_size: usize,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            unit: Arc::downgrade(unit),
            parameters,
            input: AudioBuffer::new(channels, max_block_size),
            output: AudioBuffer::new(channels, max_block_size),
            ramps: [None; MAX_RAMPS],
            faulted: false,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn input_mut(&mut self) -> &mut AudioBuffer {
        &mut self.input
    }

    pub fn output(&self) -> &AudioBuffer {
        &self.output
    }

    pub fn active_ramps(&self) -> usize {
        self.ramps.iter().flatten().count()
    }

    /// Queue a ramp. A ramp on the same parameter is replaced; with no free slot the
    /// target is written at once.
    pub fn schedule_ramp(&mut self, ramp: ParameterRamp) {
        if ramp.duration_samples == 0 {
            self.parameters.write_scalar(ramp.param_index, ramp.target);
            return;
        }
        let slot = self
            .ramps
            .iter()
            .position(|existing| existing.is_some_and(|r| r.param_index == ramp.param_index))
            .or_else(|| self.ramps.iter().position(Option::is_none));
        match slot {
            Some(slot) => self.ramps[slot] = Some(ramp),
            None => self.parameters.write_scalar(ramp.param_index, ramp.target),
        }
    }

    fn advance_ramps(&mut self, context: &RenderContext, frames: usize) {
        for slot in self.ramps.iter_mut() {
            if let Some(ramp) = slot {
                if ramp.advance(&self.parameters, context, frames) {
                    *slot = None;
                }
            }
        }
    }

    /// Render one block of `frames` from the bridge input into its output.
    ///
    /// A contended or already released unit renders silence. An error or panic from
    /// the unit silences the bridge for good and is returned as a fault.
    pub fn process(&mut self, context: &RenderContext, midi: &[MidiEvent], frames: usize) -> Option<RenderFault> {
        self.input.set_len(frames);
        self.output.set_len(frames);
        self.output.clear();
        if self.faulted {
            return None;
        }

        self.advance_ramps(context, frames);

        let unit = self.unit.upgrade()?;
        let mut guard = unit.try_lock()?;

        let input = &self.input;
        let output = &mut self.output;
        let result = catch_unwind(AssertUnwindSafe(|| guard.process(input, output, context, midi)));
        drop(guard);

        let reason = match result {
            Ok(Ok(())) => return None,
            // torn down by the host while this block was in flight
            Ok(Err(UnitError::Disposed)) => {
                self.output.clear();
                return None;
            }
            Ok(Err(error)) => FaultReason::Failed(error),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                FaultReason::Panicked(message)
            }
        };

        self.faulted = true;
        self.output.clear();
        Some(RenderFault {
            plugin_id: self.plugin_id.clone(),
            reason,
            at_time: context.current_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UnitResult;
    use crate::parameters::{ParameterDescriptor, ParameterLayout};
    use crate::plugin::api::{PluginCategory, PluginDescriptor, PluginFormat, PluginMetadata};

    /// Multiplies input by `gain`; panics or fails on demand.
    struct Probe {
        metadata: PluginMetadata,
        parameters: Arc<ParameterStore>,
        fail: bool,
        panic: bool,
    }

    impl PluginUnit for Probe {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        fn parameters(&self) -> &Arc<ParameterStore> {
            &self.parameters
        }

        fn initialize(&mut self, _sample_rate: f32, _max_block_size: usize) -> UnitResult<()> {
            Ok(())
        }

        fn process(
            &mut self,
            input: &AudioBuffer,
            output: &mut AudioBuffer,
            _context: &RenderContext,
            _midi: &[MidiEvent],
        ) -> UnitResult<()> {
            if self.panic {
                panic!("probe exploded");
            }
            if self.fail {
                return Err(UnitError::NotInitialized);
            }
            let gain = self.parameters.value(0);
            for channel in 0..output.channels() {
                let source = input.channel(channel);
                for (out, x) in output.channel_mut(channel).iter_mut().zip(source) {
                    *out = x * gain;
                }
            }
            Ok(())
        }

        fn dispose(&mut self) {}
    }

    fn probe(fail: bool, panic: bool) -> (SharedUnit, Arc<ParameterStore>) {
        let layout = ParameterLayout::new(vec![ParameterDescriptor::float("gain", "Gain", 0.0, 2.0, 1.0)]);
        let parameters = Arc::new(ParameterStore::new(Arc::new(layout)));
        let descriptor = PluginDescriptor::new("probe", "Probe", PluginCategory::Effect, PluginFormat::Interpreted, "p");
        let unit: Box<dyn PluginUnit> = Box::new(Probe {
            metadata: PluginMetadata::from_descriptor(&descriptor, 8),
            parameters: parameters.clone(),
            fail,
            panic,
        });
        (Arc::new(Mutex::new(unit)), parameters)
    }

    fn bridge_for(unit: &SharedUnit, parameters: &Arc<ParameterStore>) -> AudioGraphBridge {
        let mut bridge = AudioGraphBridge::new("probe", unit, parameters.clone(), 1, 64);
        bridge.input_mut().channel_mut(0).fill(0.5);
        bridge
    }

    #[test]
    fn test_process_passes_audio() {
        let (unit, parameters) = probe(false, false);
        let mut bridge = bridge_for(&unit, &parameters);
        let context = RenderContext::new(48000.0, 64);
        assert!(bridge.process(&context, &[], 64).is_none());
        assert!(bridge.output().channel(0).iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_contended_unit_renders_silence() {
        let (unit, parameters) = probe(false, false);
        let mut bridge = bridge_for(&unit, &parameters);
        let context = RenderContext::new(48000.0, 64);
        let _held = unit.lock();
        assert!(bridge.process(&context, &[], 64).is_none());
        assert_eq!(bridge.output().peak(), 0.0);
        assert!(!bridge.is_faulted());
    }

    #[test]
    fn test_released_unit_renders_silence() {
        let (unit, parameters) = probe(false, false);
        let mut bridge = bridge_for(&unit, &parameters);
        drop(unit);
        let context = RenderContext::new(48000.0, 64);
        assert!(bridge.process(&context, &[], 64).is_none());
        assert_eq!(bridge.output().peak(), 0.0);
    }

    #[test]
    fn test_error_becomes_fault() {
        let (unit, parameters) = probe(true, false);
        let mut bridge = bridge_for(&unit, &parameters);
        let context = RenderContext::new(48000.0, 64);
        let fault = bridge.process(&context, &[], 64).unwrap();
        assert_eq!(&*fault.plugin_id, "probe");
        assert!(matches!(fault.reason, FaultReason::Failed(UnitError::NotInitialized)));
        assert!(bridge.is_faulted());
        // reported once, silent afterwards
        assert!(bridge.process(&context, &[], 64).is_none());
    }

    #[test]
    fn test_panic_becomes_fault() {
        let (unit, parameters) = probe(false, true);
        let mut bridge = bridge_for(&unit, &parameters);
        let context = RenderContext::new(48000.0, 64);
        let fault = bridge.process(&context, &[], 64).unwrap();
        match fault.reason {
            FaultReason::Panicked(message) => assert!(message.contains("probe exploded")),
            other => panic!("Expected panic fault, got {:?}", other),
        }
        assert_eq!(bridge.output().peak(), 0.0);
        // the mutex is still usable
        assert!(unit.try_lock().is_some());
    }

    #[test]
    fn test_ramp_is_linear_and_completes() {
        let (unit, parameters) = probe(false, false);
        let mut bridge = bridge_for(&unit, &parameters);
        let mut context = RenderContext::new(48000.0, 64);
        bridge.schedule_ramp(ParameterRamp::new(0, 0.0, None, 256));

        let mut seen = Vec::new();
        for _ in 0..4 {
            bridge.process(&context, &[], 64);
            seen.push(parameters.value(0));
            context.advance(64);
        }
        assert_eq!(seen, vec![0.75, 0.5, 0.25, 0.0]);
        assert_eq!(bridge.active_ramps(), 0);
    }

    #[test]
    fn test_ramp_waits_for_start_time() {
        let (unit, parameters) = probe(false, false);
        let mut bridge = bridge_for(&unit, &parameters);
        let mut context = RenderContext::new(1000.0, 100);
        // starts in the third block (0.2 s .. 0.3 s)
        bridge.schedule_ramp(ParameterRamp::new(0, 2.0, Some(0.25), 100));

        bridge.process(&context, &[], 100);
        context.advance(100);
        bridge.process(&context, &[], 100);
        context.advance(100);
        assert_eq!(parameters.value(0), 1.0);

        bridge.process(&context, &[], 100);
        assert_eq!(parameters.value(0), 2.0);
    }

    #[test]
    fn test_ramp_replaces_same_parameter_and_overflows_to_write() {
        let (unit, parameters) = probe(false, false);
        let mut bridge = bridge_for(&unit, &parameters);
        bridge.schedule_ramp(ParameterRamp::new(0, 0.0, None, 1000));
        bridge.schedule_ramp(ParameterRamp::new(0, 2.0, None, 1000));
        assert_eq!(bridge.active_ramps(), 1);

        bridge.schedule_ramp(ParameterRamp::new(0, 1.5, None, 0));
        assert_eq!(parameters.value(0), 1.5);
    }
}
