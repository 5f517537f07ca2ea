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

use std::sync::{Arc, OnceLock};

use crate::errors::{UnitError, UnitResult};
use crate::parameters::{ParameterDescriptor, ParameterLayout, ParameterStore};
use crate::plugin::api::{check_initialize_args, PluginMetadata, PluginUnit};
use crate::preset::Preset;
use crate::processing::{AudioBuffer, MidiEvent, RenderContext, MAX_CHANNELS};
use crate::units::biquad::{BiquadCoefficients, BiquadFilter, FilterKind};
use crate::units::UnitState;

pub const BAND_COUNT: usize = 5;

const PARAMS_PER_BAND: usize = 3;
const OUTPUT_GAIN: usize = BAND_COUNT * PARAMS_PER_BAND;
const BYPASS: usize = OUTPUT_GAIN + 1;

const BAND_KINDS: [FilterKind; BAND_COUNT] = [
    FilterKind::LowShelf,
    FilterKind::Peaking,
    FilterKind::Peaking,
    FilterKind::Peaking,
    FilterKind::HighShelf,
];

/// 5バンドEQのパラメーターレイアウト（全インスタンス共有）
pub fn equalizer_layout() -> Arc<ParameterLayout> {
    static LAYOUT: OnceLock<Arc<ParameterLayout>> = OnceLock::new();
    LAYOUT
        .get_or_init(|| {
            // (prefix, name, min freq, max freq, default freq, default q)
            let bands = [
                ("low", "Low", 20.0, 500.0, 80.0, 0.707),
                ("mid1", "Mid 1", 40.0, 2000.0, 250.0, 1.0),
                ("mid2", "Mid 2", 200.0, 8000.0, 1000.0, 1.0),
                ("mid3", "Mid 3", 1000.0, 16000.0, 4000.0, 1.0),
                ("high", "High", 2000.0, 20000.0, 8000.0, 0.707),
            ];
            let mut descriptors = Vec::with_capacity(BYPASS + 1);
            for (prefix, name, min_freq, max_freq, freq, q) in bands {
                descriptors.push(
                    ParameterDescriptor::float(&format!("{}_freq", prefix), &format!("{} Frequency", name), min_freq, max_freq, freq)
                        .with_unit("Hz")
                        .in_group(prefix),
                );
                descriptors.push(
                    ParameterDescriptor::float(&format!("{}_gain", prefix), &format!("{} Gain", name), -24.0, 24.0, 0.0)
                        .with_unit("dB")
                        .in_group(prefix),
                );
                descriptors.push(
                    ParameterDescriptor::float(&format!("{}_q", prefix), &format!("{} Q", name), 0.1, 10.0, q)
                        .in_group(prefix),
                );
            }
            descriptors.push(
                ParameterDescriptor::float("output_gain", "Output Gain", -24.0, 24.0, 0.0)
                    .with_unit("dB")
                    .in_group("output"),
            );
            descriptors.push(ParameterDescriptor::toggle("bypass", "Bypass", false).in_group("output"));
            Arc::new(ParameterLayout::new(descriptors))
        })
        .clone()
}

fn equalizer_presets() -> Vec<Preset> {
    vec![
        Preset::from_values(
            "Flat",
            &[
                ("low_gain", 0.0),
                ("mid1_gain", 0.0),
                ("mid2_gain", 0.0),
                ("mid3_gain", 0.0),
                ("high_gain", 0.0),
                ("output_gain", 0.0),
                ("bypass", 0.0),
            ],
        ),
        Preset::from_values(
            "log-drum boost",
            &[
                ("low_freq", 60.0),
                ("low_gain", 4.0),
                ("low_q", 0.707),
                ("mid1_freq", 120.0),
                ("mid1_gain", 2.0),
                ("mid1_q", 1.0),
                ("mid2_freq", 800.0),
                ("mid2_gain", -1.5),
                ("mid2_q", 1.2),
                ("mid3_freq", 3000.0),
                ("mid3_gain", 1.0),
                ("mid3_q", 1.0),
                ("high_freq", 8000.0),
                ("high_gain", 1.5),
                ("high_q", 0.707),
                ("output_gain", 0.0),
                ("bypass", 0.0),
            ],
        )
        .with_cultural_context("amapiano")
        .with_tags(&["log drum", "bass"]),
        Preset::from_values(
            "Vocal presence",
            &[
                ("low_freq", 100.0),
                ("low_gain", -2.0),
                ("mid1_freq", 300.0),
                ("mid1_gain", -1.5),
                ("mid1_q", 1.4),
                ("mid3_freq", 3500.0),
                ("mid3_gain", 3.0),
                ("mid3_q", 1.2),
                ("high_freq", 10000.0),
                ("high_gain", 2.0),
            ],
        )
        .with_tags(&["vocal"]),
        Preset::from_values(
            "Sub tamer",
            &[
                ("low_freq", 40.0),
                ("low_gain", -6.0),
                ("low_q", 0.707),
                ("mid1_freq", 80.0),
                ("mid1_gain", -2.0),
                ("mid1_q", 2.0),
            ],
        )
        .with_tags(&["bass", "cleanup"]),
    ]
}

/// 5バンド・パラメトリックEQ
///
/// Low shelf, three peaking bands and a high shelf in series, followed by an output
/// trim. Coefficients are rebuilt at block start only for bands whose parameters
/// changed.
pub struct EqualizerUnit {
    metadata: PluginMetadata,
    parameters: Arc<ParameterStore>,
    presets: Vec<Preset>,
    bands: [BiquadFilter; BAND_COUNT],
    output_gain: f64,
    sample_rate: f32,
    max_block_size: usize,
    state: UnitState,
}

impl EqualizerUnit {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            parameters: Arc::new(ParameterStore::new(equalizer_layout())),
            presets: equalizer_presets(),
            bands: BAND_KINDS.map(BiquadFilter::new),
            output_gain: 1.0,
            sample_rate: 44100.0,
            max_block_size: 0,
            state: UnitState::Created,
        }
    }

    /// Current coefficient set of one band.
    pub fn band_coefficients(&self, band: usize) -> Option<&BiquadCoefficients> {
        self.bands.get(band).map(|filter| filter.coefficients())
    }

    fn refresh_coefficients(&mut self) {
        let store = &self.parameters;
        let sample_rate = self.sample_rate as f64;
        for (band, filter) in self.bands.iter_mut().enumerate() {
            let base = band * PARAMS_PER_BAND;
            // consume every flag of the band, no short-circuit
            let changed = [base, base + 1, base + 2].map(|index| store.take_changed(index));
            if changed.contains(&true) {
                filter.configure(
                    store.value(base) as f64,
                    store.value(base + 1) as f64,
                    store.value(base + 2) as f64,
                    sample_rate,
                );
            }
        }
        if store.take_changed(OUTPUT_GAIN) {
            self.output_gain = 10f64.powf(store.value(OUTPUT_GAIN) as f64 / 20.0);
        }
    }
}

impl PluginUnit for EqualizerUnit {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn parameters(&self) -> &Arc<ParameterStore> {
        &self.parameters
    }

    fn initialize(&mut self, sample_rate: f32, max_block_size: usize) -> UnitResult<()> {
        check_initialize_args(sample_rate, max_block_size)?;
        if self.state == UnitState::Disposed {
            return Err(UnitError::Disposed);
        }
        self.sample_rate = sample_rate;
        self.max_block_size = max_block_size;
        // first block designs every band for the new rate
        self.parameters.mark_all_changed();
        self.bands.iter_mut().for_each(BiquadFilter::reset);
        self.state = UnitState::Ready;
        Ok(())
    }

    fn process(
        &mut self,
        input: &AudioBuffer,
        output: &mut AudioBuffer,
        _context: &RenderContext,
        _midi: &[MidiEvent],
    ) -> UnitResult<()> {
        self.state.check_ready()?;
        let frames = output.len();
        if frames > self.max_block_size {
            return Err(UnitError::BlockTooLarge {
                found: frames,
                max: self.max_block_size,
            });
        }

        if self.parameters.flag(BYPASS) {
            output.copy_from(input);
            return Ok(());
        }

        self.refresh_coefficients();

        let gain = self.output_gain;
        for channel in 0..output.channels() {
            if channel >= MAX_CHANNELS || input.channels() == 0 {
                output.channel_mut(channel).fill(0.0);
                continue;
            }
            let source = input.channel(channel.min(input.channels() - 1));
            let target = output.channel_mut(channel);
            for (i, sample) in target.iter_mut().enumerate() {
                let mut y = source.get(i).copied().unwrap_or(0.0) as f64;
                for band in self.bands.iter_mut() {
                    y = band.process(channel, y);
                }
                *sample = (y * gain) as f32;
            }
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.bands.iter_mut().for_each(BiquadFilter::reset);
        self.state = UnitState::Disposed;
    }

    fn reset(&mut self) {
        self.bands.iter_mut().for_each(BiquadFilter::reset);
    }

    fn factory_presets(&self) -> &[Preset] {
        &self.presets
    }
}
