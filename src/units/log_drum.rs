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

//! Polyphonic log drum synthesizer
//!
//! A fixed pool of percussive voices. Each voice runs a linear ADSR, a decaying pitch
//! sweep and a three-partial sine oscillator with a noise click on the attack.
//! MIDI events are applied at their block-relative sample offset.

use std::f64::consts::TAU;
use std::sync::{Arc, OnceLock};

use crate::errors::{UnitError, UnitResult};
use crate::parameters::{ParameterDescriptor, ParameterLayout, ParameterStore};
use crate::plugin::api::{check_initialize_args, PluginMetadata, PluginUnit};
use crate::preset::Preset;
use crate::processing::{AudioBuffer, MidiEvent, MidiEventKind, RenderContext};
use crate::units::UnitState;

pub const DEFAULT_POLYPHONY: usize = 8;

const ATTACK: usize = 0;
const DECAY: usize = 1;
const SUSTAIN: usize = 2;
const RELEASE: usize = 3;
const TONE: usize = 4;
const CLICK: usize = 5;
const RESONANCE: usize = 6;
const PITCH_DROP: usize = 7;
const VOLUME: usize = 8;
const TUNE: usize = 9;

/// Parameters a program change writes.
const TIMBRE: [usize; 5] = [TONE, CLICK, RESONANCE, PITCH_DROP, DECAY];

/// Click burst decay rate (1/s).
const CLICK_DECAY: f64 = 200.0;
const VIBRATO_HZ: f64 = 5.5;
const VIBRATO_MAX_SEMITONES: f64 = 0.5;
const BEND_RANGE_SEMITONES: f64 = 2.0;

const CC_MOD_WHEEL: u8 = 1;
const CC_ALL_SOUND_OFF: u8 = 120;
const CC_ALL_NOTES_OFF: u8 = 123;

/// Largest f32 strictly below 1.0.
const OUTPUT_LIMIT: f32 = 1.0 - f32::EPSILON / 2.0;

/// ログドラムのパラメーターレイアウト（全インスタンス共有）
pub fn log_drum_layout() -> Arc<ParameterLayout> {
    static LAYOUT: OnceLock<Arc<ParameterLayout>> = OnceLock::new();
    LAYOUT
        .get_or_init(|| {
            Arc::new(ParameterLayout::new(vec![
                ParameterDescriptor::float("attack", "Attack", 0.001, 2.0, 0.002)
                    .with_unit("s")
                    .in_group("envelope"),
                ParameterDescriptor::float("decay", "Decay", 0.01, 4.0, 0.6)
                    .with_unit("s")
                    .in_group("envelope"),
                ParameterDescriptor::float("sustain", "Sustain", 0.0, 1.0, 0.0).in_group("envelope"),
                ParameterDescriptor::float("release", "Release", 0.01, 4.0, 0.3)
                    .with_unit("s")
                    .in_group("envelope"),
                ParameterDescriptor::float("tone", "Tone", 0.0, 1.0, 0.35).in_group("timbre"),
                ParameterDescriptor::float("click", "Click", 0.0, 1.0, 0.2).in_group("timbre"),
                ParameterDescriptor::float("resonance", "Resonance", 0.0, 0.95, 0.4).in_group("timbre"),
                ParameterDescriptor::float("pitch_drop", "Pitch Drop", 0.0, 24.0, 12.0)
                    .with_unit("st")
                    .in_group("timbre"),
                ParameterDescriptor::float("volume", "Volume", -60.0, 6.0, -6.0)
                    .with_unit("dB")
                    .in_group("output"),
                ParameterDescriptor::int("tune", "Tune", -24, 24, 0)
                    .with_unit("st")
                    .in_group("output"),
            ]))
        })
        .clone()
}

fn log_drum_presets() -> Vec<Preset> {
    vec![
        Preset::from_values(
            "Classic log drum",
            &[("tone", 0.35), ("click", 0.2), ("resonance", 0.4), ("pitch_drop", 12.0), ("decay", 0.6)],
        )
        .with_cultural_context("amapiano"),
        Preset::from_values(
            "Deep sub",
            &[("tone", 0.1), ("click", 0.05), ("resonance", 0.7), ("pitch_drop", 5.0), ("decay", 1.4)],
        )
        .with_cultural_context("amapiano"),
        Preset::from_values(
            "Bright pluck",
            &[("tone", 0.8), ("click", 0.5), ("resonance", 0.2), ("pitch_drop", 19.0), ("decay", 0.25)],
        ),
        Preset::from_values(
            "Bouncy",
            &[("tone", 0.5), ("click", 0.3), ("resonance", 0.55), ("pitch_drop", 9.0), ("decay", 0.45)],
        )
        .with_cultural_context("amapiano"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnvelopeStage {
    Idle,    // 待機状態
    Attack,  // アタック段階
    Decay,   // ディケイ段階
    Sustain, // サステイン段階
    Release, // リリース段階
}

/// Per-block parameter values, read once at block start.
#[derive(Debug, Clone, Copy)]
struct BlockParams {
    attack_step: f64,
    decay_step: f64,
    sustain: f64,
    release_seconds: f64,
    tone: f64,
    click: f64,
    resonance: f64,
    pitch_drop: f64,
    tune: f64,
    volume: f64,
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    note: u8,
    gain: f64,
    /// Sample clock at trigger.
    start_time: u64,
    gate: bool,
    phase: f64,
    stage: EnvelopeStage,
    level: f64,
    release_step: f64,
    /// Seconds since trigger.
    age: f64,
    noise_state: u32,
}

impl Voice {
    fn new(index: usize) -> Self {
        Self {
            note: 0,
            gain: 0.0,
            start_time: 0,
            gate: false,
            phase: 0.0,
            stage: EnvelopeStage::Idle,
            level: 0.0,
            release_step: 0.0,
            age: 0.0,
            noise_state: 0x9E37_79B9 ^ (index as u32 + 1),
        }
    }

    #[inline]
    fn is_idle(&self) -> bool {
        self.stage == EnvelopeStage::Idle
    }

    /// Soft retrigger: the envelope climbs from its current level.
    fn trigger(&mut self, note: u8, velocity: u8, start_time: u64) {
        self.note = note;
        self.gain = (velocity.min(127) as f64 / 127.0).powf(1.5);
        self.start_time = start_time;
        self.gate = true;
        self.phase = 0.0;
        self.age = 0.0;
        self.stage = EnvelopeStage::Attack;
    }

    fn release(&mut self, release_seconds: f64, sample_rate: f64) {
        self.gate = false;
        if self.level <= 0.0 {
            self.silence();
            return;
        }
        self.release_step = self.level / (release_seconds * sample_rate).max(1.0);
        self.stage = EnvelopeStage::Release;
    }

    fn silence(&mut self) {
        self.gate = false;
        self.level = 0.0;
        self.stage = EnvelopeStage::Idle;
    }

    #[inline]
    fn advance_envelope(&mut self, p: &BlockParams) -> f64 {
        match self.stage {
            EnvelopeStage::Idle => {}
            EnvelopeStage::Attack => {
                self.level += p.attack_step;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                self.level -= p.decay_step;
                if self.level <= p.sustain {
                    self.level = p.sustain;
                    self.stage = EnvelopeStage::Sustain;
                }
            }
            EnvelopeStage::Sustain => {
                self.level = p.sustain;
            }
            EnvelopeStage::Release => {
                self.level -= self.release_step;
                if self.level <= 0.0 {
                    self.silence();
                }
            }
        }
        self.level
    }

    #[inline]
    fn render(&mut self, p: &BlockParams, modulation: f64, inv_sample_rate: f64) -> f64 {
        let envelope = self.advance_envelope(p);
        let t = self.age;

        let pitch_envelope = (-t * 50.0 * (1.0 - p.resonance)).exp();
        let semitones = self.note as f64 - 69.0 + p.tune + p.pitch_drop * pitch_envelope + modulation;
        let frequency = 440.0 * (semitones / 12.0).exp2();

        let phi = self.phase;
        let oscillator = phi.sin() + p.tone * (0.5 * (2.0 * phi).sin() + 0.25 * (3.0 * phi).sin());
        let click = p.click * xorshift32(&mut self.noise_state) * (-t * CLICK_DECAY).exp();

        self.phase = (phi + TAU * frequency * inv_sample_rate).rem_euclid(TAU);
        self.age += inv_sample_rate;

        (oscillator + click) * envelope * (1.0 + p.resonance * 0.5) * self.gain
    }
}

/// Simple xorshift32 PRNG for the click noise, in [-1, 1].
#[inline]
fn xorshift32(state: &mut u32) -> f64 {
    let mut x = *state;
    if x == 0 {
        x = 1;
    }
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    (x as f64 / u32::MAX as f64) * 2.0 - 1.0
}

#[inline]
fn db_to_linear(db: f64) -> f64 {
    if db <= -60.0 {
        0.0
    } else {
        10f64.powf(db / 20.0)
    }
}

/// ポリフォニック・ログドラム
pub struct LogDrumUnit {
    metadata: PluginMetadata,
    parameters: Arc<ParameterStore>,
    presets: Vec<Preset>,
    /// Timbre values per program, in `TIMBRE` order.
    programs: Vec<[f32; 5]>,
    active_program: Option<usize>,
    voices: Vec<Voice>,
    block: BlockParams,
    sample_clock: u64,
    bend_semitones: f64,
    mod_depth: f64,
    lfo_phase: f64,
    sample_rate: f64,
    max_block_size: usize,
    state: UnitState,
}

impl LogDrumUnit {
    pub fn new(metadata: PluginMetadata) -> Self {
        let polyphony = metadata.max_polyphony.unwrap_or(DEFAULT_POLYPHONY).max(1);
        let layout = log_drum_layout();
        let presets = log_drum_presets();
        let programs = presets
            .iter()
            .map(|preset| {
                TIMBRE.map(|index| {
                    let descriptor = &layout.descriptors()[index];
                    preset
                        .parameter(&descriptor.id)
                        .and_then(|value| value.as_f64())
                        .map_or(descriptor.default, |value| descriptor.clamp_number(value))
                })
            })
            .collect();

        let mut unit = Self {
            metadata,
            parameters: Arc::new(ParameterStore::new(layout)),
            presets,
            programs,
            active_program: None,
            voices: (0..polyphony).map(Voice::new).collect(),
            block: BlockParams {
                attack_step: 0.0,
                decay_step: 0.0,
                sustain: 0.0,
                release_seconds: 0.0,
                tone: 0.0,
                click: 0.0,
                resonance: 0.0,
                pitch_drop: 0.0,
                tune: 0.0,
                volume: 0.0,
            },
            sample_clock: 0,
            bend_semitones: 0.0,
            mod_depth: 0.0,
            lfo_phase: 0.0,
            sample_rate: 44100.0,
            max_block_size: 0,
            state: UnitState::Created,
        };
        unit.load_block_params();
        unit
    }

    pub fn polyphony(&self) -> usize {
        self.voices.len()
    }

    /// Voices that are not idle (gated or releasing).
    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|voice| !voice.is_idle()).count()
    }

    /// Note numbers of every non-idle voice, in pool order.
    pub fn sounding_notes(&self) -> impl Iterator<Item = u8> + '_ {
        self.voices.iter().filter(|voice| !voice.is_idle()).map(|voice| voice.note)
    }

    pub fn active_program(&self) -> Option<usize> {
        self.active_program
    }

    fn load_block_params(&mut self) {
        let store = &self.parameters;
        let fs = self.sample_rate;
        let sustain = store.value(SUSTAIN) as f64;
        let decay = store.value(DECAY) as f64;
        self.block = BlockParams {
            attack_step: 1.0 / (store.value(ATTACK) as f64 * fs).max(1.0),
            decay_step: (1.0 - sustain) / (decay * fs).max(1.0),
            sustain,
            release_seconds: store.value(RELEASE) as f64,
            tone: store.value(TONE) as f64,
            click: store.value(CLICK) as f64,
            resonance: store.value(RESONANCE) as f64,
            pitch_drop: store.value(PITCH_DROP) as f64,
            tune: store.value(TUNE) as f64,
            volume: db_to_linear(store.value(VOLUME) as f64),
        };
    }

    fn note_on(&mut self, note: u8, velocity: u8) {
        let now = self.sample_clock;
        // 1. retrigger the voice already playing this note
        // 2. first idle voice
        // 3. steal the oldest
        let index = self
            .voices
            .iter()
            .position(|voice| !voice.is_idle() && voice.note == note)
            .or_else(|| self.voices.iter().position(Voice::is_idle))
            .or_else(|| {
                self.voices
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, voice)| voice.start_time)
                    .map(|(index, _)| index)
            });
        if let Some(index) = index {
            self.voices[index].trigger(note, velocity, now);
        }
    }

    fn note_off(&mut self, note: u8) {
        let release = self.block.release_seconds;
        let fs = self.sample_rate;
        for voice in self.voices.iter_mut().filter(|voice| voice.gate && voice.note == note) {
            voice.release(release, fs);
        }
    }

    fn handle_event(&mut self, event: &MidiEvent) {
        match event.kind {
            MidiEventKind::NoteOn => {
                let Some(note) = event.note else { return };
                match event.velocity.unwrap_or(100) {
                    0 => self.note_off(note),
                    velocity => self.note_on(note.min(127), velocity),
                }
            }
            MidiEventKind::NoteOff => {
                if let Some(note) = event.note {
                    self.note_off(note);
                }
            }
            MidiEventKind::PitchBend => {
                let value = event.value.unwrap_or(8192).min(16383) as f64;
                self.bend_semitones = (value - 8192.0) / 8192.0 * BEND_RANGE_SEMITONES;
            }
            MidiEventKind::Cc => {
                let value = event.value.unwrap_or(0).min(127);
                match event.controller {
                    Some(CC_MOD_WHEEL) => self.mod_depth = value as f64 / 127.0,
                    Some(CC_ALL_SOUND_OFF) => self.voices.iter_mut().for_each(Voice::silence),
                    Some(CC_ALL_NOTES_OFF) => {
                        let release = self.block.release_seconds;
                        let fs = self.sample_rate;
                        for voice in self.voices.iter_mut().filter(|voice| voice.gate) {
                            voice.release(release, fs);
                        }
                    }
                    _ => {}
                }
            }
            MidiEventKind::ProgramChange => {
                // the program's timbre lands in the store, so reads and presets see it
                // and a later edit of any timbre parameter replaces it
                let program = event.value.unwrap_or(0) as usize;
                if let Some(values) = self.programs.get(program).copied() {
                    self.active_program = Some(program);
                    for (&index, value) in TIMBRE.iter().zip(values) {
                        self.parameters.write_scalar(index, value);
                    }
                    self.load_block_params();
                }
            }
        }
    }

    fn render_segment(&mut self, out: &mut [f32], start: usize, end: usize) {
        let inv_fs = 1.0 / self.sample_rate;
        let params = self.block;
        for sample in &mut out[start..end] {
            let vibrato = self.mod_depth * VIBRATO_MAX_SEMITONES * (TAU * self.lfo_phase).sin();
            let modulation = self.bend_semitones + vibrato;

            let mut sum = 0.0;
            for voice in self.voices.iter_mut() {
                if !voice.is_idle() {
                    sum += voice.render(&params, modulation, inv_fs);
                }
            }

            self.lfo_phase = (self.lfo_phase + VIBRATO_HZ * inv_fs).fract();
            self.sample_clock += 1;
            *sample = ((sum * params.volume).tanh() as f32).clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT);
        }
    }
}

impl PluginUnit for LogDrumUnit {
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
        self.sample_rate = sample_rate as f64;
        self.max_block_size = max_block_size;
        self.load_block_params();
        self.state = UnitState::Ready;
        Ok(())
    }

    fn process(
        &mut self,
        _input: &AudioBuffer,
        output: &mut AudioBuffer,
        _context: &RenderContext,
        midi: &[MidiEvent],
    ) -> UnitResult<()> {
        self.state.check_ready()?;
        let frames = output.len();
        if frames > self.max_block_size {
            return Err(UnitError::BlockTooLarge {
                found: frames,
                max: self.max_block_size,
            });
        }
        if output.channels() == 0 {
            return Ok(());
        }

        self.load_block_params();

        let mut cursor = 0;
        for event in midi {
            let at = (event.timestamp as usize).min(frames);
            if at > cursor {
                self.render_segment(output.channel_mut(0), cursor, at);
                cursor = at;
            }
            self.handle_event(event);
        }
        if cursor < frames {
            self.render_segment(output.channel_mut(0), cursor, frames);
        }

        for channel in 1..output.channels() {
            output.copy_channel(0, channel);
        }
        Ok(())
    }

    fn dispose(&mut self) {
        self.voices.iter_mut().for_each(Voice::silence);
        self.state = UnitState::Disposed;
    }

    fn reset(&mut self) {
        self.voices.iter_mut().for_each(Voice::silence);
        self.bend_semitones = 0.0;
        self.mod_depth = 0.0;
        self.lfo_phase = 0.0;
    }

    fn factory_presets(&self) -> &[Preset] {
        &self.presets
    }
}
