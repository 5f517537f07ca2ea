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

use serde::{Deserialize, Serialize};

/// Most channels a host renders; units size per-channel state to this.
pub const MAX_CHANNELS: usize = 8;

/// 拍子
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

/// オーディオ処理のコンテキスト - トランスポート情報を統一
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderContext {
    /// サンプリングレート
    pub sample_rate: f32,
    /// バッファサイズ
    pub buffer_size: usize,
    /// BPM
    pub tempo: f32,
    #[serde(default)]
    pub time_signature: TimeSignature,
    /// トランスポート位置（秒）
    pub current_time: f64,
    pub is_playing: bool,
}

impl RenderContext {
    pub fn new(sample_rate: f32, buffer_size: usize) -> Self {
        Self {
            sample_rate,
            buffer_size,
            tempo: 112.0,
            time_signature: TimeSignature::default(),
            current_time: 0.0,
            is_playing: true,
        }
    }

    /// Advance the transport by one block.
    pub fn advance(&mut self, frames: usize) {
        if self.sample_rate > 0.0 {
            self.current_time += frames as f64 / self.sample_rate as f64;
        }
    }

    /// Duration of one block in seconds.
    pub fn block_duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.buffer_size as f64 / self.sample_rate as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
    Cc,
    PitchBend,
    ProgramChange,
}

/// MIDIライクなイベント
///
/// `timestamp` is a sample offset relative to the start of the block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    #[serde(rename = "type")]
    pub kind: MidiEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u16>,
    #[serde(default)]
    pub timestamp: u32,
}

impl MidiEvent {
    fn empty(kind: MidiEventKind, timestamp: u32) -> Self {
        Self {
            kind,
            note: None,
            velocity: None,
            channel: None,
            controller: None,
            value: None,
            timestamp,
        }
    }

    pub fn note_on(note: u8, velocity: u8, timestamp: u32) -> Self {
        Self {
            note: Some(note),
            velocity: Some(velocity),
            ..Self::empty(MidiEventKind::NoteOn, timestamp)
        }
    }

    pub fn note_off(note: u8, timestamp: u32) -> Self {
        Self {
            note: Some(note),
            velocity: Some(0),
            ..Self::empty(MidiEventKind::NoteOff, timestamp)
        }
    }

    pub fn control_change(controller: u8, value: u8, timestamp: u32) -> Self {
        Self {
            controller: Some(controller),
            value: Some(value as u16),
            ..Self::empty(MidiEventKind::Cc, timestamp)
        }
    }

    /// 14-bit pitch bend, 8192 is centre.
    pub fn pitch_bend(value: u16, timestamp: u32) -> Self {
        Self {
            value: Some(value.min(16383)),
            ..Self::empty(MidiEventKind::PitchBend, timestamp)
        }
    }

    pub fn program_change(program: u8, timestamp: u32) -> Self {
        Self {
            value: Some(program as u16),
            ..Self::empty(MidiEventKind::ProgramChange, timestamp)
        }
    }
}

/// Planar multi-channel sample buffer, allocated once at its maximum size.
///
/// `len` is the active frame count of the current block and never exceeds `capacity`.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    data: Vec<f32>,
    channels: usize,
    capacity: usize,
    len: usize,
}

impl AudioBuffer {
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            data: vec![0.0; channels * capacity],
            channels,
            capacity,
            len: capacity,
        }
    }

    /// Build a buffer holding exactly the given channel slices.
    pub fn from_channels(channels: &[&[f32]]) -> Self {
        let frames = channels.iter().map(|channel| channel.len()).max().unwrap_or(0);
        let mut buffer = Self::new(channels.len(), frames);
        buffer.copy_from_slices(channels);
        buffer
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the active frame count, clamped to capacity.
    pub fn set_len(&mut self, frames: usize) {
        self.len = frames.min(self.capacity);
    }

    pub fn channel(&self, channel: usize) -> &[f32] {
        let start = channel * self.capacity;
        &self.data[start..start + self.len]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        let start = channel * self.capacity;
        &mut self.data[start..start + self.len]
    }

    pub fn clear(&mut self) {
        for channel in 0..self.channels {
            self.channel_mut(channel).fill(0.0);
        }
    }

    /// Add `source` into this buffer channel by channel.
    ///
    /// A mono source is spread over every channel.
    pub fn mix_from(&mut self, source: &AudioBuffer) {
        if source.channels == 0 {
            return;
        }
        for channel in 0..self.channels {
            let from = if source.channels == 1 { 0 } else { channel };
            if from >= source.channels {
                continue;
            }
            let frames = self.len.min(source.len);
            let start_src = from * source.capacity;
            let start_dst = channel * self.capacity;
            for i in 0..frames {
                self.data[start_dst + i] += source.data[start_src + i];
            }
        }
    }

    /// Copy planar slices in; missing channels and frames become silence.
    pub fn copy_from_slices(&mut self, channels: &[&[f32]]) {
        for channel in 0..self.channels {
            let len = self.len;
            let target = self.channel_mut(channel);
            match channels.get(channel) {
                Some(source) => {
                    let frames = len.min(source.len());
                    target[..frames].copy_from_slice(&source[..frames]);
                    target[frames..].fill(0.0);
                }
                None => target.fill(0.0),
            }
        }
    }

    /// Copy this buffer's active frames out into planar slices.
    pub fn copy_to_slices(&self, channels: &mut [&mut [f32]]) {
        for (channel, target) in channels.iter_mut().enumerate() {
            if channel >= self.channels {
                target.fill(0.0);
                continue;
            }
            let source = self.channel(channel);
            let frames = source.len().min(target.len());
            target[..frames].copy_from_slice(&source[..frames]);
            target[frames..].fill(0.0);
        }
    }

    /// Copy active frames from another buffer of any shape.
    pub fn copy_from(&mut self, source: &AudioBuffer) {
        for channel in 0..self.channels {
            let len = self.len;
            let start = channel * self.capacity;
            if channel < source.channels {
                let frames = len.min(source.len);
                let from = channel * source.capacity;
                self.data[start..start + frames].copy_from_slice(&source.data[from..from + frames]);
                self.data[start + frames..start + len].fill(0.0);
            } else {
                self.data[start..start + len].fill(0.0);
            }
        }
    }

    /// Duplicate one channel's active frames onto another.
    pub fn copy_channel(&mut self, from: usize, to: usize) {
        if from == to || from >= self.channels || to >= self.channels {
            return;
        }
        let source = from * self.capacity;
        self.data.copy_within(source..source + self.len, to * self.capacity);
    }

    /// Root-mean-square over all active samples.
    pub fn rms(&self) -> f32 {
        let count = self.channels * self.len;
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = (0..self.channels)
            .flat_map(|channel| self.channel(channel).iter())
            .map(|&sample| (sample as f64) * (sample as f64))
            .sum();
        (sum / count as f64).sqrt() as f32
    }

    pub fn peak(&self) -> f32 {
        (0..self.channels)
            .flat_map(|channel| self.channel(channel).iter())
            .fold(0.0f32, |peak, &sample| peak.max(sample.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_context_json_shape() {
        let json = r#"{
            "sampleRate": 48000,
            "bufferSize": 256,
            "tempo": 113,
            "timeSignature": { "numerator": 4, "denominator": 4 },
            "currentTime": 2.5,
            "isPlaying": true
        }"#;
        let context: RenderContext = serde_json::from_str(json).unwrap();
        assert_eq!(context.sample_rate, 48000.0);
        assert_eq!(context.buffer_size, 256);
        assert_eq!(context.time_signature.numerator, 4);
        assert!(context.is_playing);

        let value = serde_json::to_value(context).unwrap();
        assert!(value.get("currentTime").is_some());
    }

    #[test]
    fn test_midi_event_json_shape() {
        let event: MidiEvent =
            serde_json::from_str(r#"{"type":"note_on","note":48,"velocity":100,"timestamp":12}"#).unwrap();
        assert_eq!(event, MidiEvent::note_on(48, 100, 12));

        let value = serde_json::to_value(MidiEvent::control_change(1, 64, 0)).unwrap();
        assert_eq!(value["type"], "cc");
        assert_eq!(value["controller"], 1);
        assert!(value.get("note").is_none());
    }

    #[test]
    fn test_advance_transport() {
        let mut context = RenderContext::new(48000.0, 480);
        context.advance(480);
        assert!((context.current_time - 0.01).abs() < 1e-12);
        assert!((context.block_duration() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_buffer_len_and_channels() {
        let mut buffer = AudioBuffer::new(2, 8);
        buffer.set_len(4);
        assert_eq!(buffer.channel(1).len(), 4);
        buffer.set_len(100);
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_mix_mono_into_stereo() {
        let mono = AudioBuffer::from_channels(&[&[0.5, 0.25]]);
        let mut stereo = AudioBuffer::new(2, 2);
        stereo.mix_from(&mono);
        stereo.mix_from(&mono);
        assert_eq!(stereo.channel(0), &[1.0, 0.5]);
        assert_eq!(stereo.channel(1), &[1.0, 0.5]);
    }

    #[test]
    fn test_copy_pads_with_silence() {
        let mut buffer = AudioBuffer::new(2, 4);
        buffer.channel_mut(1).fill(9.0);
        buffer.copy_from_slices(&[&[1.0, 2.0]]);
        assert_eq!(buffer.channel(0), &[1.0, 2.0, 0.0, 0.0]);
        assert_eq!(buffer.channel(1), &[0.0; 4]);

        let mut left = [7.0f32; 6];
        let mut right = [7.0f32; 6];
        buffer.copy_to_slices(&mut [&mut left, &mut right]);
        assert_eq!(left, [1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(right, [0.0; 6]);
    }

    #[test]
    fn test_rms_and_peak() {
        let buffer = AudioBuffer::from_channels(&[&[1.0, -1.0, 1.0, -1.0]]);
        assert!((buffer.rms() - 1.0).abs() < 1e-6);
        assert_eq!(buffer.peak(), 1.0);
    }
}
