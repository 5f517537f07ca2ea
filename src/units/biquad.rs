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

use std::f64::consts::PI;

use serde::Serialize;

use crate::processing::MAX_CHANNELS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    LowShelf,
    Peaking,
    HighShelf,
}

/// Normalized biquad coefficients (a0 = 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefficients {
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// Audio EQ Cookbook design.
    ///
    /// Frequency is clamped to `[1 Hz, 0.49·fs]` and Q to at least 0.01. Below about
    /// 2 Hz sample rate the band sits at `0.49·fs`.
    pub fn design(kind: FilterKind, frequency: f64, gain_db: f64, q: f64, sample_rate: f64) -> Self {
        let upper = 0.49 * sample_rate;
        let frequency = frequency.clamp(upper.min(1.0), upper);
        let q = q.max(0.01);

        let a = 10f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * frequency / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();

        let (b0, b1, b2, a0, a1, a2) = match kind {
            FilterKind::Peaking => {
                let alpha = sin_omega / (2.0 * q);
                (
                    1.0 + alpha * a,
                    -2.0 * cos_omega,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos_omega,
                    1.0 - alpha / a,
                )
            }
            FilterKind::LowShelf => {
                let beta = a.sqrt() / q;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_omega + beta * sin_omega),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega),
                    a * ((a + 1.0) - (a - 1.0) * cos_omega - beta * sin_omega),
                    (a + 1.0) + (a - 1.0) * cos_omega + beta * sin_omega,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega),
                    (a + 1.0) + (a - 1.0) * cos_omega - beta * sin_omega,
                )
            }
            FilterKind::HighShelf => {
                let beta = a.sqrt() / q;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_omega + beta * sin_omega),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega),
                    a * ((a + 1.0) + (a - 1.0) * cos_omega - beta * sin_omega),
                    (a + 1.0) - (a - 1.0) * cos_omega + beta * sin_omega,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_omega),
                    (a + 1.0) - (a - 1.0) * cos_omega - beta * sin_omega,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Linear magnitude response at `frequency`.
    pub fn magnitude_at(&self, frequency: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * frequency / sample_rate;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }
}

/// Direct Form I delay line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiquadHistory {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl BiquadHistory {
    #[inline]
    pub fn process(&mut self, c: &BiquadCoefficients, input: f64) -> f64 {
        // y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
        let output = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;

        output
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One EQ band: design settings, coefficients and per-channel history.
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    kind: FilterKind,
    frequency: f64,
    gain_db: f64,
    q: f64,
    coefficients: BiquadCoefficients,
    history: [BiquadHistory; MAX_CHANNELS],
}

impl BiquadFilter {
    pub fn new(kind: FilterKind) -> Self {
        Self {
            kind,
            frequency: 1000.0,
            gain_db: 0.0,
            q: std::f64::consts::FRAC_1_SQRT_2,
            coefficients: BiquadCoefficients::IDENTITY,
            history: [BiquadHistory::default(); MAX_CHANNELS],
        }
    }

    pub fn coefficients(&self) -> &BiquadCoefficients {
        &self.coefficients
    }

    /// Redesign the coefficient set. History is kept.
    pub fn configure(&mut self, frequency: f64, gain_db: f64, q: f64, sample_rate: f64) {
        self.frequency = frequency;
        self.gain_db = gain_db;
        self.q = q;
        self.coefficients = BiquadCoefficients::design(self.kind, frequency, gain_db, q, sample_rate);
    }

    #[inline]
    pub fn process(&mut self, channel: usize, input: f64) -> f64 {
        self.history[channel].process(&self.coefficients, input)
    }

    pub fn reset(&mut self) {
        for history in self.history.iter_mut() {
            history.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 44100.0;

    fn db(linear: f64) -> f64 {
        20.0 * linear.log10()
    }

    #[test]
    fn test_zero_gain_is_identity() {
        let frequencies = [20.0, 60.0, 800.0, 5000.0, 20000.0, 0.49 * FS];
        let qs = [0.01, 0.1, 0.707, 1.2, 4.0, 10.0];
        for kind in [FilterKind::LowShelf, FilterKind::Peaking, FilterKind::HighShelf] {
            for frequency in frequencies {
                for q in qs {
                    let c = BiquadCoefficients::design(kind, frequency, 0.0, q, FS);
                    let label = format!("{:?} f={} q={}", kind, frequency, q);
                    assert!((c.b0 - 1.0).abs() < 1e-9, "{}", label);
                    assert!((c.b1 - c.a1).abs() < 1e-9, "{}", label);
                    assert!((c.b2 - c.a2).abs() < 1e-9, "{}", label);

                    let mut history = BiquadHistory::default();
                    for n in 0..256 {
                        let x = (n as f64 * 0.37).sin();
                        assert!((history.process(&c, x) - x).abs() < 1e-9, "{}", label);
                    }
                }
            }
        }
    }

    #[test]
    fn test_tiny_sample_rate_designs_finite_filter() {
        for sample_rate in [2.0, 1.0, 0.5, 1e-3] {
            for kind in [FilterKind::LowShelf, FilterKind::Peaking, FilterKind::HighShelf] {
                let c = BiquadCoefficients::design(kind, 1000.0, 6.0, 1.0, sample_rate);
                assert!(
                    [c.b0, c.b1, c.b2, c.a1, c.a2].iter().all(|v| v.is_finite()),
                    "{:?} fs={}",
                    kind,
                    sample_rate
                );
            }
        }
    }

    #[test]
    fn test_peaking_gain_at_center() {
        let c = BiquadCoefficients::design(FilterKind::Peaking, 1000.0, 6.0, 1.0, FS);
        assert!((db(c.magnitude_at(1000.0, FS)) - 6.0).abs() < 1e-6);
        // far from the band the response is flat
        assert!(db(c.magnitude_at(20.0, FS)).abs() < 0.05);
    }

    #[test]
    fn test_shelf_asymptotes() {
        let low = BiquadCoefficients::design(FilterKind::LowShelf, 100.0, 4.0, 0.707, FS);
        assert!((db(low.magnitude_at(0.0, FS)) - 4.0).abs() < 1e-6);
        assert!(db(low.magnitude_at(15000.0, FS)).abs() < 0.01);

        let high = BiquadCoefficients::design(FilterKind::HighShelf, 8000.0, -3.0, 0.707, FS);
        assert!((db(high.magnitude_at(FS / 2.0, FS)) + 3.0).abs() < 1e-6);
        assert!(db(high.magnitude_at(50.0, FS)).abs() < 0.01);
    }

    #[test]
    fn test_frequency_and_q_clamped() {
        let clamped = BiquadCoefficients::design(FilterKind::Peaking, 40000.0, 3.0, 0.0, FS);
        let reference = BiquadCoefficients::design(FilterKind::Peaking, 0.49 * FS, 3.0, 0.01, FS);
        assert_eq!(clamped, reference);
        assert!(clamped.b0.is_finite() && clamped.a2.is_finite());
    }

    #[test]
    fn test_history_per_channel() {
        let mut filter = BiquadFilter::new(FilterKind::Peaking);
        filter.configure(1000.0, 12.0, 1.0, FS);
        let first = filter.process(0, 1.0);
        // channel 1 starts from clean history
        assert_eq!(filter.process(1, 1.0), first);
        assert_ne!(filter.process(0, 0.0), 0.0);
        filter.reset();
        assert_eq!(filter.process(0, 1.0), first);
    }
}
