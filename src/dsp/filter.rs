// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Biquad low-pass / high-pass filter units.

use std::f32::consts::PI;

use crate::buffer::SignalBuffer;
use crate::graph::{
    BlockProcessor, DspDescriptor, ParamDef, ParamKind, ParamValue, ProcessContext, ProcessFault,
};

/// Parameter index: cutoff frequency in Hz.
pub const PARAM_CUTOFF: usize = 0;
/// Parameter index: resonance (Q).
pub const PARAM_RESONANCE: usize = 1;

const MIN_CUTOFF: f32 = 20.0;
const MAX_CUTOFF: f32 = 20000.0;
const DEFAULT_CUTOFF: f32 = 5000.0;
const MIN_RESONANCE: f32 = 0.1;
const MAX_RESONANCE: f32 = 20.0;
const DEFAULT_RESONANCE: f32 = 0.707;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterShape {
    LowPass,
    HighPass,
}

pub fn descriptor(shape: FilterShape) -> DspDescriptor {
    DspDescriptor {
        name: match shape {
            FilterShape::LowPass => "lowpass".into(),
            FilterShape::HighPass => "highpass".into(),
        },
        params: vec![
            ParamDef::new(
                "cutoff",
                ParamKind::Float {
                    min: MIN_CUTOFF,
                    max: MAX_CUTOFF,
                    default: DEFAULT_CUTOFF,
                },
            ),
            ParamDef::new(
                "resonance",
                ParamKind::Float {
                    min: MIN_RESONANCE,
                    max: MAX_RESONANCE,
                    default: DEFAULT_RESONANCE,
                },
            ),
        ],
        output_channels: None,
    }
}

/// Biquad history for one channel.
#[derive(Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

/// RBJ biquad filter, one history per channel, coefficients shared.
pub struct Filter {
    shape: FilterShape,
    sample_rate: f32,
    cutoff: f32,
    resonance: f32,
    a0: f32,
    a1: f32,
    a2: f32,
    b1: f32,
    b2: f32,
    state: Vec<BiquadState>,
}

impl Filter {
    pub fn new(shape: FilterShape, sample_rate: u32) -> Self {
        let mut filter = Self {
            shape,
            sample_rate: sample_rate as f32,
            cutoff: DEFAULT_CUTOFF,
            resonance: DEFAULT_RESONANCE,
            a0: 1.0,
            a1: 0.0,
            a2: 0.0,
            b1: 0.0,
            b2: 0.0,
            state: Vec::new(),
        };
        filter.calculate_coefficients();
        filter
    }

    fn calculate_coefficients(&mut self) {
        let omega = 2.0 * PI * self.cutoff / self.sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * self.resonance);

        let (b0, b1, b2) = match self.shape {
            FilterShape::LowPass => {
                let b0 = (1.0 - cos_omega) / 2.0;
                (b0, 1.0 - cos_omega, b0)
            }
            FilterShape::HighPass => {
                let b0 = (1.0 + cos_omega) / 2.0;
                (b0, -(1.0 + cos_omega), b0)
            }
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        self.a0 = b0 / a0;
        self.a1 = b1 / a0;
        self.a2 = b2 / a0;
        self.b1 = a1 / a0;
        self.b2 = a2 / a0;
    }

    fn ensure_channels(&mut self, channels: usize) {
        if self.state.len() != channels {
            self.state = vec![BiquadState::default(); channels];
        }
    }
}

impl BlockProcessor for Filter {
    fn process(
        &mut self,
        _ctx: &ProcessContext,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
    ) -> Result<(), ProcessFault> {
        let channels = input.channels().min(output.channels());
        self.ensure_channels(channels as usize);
        let frames = input.frames().min(output.frames());

        for ch in 0..channels {
            let state = &mut self.state[ch as usize];
            for frame in 0..frames {
                let x = input.sample(frame, ch);
                let y = self.a0 * x + self.a1 * state.x1 + self.a2 * state.x2
                    - self.b1 * state.y1
                    - self.b2 * state.y2;
                state.x2 = state.x1;
                state.x1 = x;
                state.y2 = state.y1;
                state.y1 = y;
                output.set_sample(frame, ch, y);
            }
        }
        Ok(())
    }

    fn set_param(&mut self, index: usize, value: &ParamValue) {
        if let ParamValue::Float(v) = value {
            match index {
                PARAM_CUTOFF => {
                    self.cutoff = v.clamp(MIN_CUTOFF, MAX_CUTOFF);
                    self.calculate_coefficients();
                }
                PARAM_RESONANCE => {
                    self.resonance = v.clamp(MIN_RESONANCE, MAX_RESONANCE);
                    self.calculate_coefficients();
                }
                _ => {}
            }
        }
    }

    fn reset(&mut self) {
        for state in &mut self.state {
            *state = BiquadState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_sine(filter: &mut Filter, freq: f32, sample_rate: u32, frames: usize) -> f32 {
        let ctx = ProcessContext {
            sample_rate,
            block_frames: frames,
        };
        let mut input = SignalBuffer::zeroed(frames, 1);
        for frame in 0..frames {
            let t = frame as f32 / sample_rate as f32;
            input.set_sample(frame, 0, (2.0 * PI * freq * t).sin());
        }
        let mut output = SignalBuffer::zeroed(frames, 1);
        filter.process(&ctx, &input, &mut output).unwrap();
        // RMS over the tail, after the filter settles.
        let tail = &output.samples()[frames / 2..];
        (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
    }

    #[test]
    fn test_lowpass_attenuates_highs() {
        let mut filter = Filter::new(FilterShape::LowPass, 48000);
        filter.set_param(PARAM_CUTOFF, &ParamValue::Float(500.0));

        let low = process_sine(&mut filter, 100.0, 48000, 4096);
        filter.reset();
        let high = process_sine(&mut filter, 8000.0, 48000, 4096);

        assert!(low > 0.5, "passband should be mostly unattenuated: {low}");
        assert!(high < 0.05, "stopband should be attenuated: {high}");
    }

    #[test]
    fn test_highpass_attenuates_lows() {
        let mut filter = Filter::new(FilterShape::HighPass, 48000);
        filter.set_param(PARAM_CUTOFF, &ParamValue::Float(2000.0));

        let low = process_sine(&mut filter, 100.0, 48000, 4096);
        filter.reset();
        let high = process_sine(&mut filter, 8000.0, 48000, 4096);

        assert!(low < 0.05, "stopband should be attenuated: {low}");
        assert!(high > 0.5, "passband should be mostly unattenuated: {high}");
    }

    #[test]
    fn test_reset_clears_history() {
        let mut filter = Filter::new(FilterShape::LowPass, 48000);
        process_sine(&mut filter, 100.0, 48000, 256);
        filter.reset();
        for state in &filter.state {
            assert_eq!(state.y1, 0.0);
            assert_eq!(state.x1, 0.0);
        }
    }
}
