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

//! Tone generator unit. Ignores its inputs and produces one channel.

use std::f32::consts::PI;

use crate::buffer::SignalBuffer;
use crate::graph::{
    BlockProcessor, DspDescriptor, ParamDef, ParamKind, ParamValue, ProcessContext, ProcessFault,
};

/// Parameter index: waveform selector (see [`Waveform`]).
pub const PARAM_TYPE: usize = 0;
/// Parameter index: frequency in Hz.
pub const PARAM_RATE: usize = 1;

const MIN_RATE: f32 = 1.0;
const MAX_RATE: f32 = 22000.0;
const DEFAULT_RATE: f32 = 220.0;

/// Waveform selector values for [`PARAM_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine = 0,
    Square = 1,
    SawUp = 2,
    SawDown = 3,
    Triangle = 4,
    Noise = 5,
}

impl Waveform {
    fn from_index(index: i32) -> Waveform {
        match index {
            1 => Waveform::Square,
            2 => Waveform::SawUp,
            3 => Waveform::SawDown,
            4 => Waveform::Triangle,
            5 => Waveform::Noise,
            _ => Waveform::Sine,
        }
    }
}

pub fn descriptor() -> DspDescriptor {
    DspDescriptor {
        name: "oscillator".into(),
        params: vec![
            ParamDef::new(
                "type",
                ParamKind::Int {
                    min: 0,
                    max: 5,
                    default: 0,
                },
            ),
            ParamDef::new(
                "rate",
                ParamKind::Float {
                    min: MIN_RATE,
                    max: MAX_RATE,
                    default: DEFAULT_RATE,
                },
            ),
        ],
        output_channels: Some(1),
    }
}

pub struct Oscillator {
    sample_rate: f32,
    waveform: Waveform,
    rate: f32,
    phase: f32,
    /// xorshift state for the noise waveform.
    noise_state: u32,
}

impl Oscillator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate as f32,
            waveform: Waveform::Sine,
            rate: DEFAULT_RATE,
            phase: 0.0,
            noise_state: 0x9e3779b9,
        }
    }

    #[inline]
    fn next_noise(&mut self) -> f32 {
        let mut x = self.noise_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.noise_state = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

impl BlockProcessor for Oscillator {
    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _input: &SignalBuffer,
        output: &mut SignalBuffer,
    ) -> Result<(), ProcessFault> {
        let frames = output.frames();
        let inc = self.rate / self.sample_rate;

        for frame in 0..frames {
            let sample = match self.waveform {
                Waveform::Sine => (2.0 * PI * self.phase).sin(),
                Waveform::Square => {
                    if self.phase < 0.5 {
                        1.0
                    } else {
                        -1.0
                    }
                }
                Waveform::SawUp => 2.0 * self.phase - 1.0,
                Waveform::SawDown => 1.0 - 2.0 * self.phase,
                Waveform::Triangle => {
                    if self.phase < 0.5 {
                        4.0 * self.phase - 1.0
                    } else {
                        3.0 - 4.0 * self.phase
                    }
                }
                Waveform::Noise => self.next_noise(),
            };
            output.set_sample(frame, 0, sample);
            self.phase = (self.phase + inc).fract();
        }
        Ok(())
    }

    fn set_param(&mut self, index: usize, value: &ParamValue) {
        match (index, value) {
            (PARAM_TYPE, ParamValue::Int(v)) => self.waveform = Waveform::from_index(*v),
            (PARAM_RATE, ParamValue::Float(v)) => self.rate = v.clamp(MIN_RATE, MAX_RATE),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(osc: &mut Oscillator, frames: usize) -> SignalBuffer {
        let ctx = ProcessContext {
            sample_rate: 48000,
            block_frames: frames,
        };
        let input = SignalBuffer::zeroed(frames, 1);
        let mut output = SignalBuffer::zeroed(frames, 1);
        osc.process(&ctx, &input, &mut output).unwrap();
        output
    }

    #[test]
    fn test_sine_matches_closed_form() {
        let mut osc = Oscillator::new(48000);
        osc.set_param(PARAM_RATE, &ParamValue::Float(440.0));
        let output = render(&mut osc, 256);

        for frame in 0..256 {
            let expected = (2.0 * PI * 440.0 * frame as f32 / 48000.0).sin();
            assert!(
                (output.sample(frame, 0) - expected).abs() < 1e-4,
                "frame {frame}"
            );
        }
    }

    #[test]
    fn test_square_is_bipolar() {
        let mut osc = Oscillator::new(48000);
        osc.set_param(PARAM_TYPE, &ParamValue::Int(1));
        osc.set_param(PARAM_RATE, &ParamValue::Float(1000.0));
        let output = render(&mut osc, 512);

        assert!(output.samples().iter().any(|s| *s == 1.0));
        assert!(output.samples().iter().any(|s| *s == -1.0));
        assert!(output.samples().iter().all(|s| s.abs() == 1.0));
    }

    #[test]
    fn test_noise_stays_in_range() {
        let mut osc = Oscillator::new(48000);
        osc.set_param(PARAM_TYPE, &ParamValue::Int(5));
        let output = render(&mut osc, 1024);

        assert!(output.samples().iter().all(|s| s.abs() <= 1.0));
        // Not silent, and not a constant.
        let first = output.sample(0, 0);
        assert!(output.samples().iter().any(|s| (*s - first).abs() > 0.01));
    }

    #[test]
    fn test_phase_continuity_across_blocks() {
        let mut osc = Oscillator::new(48000);
        osc.set_param(PARAM_RATE, &ParamValue::Float(440.0));
        let a = render(&mut osc, 128);
        let b = render(&mut osc, 128);

        let expected = (2.0 * PI * 440.0 * 128.0 / 48000.0).sin();
        assert!((a.sample(127, 0) - (2.0 * PI * 440.0 * 127.0 / 48000.0).sin()).abs() < 1e-4);
        assert!((b.sample(0, 0) - expected).abs() < 1e-4);
    }
}
