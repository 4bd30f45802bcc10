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

//! Feedback echo unit.

use crate::buffer::SignalBuffer;
use crate::graph::{
    BlockProcessor, DspDescriptor, ParamDef, ParamKind, ParamValue, ProcessContext, ProcessFault,
};

/// Parameter index: delay time in milliseconds.
pub const PARAM_DELAY_MS: usize = 0;
/// Parameter index: feedback amount, 0..=0.98.
pub const PARAM_FEEDBACK: usize = 1;
/// Parameter index: wet level, 0..=1.
pub const PARAM_WET: usize = 2;
/// Parameter index: dry level, 0..=1.
pub const PARAM_DRY: usize = 3;

const MIN_DELAY_MS: f32 = 1.0;
const MAX_DELAY_MS: f32 = 2000.0;
const DEFAULT_DELAY_MS: f32 = 500.0;
const MAX_FEEDBACK: f32 = 0.98;
const DEFAULT_FEEDBACK: f32 = 0.5;

pub fn descriptor() -> DspDescriptor {
    DspDescriptor {
        name: "echo".into(),
        params: vec![
            ParamDef::new(
                "delay",
                ParamKind::Float {
                    min: MIN_DELAY_MS,
                    max: MAX_DELAY_MS,
                    default: DEFAULT_DELAY_MS,
                },
            ),
            ParamDef::new(
                "feedback",
                ParamKind::Float {
                    min: 0.0,
                    max: MAX_FEEDBACK,
                    default: DEFAULT_FEEDBACK,
                },
            ),
            ParamDef::new(
                "wet",
                ParamKind::Float {
                    min: 0.0,
                    max: 1.0,
                    default: 1.0,
                },
            ),
            ParamDef::new(
                "dry",
                ParamKind::Float {
                    min: 0.0,
                    max: 1.0,
                    default: 1.0,
                },
            ),
        ],
        output_channels: None,
    }
}

/// Integer-tap feedback delay line, one ring per channel layout.
///
/// The delay buffer is (re)allocated when the negotiated channel count
/// changes; steady-state processing never allocates.
pub struct Echo {
    sample_rate: u32,
    delay_samples: usize,
    feedback: f32,
    wet: f32,
    dry: f32,
    buffer: Vec<f32>,
    channels: u16,
    write_pos: usize,
}

impl Echo {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            delay_samples: Self::ms_to_samples(DEFAULT_DELAY_MS, sample_rate),
            feedback: DEFAULT_FEEDBACK,
            wet: 1.0,
            dry: 1.0,
            buffer: Vec::new(),
            channels: 0,
            write_pos: 0,
        }
    }

    fn ms_to_samples(ms: f32, sample_rate: u32) -> usize {
        ((ms / 1000.0) * sample_rate as f32).round().max(1.0) as usize
    }

    fn buffer_frames(&self) -> usize {
        Self::ms_to_samples(MAX_DELAY_MS, self.sample_rate) + 1
    }

    fn ensure_channels(&mut self, channels: u16) {
        if self.channels != channels {
            self.channels = channels;
            self.buffer = vec![0.0; self.buffer_frames() * channels as usize];
            self.write_pos = 0;
        }
    }
}

impl BlockProcessor for Echo {
    fn process(
        &mut self,
        _ctx: &ProcessContext,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
    ) -> Result<(), ProcessFault> {
        let channels = input.channels().min(output.channels());
        self.ensure_channels(channels);
        let frames = input.frames().min(output.frames());
        let buffer_frames = self.buffer_frames();

        for frame in 0..frames {
            let read_pos =
                (self.write_pos + buffer_frames - self.delay_samples) % buffer_frames;
            for ch in 0..channels {
                let x = input.sample(frame, ch);
                let delayed = self.buffer[read_pos * channels as usize + ch as usize];
                self.buffer[self.write_pos * channels as usize + ch as usize] =
                    x + delayed * self.feedback;
                output.set_sample(frame, ch, x * self.dry + delayed * self.wet);
            }
            self.write_pos = (self.write_pos + 1) % buffer_frames;
        }
        Ok(())
    }

    fn set_param(&mut self, index: usize, value: &ParamValue) {
        if let ParamValue::Float(v) = value {
            match index {
                PARAM_DELAY_MS => {
                    self.delay_samples =
                        Self::ms_to_samples(v.clamp(MIN_DELAY_MS, MAX_DELAY_MS), self.sample_rate);
                }
                PARAM_FEEDBACK => self.feedback = v.clamp(0.0, MAX_FEEDBACK),
                PARAM_WET => self.wet = v.clamp(0.0, 1.0),
                PARAM_DRY => self.dry = v.clamp(0.0, 1.0),
                _ => {}
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impulse_echoes_at_delay() {
        let mut echo = Echo::new(1000);
        echo.set_param(PARAM_DELAY_MS, &ParamValue::Float(10.0)); // 10 samples at 1kHz
        echo.set_param(PARAM_FEEDBACK, &ParamValue::Float(0.5));

        let ctx = ProcessContext {
            sample_rate: 1000,
            block_frames: 32,
        };
        let mut input = SignalBuffer::zeroed(32, 1);
        input.set_sample(0, 0, 1.0);
        let mut output = SignalBuffer::zeroed(32, 1);
        echo.process(&ctx, &input, &mut output).unwrap();

        // Dry impulse at 0, first echo at 10, second (feedback) at 20.
        assert_eq!(output.sample(0, 0), 1.0);
        assert_eq!(output.sample(10, 0), 1.0);
        assert_eq!(output.sample(20, 0), 0.5);
        assert_eq!(output.sample(5, 0), 0.0);
    }

    #[test]
    fn test_reset_clears_tail() {
        let mut echo = Echo::new(1000);
        echo.set_param(PARAM_DELAY_MS, &ParamValue::Float(5.0));

        let ctx = ProcessContext {
            sample_rate: 1000,
            block_frames: 8,
        };
        let mut input = SignalBuffer::zeroed(8, 1);
        input.set_sample(0, 0, 1.0);
        let mut output = SignalBuffer::zeroed(8, 1);
        echo.process(&ctx, &input, &mut output).unwrap();

        echo.reset();
        let silence = SignalBuffer::zeroed(8, 1);
        let mut output = SignalBuffer::zeroed(8, 1);
        echo.process(&ctx, &silence, &mut output).unwrap();
        assert!(output.is_silent());
    }
}
