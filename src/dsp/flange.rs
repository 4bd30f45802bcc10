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

//! Flange unit: a short modulated delay mixed against the dry signal.

use std::f32::consts::PI;

use crate::buffer::SignalBuffer;
use crate::graph::{
    BlockProcessor, DspDescriptor, ParamDef, ParamKind, ParamValue, ProcessContext, ProcessFault,
};

/// Parameter index: LFO rate in Hz.
pub const PARAM_RATE: usize = 0;
/// Parameter index: modulation depth, 0..=1.
pub const PARAM_DEPTH: usize = 1;
/// Parameter index: wet/dry mix, 0..=1.
pub const PARAM_MIX: usize = 2;

const MIN_RATE: f32 = 0.05;
const MAX_RATE: f32 = 5.0;
const DEFAULT_RATE: f32 = 0.5;
const DEFAULT_DEPTH: f32 = 0.7;
const DEFAULT_MIX: f32 = 0.5;

/// Base delay of the sweep center, in milliseconds.
const BASE_DELAY_MS: f32 = 2.0;
/// Longest delay the sweep can reach, in milliseconds.
const MAX_DELAY_MS: f32 = 6.0;

pub fn descriptor() -> DspDescriptor {
    DspDescriptor {
        name: "flange".into(),
        params: vec![
            ParamDef::new(
                "rate",
                ParamKind::Float {
                    min: MIN_RATE,
                    max: MAX_RATE,
                    default: DEFAULT_RATE,
                },
            ),
            ParamDef::new(
                "depth",
                ParamKind::Float {
                    min: 0.0,
                    max: 1.0,
                    default: DEFAULT_DEPTH,
                },
            ),
            ParamDef::new(
                "mix",
                ParamKind::Float {
                    min: 0.0,
                    max: 1.0,
                    default: DEFAULT_MIX,
                },
            ),
        ],
        output_channels: None,
    }
}

pub struct Flange {
    sample_rate: f32,
    rate: f32,
    depth: f32,
    mix: f32,
    lfo_phase: f32,
    buffer: Vec<f32>,
    buffer_frames: usize,
    channels: u16,
    write_pos: usize,
}

impl Flange {
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate as f32;
        Self {
            sample_rate: sr,
            rate: DEFAULT_RATE,
            depth: DEFAULT_DEPTH,
            mix: DEFAULT_MIX,
            lfo_phase: 0.0,
            buffer: Vec::new(),
            buffer_frames: ((MAX_DELAY_MS / 1000.0) * sr) as usize + 2,
            channels: 0,
            write_pos: 0,
        }
    }

    fn ensure_channels(&mut self, channels: u16) {
        if self.channels != channels {
            self.channels = channels;
            self.buffer = vec![0.0; self.buffer_frames * channels as usize];
            self.write_pos = 0;
        }
    }
}

impl BlockProcessor for Flange {
    fn process(
        &mut self,
        _ctx: &ProcessContext,
        input: &SignalBuffer,
        output: &mut SignalBuffer,
    ) -> Result<(), ProcessFault> {
        let channels = input.channels().min(output.channels());
        self.ensure_channels(channels);
        let frames = input.frames().min(output.frames());

        let base = (BASE_DELAY_MS / 1000.0) * self.sample_rate;
        let sweep = ((MAX_DELAY_MS - BASE_DELAY_MS) / 2000.0) * self.sample_rate * self.depth;
        let lfo_inc = self.rate / self.sample_rate;

        for frame in 0..frames {
            // Sweep the tap between base and base + 2*sweep.
            let lfo = (2.0 * PI * self.lfo_phase).sin();
            let delay = base + sweep * (1.0 + lfo);
            self.lfo_phase = (self.lfo_phase + lfo_inc).fract();

            let delay_floor = delay.floor();
            let frac = delay - delay_floor;
            let tap0 = (self.write_pos + self.buffer_frames - delay_floor as usize)
                % self.buffer_frames;
            let tap1 = (tap0 + self.buffer_frames - 1) % self.buffer_frames;

            for ch in 0..channels {
                let x = input.sample(frame, ch);
                self.buffer[self.write_pos * channels as usize + ch as usize] = x;

                let s0 = self.buffer[tap0 * channels as usize + ch as usize];
                let s1 = self.buffer[tap1 * channels as usize + ch as usize];
                let wet = s0 + (s1 - s0) * frac;
                output.set_sample(frame, ch, x * (1.0 - self.mix) + wet * self.mix);
            }
            self.write_pos = (self.write_pos + 1) % self.buffer_frames;
        }
        Ok(())
    }

    fn set_param(&mut self, index: usize, value: &ParamValue) {
        if let ParamValue::Float(v) = value {
            match index {
                PARAM_RATE => self.rate = v.clamp(MIN_RATE, MAX_RATE),
                PARAM_DEPTH => self.depth = v.clamp(0.0, 1.0),
                PARAM_MIX => self.mix = v.clamp(0.0, 1.0),
                _ => {}
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.lfo_phase = 0.0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_mix_passes_signal() {
        let mut flange = Flange::new(48000);
        flange.set_param(PARAM_MIX, &ParamValue::Float(0.0));

        let ctx = ProcessContext {
            sample_rate: 48000,
            block_frames: 64,
        };
        let mut input = SignalBuffer::zeroed(64, 2);
        for frame in 0..64 {
            input.set_sample(frame, 0, 0.5);
            input.set_sample(frame, 1, -0.5);
        }
        let mut output = SignalBuffer::zeroed(64, 2);
        flange.process(&ctx, &input, &mut output).unwrap();

        assert_eq!(output.sample(10, 0), 0.5);
        assert_eq!(output.sample(10, 1), -0.5);
    }

    #[test]
    fn test_wet_path_delays_signal() {
        let mut flange = Flange::new(48000);
        flange.set_param(PARAM_MIX, &ParamValue::Float(1.0));
        flange.set_param(PARAM_DEPTH, &ParamValue::Float(0.0));

        let ctx = ProcessContext {
            sample_rate: 48000,
            block_frames: 256,
        };
        let mut input = SignalBuffer::zeroed(256, 1);
        input.set_sample(0, 0, 1.0);
        let mut output = SignalBuffer::zeroed(256, 1);
        flange.process(&ctx, &input, &mut output).unwrap();

        // With depth 0 the tap sits at the base delay; the impulse must not
        // appear at frame 0 and must appear in full somewhere later.
        assert_eq!(output.sample(0, 0), 0.0);
        let peak = output.samples().iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.9, "delayed impulse missing: peak {peak}");
    }
}
