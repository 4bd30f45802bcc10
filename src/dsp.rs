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

//! Built-in DSP unit types and the custom-DSP registration surface.

pub mod custom;
pub mod echo;
pub mod filter;
pub mod flange;
pub mod oscillator;

pub use custom::CustomDspDescription;

use crate::graph::{BlockProcessor, DspDescriptor};

/// The built-in DSP unit types (the set exercised by typical applications:
/// per-channel filters, modulation effects, and tone generation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspType {
    LowPass,
    HighPass,
    Echo,
    Flange,
    Oscillator,
}

impl DspType {
    /// The descriptor (name, ordered parameters, pinned output channels)
    /// for this type.
    pub fn descriptor(&self) -> DspDescriptor {
        match self {
            DspType::LowPass => filter::descriptor(filter::FilterShape::LowPass),
            DspType::HighPass => filter::descriptor(filter::FilterShape::HighPass),
            DspType::Echo => echo::descriptor(),
            DspType::Flange => flange::descriptor(),
            DspType::Oscillator => oscillator::descriptor(),
        }
    }

    /// Creates a fresh processor instance for the render context.
    pub fn create_processor(&self, sample_rate: u32) -> Box<dyn BlockProcessor> {
        match self {
            DspType::LowPass => Box::new(filter::Filter::new(
                filter::FilterShape::LowPass,
                sample_rate,
            )),
            DspType::HighPass => Box::new(filter::Filter::new(
                filter::FilterShape::HighPass,
                sample_rate,
            )),
            DspType::Echo => Box::new(echo::Echo::new(sample_rate)),
            DspType::Flange => Box::new(flange::Flange::new(sample_rate)),
            DspType::Oscillator => Box::new(oscillator::Oscillator::new(sample_rate)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_have_defaults_in_range() {
        use crate::graph::ParamValue;

        for ty in [
            DspType::LowPass,
            DspType::HighPass,
            DspType::Echo,
            DspType::Flange,
            DspType::Oscillator,
        ] {
            let descriptor = ty.descriptor();
            for def in &descriptor.params {
                let default = ParamValue::default_for(def);
                assert!(
                    default.matches(def),
                    "{}/{} default out of range",
                    descriptor.name,
                    def.name
                );
            }
        }
    }

    #[test]
    fn test_oscillator_pins_mono_output() {
        assert_eq!(DspType::Oscillator.descriptor().output_channels, Some(1));
        assert_eq!(DspType::LowPass.descriptor().output_channels, None);
    }
}
