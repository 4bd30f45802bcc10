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

//! User-supplied DSP units.
//!
//! Applications describe their unit once (name, parameters, pinned output
//! channels) and provide a factory; the engine instantiates one processor
//! per created unit and dispatches the capability set
//! ([`crate::graph::BlockProcessor`]) from the render context.
//!
//! The process callback runs on the render path and must be real-time safe:
//! no blocking calls, no allocation. This is a contract, not a convention;
//! the mixer's tick-never-blocks guarantee depends on it. A panicking or
//! erroring processor is force-bypassed and reported, which contains the
//! damage but does not excuse the violation.

use std::sync::Arc;

use crate::graph::{BlockProcessor, DspDescriptor};

/// Factory signature: creates one processor instance per unit.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn BlockProcessor> + Send + Sync>;

/// A registered user DSP description.
#[derive(Clone)]
pub struct CustomDspDescription {
    descriptor: DspDescriptor,
    factory: ProcessorFactory,
}

impl CustomDspDescription {
    pub fn new(
        descriptor: DspDescriptor,
        factory: impl Fn() -> Box<dyn BlockProcessor> + Send + Sync + 'static,
    ) -> Self {
        Self {
            descriptor,
            factory: Arc::new(factory),
        }
    }

    pub fn descriptor(&self) -> &DspDescriptor {
        &self.descriptor
    }

    /// Instantiates a processor for a new unit.
    pub fn create(&self) -> Box<dyn BlockProcessor> {
        (self.factory)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SignalBuffer;
    use crate::graph::{ParamDef, ParamKind, ParamValue, ProcessContext, ProcessFault};

    struct Gain {
        gain: f32,
    }

    impl BlockProcessor for Gain {
        fn process(
            &mut self,
            _ctx: &ProcessContext,
            input: &SignalBuffer,
            output: &mut SignalBuffer,
        ) -> Result<(), ProcessFault> {
            output.copy_from(input);
            output.apply_gain(self.gain);
            Ok(())
        }

        fn set_param(&mut self, index: usize, value: &ParamValue) {
            if index == 0 {
                if let ParamValue::Float(v) = value {
                    self.gain = *v;
                }
            }
        }

        fn get_param(&self, index: usize) -> Option<ParamValue> {
            (index == 0).then_some(ParamValue::Float(self.gain))
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_factory_creates_independent_instances() {
        let description = CustomDspDescription::new(
            DspDescriptor {
                name: "gain".into(),
                params: vec![ParamDef::new(
                    "gain",
                    ParamKind::Float {
                        min: 0.0,
                        max: 2.0,
                        default: 1.0,
                    },
                )],
                output_channels: None,
            },
            || Box::new(Gain { gain: 1.0 }),
        );

        let mut a = description.create();
        let b = description.create();
        a.set_param(0, &ParamValue::Float(0.25));

        assert_eq!(a.get_param(0), Some(ParamValue::Float(0.25)));
        assert_eq!(b.get_param(0), Some(ParamValue::Float(1.0)));
    }
}
