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
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::OutputBackend;
use crate::buffer::SignalBuffer;

/// A backend that captures rendered blocks. Doesn't play anything; used by
/// tests to assert on the mixed output.
#[derive(Clone)]
pub struct MockBackend {
    captured: Arc<Mutex<Vec<f32>>>,
    blocks: Arc<Mutex<usize>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            captured: Arc::new(Mutex::new(Vec::new())),
            blocks: Arc::new(Mutex::new(0)),
        }
    }

    /// All captured samples, interleaved, in push order.
    pub fn samples(&self) -> Vec<f32> {
        self.captured.lock().clone()
    }

    /// Number of blocks pushed so far.
    pub fn block_count(&self) -> usize {
        *self.blocks.lock()
    }

    pub fn clear(&self) {
        self.captured.lock().clear();
        *self.blocks.lock() = 0;
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for MockBackend {
    fn push_block(&mut self, block: &SignalBuffer) -> Result<(), Box<dyn Error>> {
        self.captured.lock().extend_from_slice(block.samples());
        *self.blocks.lock() += 1;
        Ok(())
    }
}

impl fmt::Display for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture() {
        let mut backend = MockBackend::new();
        let mut block = SignalBuffer::zeroed(4, 2);
        block.set_sample(0, 0, 0.5);
        backend.push_block(&block).unwrap();
        backend.push_block(&block).unwrap();

        assert_eq!(backend.block_count(), 2);
        let samples = backend.samples();
        assert_eq!(samples.len(), 16);
        assert_eq!(samples[0], 0.5);
        assert_eq!(samples[8], 0.5);
    }
}
