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
use std::path::Path;

use serde::Deserialize;

use crate::error::EngineError;

const DEFAULT_SAMPLE_RATE: u32 = 48000;
const DEFAULT_BLOCK_FRAMES: usize = 1024;
const DEFAULT_OUTPUT_CHANNELS: u16 = 2;
const DEFAULT_MAX_CHANNELS: usize = 512;
const DEFAULT_REAL_VOICES: usize = 64;
const DEFAULT_RERANK_INTERVAL_BLOCKS: u64 = 4;
const DEFAULT_STREAM_RING_FRAMES: usize = 16384;

/// A YAML representation of the engine configuration.
#[derive(Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Output sample rate in Hz (default: 48000).
    sample_rate: Option<u32>,

    /// Frames rendered per mixer tick (default: 1024).
    block_frames: Option<usize>,

    /// Output channel count (default: 2).
    output_channels: Option<u16>,

    /// Total logical channels the engine will track (default: 512).
    max_channels: Option<usize>,

    /// How many channels are mixed for real; the rest are virtualized
    /// (default: 64).
    real_voices: Option<usize>,

    /// How often (in blocks) the virtualization ranking is recomputed
    /// (default: 4).
    rerank_interval_blocks: Option<u64>,

    /// Capacity in frames of the decode-ahead ring for streaming sounds
    /// (default: 16384).
    stream_ring_frames: Option<usize>,
}

impl EngineConfig {
    /// Loads a configuration from a YAML file.
    pub fn from_path(path: &Path) -> Result<EngineConfig, Box<dyn Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Returns the frames rendered per tick.
    pub fn block_frames(&self) -> usize {
        self.block_frames.unwrap_or(DEFAULT_BLOCK_FRAMES)
    }

    /// Returns the output channel count.
    pub fn output_channels(&self) -> u16 {
        self.output_channels.unwrap_or(DEFAULT_OUTPUT_CHANNELS)
    }

    /// Returns the logical channel limit.
    pub fn max_channels(&self) -> usize {
        self.max_channels.unwrap_or(DEFAULT_MAX_CHANNELS)
    }

    /// Returns the physical voice budget.
    pub fn real_voices(&self) -> usize {
        self.real_voices
            .unwrap_or(DEFAULT_REAL_VOICES)
            .min(self.max_channels())
    }

    /// Returns the re-rank interval in blocks.
    pub fn rerank_interval_blocks(&self) -> u64 {
        self.rerank_interval_blocks
            .unwrap_or(DEFAULT_RERANK_INTERVAL_BLOCKS)
            .max(1)
    }

    /// Returns the streaming ring capacity in frames.
    pub fn stream_ring_frames(&self) -> usize {
        self.stream_ring_frames.unwrap_or(DEFAULT_STREAM_RING_FRAMES)
    }

    /// Overrides the block size. Used by tests that probe block-size
    /// independence of the scheduler.
    pub fn with_block_frames(mut self, frames: usize) -> Self {
        self.block_frames = Some(frames);
        self
    }

    /// Overrides the sample rate.
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    /// Overrides the logical channel limit.
    pub fn with_max_channels(mut self, channels: usize) -> Self {
        self.max_channels = Some(channels);
        self
    }

    /// Overrides the voice budget.
    pub fn with_real_voices(mut self, voices: usize) -> Self {
        self.real_voices = Some(voices);
        self
    }

    /// Overrides the re-rank interval.
    pub fn with_rerank_interval_blocks(mut self, blocks: u64) -> Self {
        self.rerank_interval_blocks = Some(blocks);
        self
    }

    /// Checks the configuration for values the engine cannot honor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate() < 8000 || self.sample_rate() > 192000 {
            return Err(EngineError::param(format!(
                "sample_rate {} outside 8000..=192000",
                self.sample_rate()
            )));
        }
        if self.block_frames() < 16 || self.block_frames() > 8192 {
            return Err(EngineError::param(format!(
                "block_frames {} outside 16..=8192",
                self.block_frames()
            )));
        }
        if self.output_channels() == 0 || self.output_channels() > 32 {
            return Err(EngineError::param(format!(
                "output_channels {} outside 1..=32",
                self.output_channels()
            )));
        }
        if self.max_channels() == 0 {
            return Err(EngineError::param("max_channels must be nonzero"));
        }
        if self.real_voices() == 0 {
            return Err(EngineError::param("real_voices must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_rate(), 48000);
        assert_eq!(config.block_frames(), 1024);
        assert_eq!(config.output_channels(), 2);
    }

    #[test]
    fn test_real_voices_clamped_to_max_channels() {
        let config: EngineConfig = serde_yml::from_str(
            r"
max_channels: 8
real_voices: 100
",
        )
        .unwrap();
        assert_eq!(config.real_voices(), 8);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let config = EngineConfig::default().with_block_frames(4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_parse() {
        let config: EngineConfig = serde_yml::from_str(
            r"
sample_rate: 44100
block_frames: 512
output_channels: 2
",
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_rate(), 44100);
        assert_eq!(config.block_frames(), 512);
    }
}
