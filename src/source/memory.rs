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

//! Fully decoded, memory-resident PCM shared between playbacks.

use std::sync::Arc;

use super::traits::{PcmSource, Pull};

/// Decoded audio data in the engine's internal format: interleaved f32.
///
/// The data is stored in an Arc so every voice playing the same sound shares
/// one allocation.
pub struct SoundData {
    pcm: Vec<f32>,
    channel_count: u16,
    sample_rate: u32,
}

impl SoundData {
    /// Wraps interleaved f32 PCM. The sample count must be a whole number of
    /// frames; a trailing partial frame is dropped.
    pub fn new(mut pcm: Vec<f32>, channel_count: u16, sample_rate: u32) -> Self {
        let channels = channel_count.max(1) as usize;
        pcm.truncate(pcm.len() - pcm.len() % channels);
        Self {
            pcm,
            channel_count: channel_count.max(1),
            sample_rate,
        }
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length in frames.
    pub fn frames(&self) -> u64 {
        (self.pcm.len() / self.channel_count as usize) as u64
    }

    /// Memory used by the PCM data, in bytes.
    pub fn memory_size(&self) -> usize {
        self.pcm.len() * std::mem::size_of::<f32>()
    }

    pub fn pcm(&self) -> &[f32] {
        &self.pcm
    }
}

/// A playback cursor over shared [`SoundData`].
pub struct MemorySource {
    data: Arc<SoundData>,
    frame: u64,
}

impl MemorySource {
    pub fn new(data: Arc<SoundData>) -> Self {
        Self { data, frame: 0 }
    }
}

impl PcmSource for MemorySource {
    fn pull_frames(&mut self, out: &mut [f32], max_frames: usize) -> Pull {
        let channels = self.data.channel_count as usize;
        let total = self.data.frames();
        let available = total.saturating_sub(self.frame) as usize;
        let frames = available.min(max_frames);

        if frames > 0 {
            let start = self.frame as usize * channels;
            let end = start + frames * channels;
            out[..frames * channels].copy_from_slice(&self.data.pcm[start..end]);
            self.frame += frames as u64;
        }

        Pull {
            frames,
            end_of_stream: self.frame >= total,
        }
    }

    fn channel_count(&self) -> u16 {
        self.data.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.data.sample_rate
    }

    fn length_frames(&self) -> Option<u64> {
        Some(self.data.frames())
    }

    fn rewind(&mut self) -> bool {
        self.frame = 0;
        true
    }
}

/// An endless silent source. Backs DSP-generated channels (tone playback):
/// the chain's generator units ignore their input, and the channel never
/// reaches end of data.
pub struct SilenceSource {
    channel_count: u16,
    sample_rate: u32,
}

impl SilenceSource {
    pub fn new(channel_count: u16, sample_rate: u32) -> Self {
        Self {
            channel_count: channel_count.max(1),
            sample_rate,
        }
    }
}

impl PcmSource for SilenceSource {
    fn pull_frames(&mut self, out: &mut [f32], max_frames: usize) -> Pull {
        out[..max_frames * self.channel_count as usize].fill(0.0);
        Pull {
            frames: max_frames,
            end_of_stream: false,
        }
    }

    fn channel_count(&self) -> u16 {
        self.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_frames(&self) -> Option<u64> {
        None
    }

    fn rewind(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_sound(frames: usize) -> Arc<SoundData> {
        let pcm: Vec<f32> = (0..frames * 2).map(|i| i as f32).collect();
        Arc::new(SoundData::new(pcm, 2, 48000))
    }

    #[test]
    fn test_pull_to_end() {
        let mut source = MemorySource::new(ramp_sound(4));
        let mut out = vec![0.0; 16];

        let pull = source.pull_frames(&mut out, 3);
        assert_eq!(pull.frames, 3);
        assert!(!pull.end_of_stream);
        assert_eq!(&out[..6], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        let pull = source.pull_frames(&mut out, 3);
        assert_eq!(pull.frames, 1);
        assert!(pull.end_of_stream);
        assert_eq!(&out[..2], &[6.0, 7.0]);

        // Subsequent pulls produce nothing.
        let pull = source.pull_frames(&mut out, 3);
        assert_eq!(pull.frames, 0);
        assert!(pull.end_of_stream);
    }

    #[test]
    fn test_rewind_restarts() {
        let mut source = MemorySource::new(ramp_sound(2));
        let mut out = vec![0.0; 8];
        source.pull_frames(&mut out, 2);
        assert!(source.rewind());
        let pull = source.pull_frames(&mut out, 1);
        assert_eq!(pull.frames, 1);
        assert_eq!(&out[..2], &[0.0, 1.0]);
    }

    #[test]
    fn test_partial_trailing_frame_dropped() {
        let data = SoundData::new(vec![0.0, 1.0, 2.0], 2, 48000);
        assert_eq!(data.frames(), 1);
    }
}
