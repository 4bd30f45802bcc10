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

//! Render-side playback channels.
//!
//! A channel owns a playback cursor over a PCM source and feeds a source
//! unit in the DSP graph. The cursor steps at
//! `(frequency / output_rate) * pitch`, converting the source rate at the
//! point of use, and honors a scheduled start/stop window measured on the
//! output sample clock, so activation is exact regardless of block size.

use crate::buffer::SignalBuffer;
use crate::source::PcmSource;
use crate::spatial::{DistanceBounds, EmitterAttributes};

/// Frames staged from the source per pull.
const STAGING_FRAMES: usize = 256;

/// Lifecycle of a channel on the render side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    /// Created, waiting for its activation sample.
    Scheduled,
    Playing,
    /// Terminal. The mixer reclaims the channel after reporting it.
    Stopped,
}

/// Linear-interpolating read cursor over a sequential source.
struct Cursor {
    /// Fractional position between `hold` and `next`. Starts at 2.0 so the
    /// first two advances load the first two source frames.
    frac: f64,
    hold: Vec<f32>,
    next: Vec<f32>,
    staging: Vec<f32>,
    staged_frames: usize,
    read_frame: usize,
    /// Source is exhausted (after loop handling).
    eos: bool,
    /// Advances taken past the end; 2 means hold and next are both silence.
    zeros_past_end: u8,
    /// Source frames consumed since start (loops keep counting).
    consumed: u64,
}

impl Cursor {
    fn new(channels: usize) -> Self {
        Self {
            frac: 2.0,
            hold: vec![0.0; channels],
            next: vec![0.0; channels],
            staging: vec![0.0; STAGING_FRAMES * channels],
            staged_frames: 0,
            read_frame: 0,
            eos: false,
            zeros_past_end: 0,
            consumed: 0,
        }
    }
}

/// A playing (or scheduled) channel.
pub struct RenderChannel {
    source: Box<dyn PcmSource>,
    cursor: Cursor,

    // Graph wiring.
    pub group_slot: u32,
    pub source_unit: u32,
    pub fader_unit: u32,
    pub bus_connection: u32,
    /// Effect units inserted into this channel's chain (for freezing).
    pub chain_units: Vec<u32>,

    // Control state, mirrored from the shadow.
    pub state: PlayState,
    pub paused: bool,
    pub volume: f32,
    pub pitch: f32,
    pub pan: f32,
    pub mute: bool,
    /// Overrides the source's native rate for cursor stepping.
    pub frequency: Option<f32>,
    pub looping: bool,
    pub start_sample: Option<u64>,
    pub end_sample: Option<u64>,
    pub stop_at_end: bool,
    pub spatial: Option<EmitterAttributes>,
    pub distance_bounds: DistanceBounds,

    // Bookkeeping.
    pub generation: u32,
    pub created_seq: u64,
    pub is_virtual: bool,
    pub just_ended: bool,

    // Per-tick values written by the mixer before evaluation.
    pub eff_step: f64,
    pub eff_paused: bool,
    /// Audibility estimate for the virtualization ranking.
    pub eff_audibility: f32,
}

impl RenderChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn PcmSource>,
        group_slot: u32,
        source_unit: u32,
        fader_unit: u32,
        bus_connection: u32,
        generation: u32,
        created_seq: u64,
        paused: bool,
    ) -> Self {
        let channels = source.channel_count().max(1) as usize;
        Self {
            source,
            cursor: Cursor::new(channels),
            group_slot,
            source_unit,
            fader_unit,
            bus_connection,
            chain_units: Vec::new(),
            state: PlayState::Scheduled,
            paused,
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            mute: false,
            frequency: None,
            looping: false,
            start_sample: None,
            end_sample: None,
            stop_at_end: false,
            spatial: None,
            distance_bounds: DistanceBounds::default(),
            generation,
            created_seq,
            is_virtual: false,
            just_ended: false,
            eff_step: 1.0,
            eff_paused: false,
            eff_audibility: 0.0,
        }
    }

    pub fn source_channels(&self) -> u16 {
        self.source.channel_count()
    }

    pub fn source_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    /// Source frames consumed so far (keeps counting across loops).
    pub fn position_frames(&self) -> u64 {
        self.cursor.consumed
    }

    /// Refills the staging buffer, rewinding at end of data when looping.
    fn refill_staging(&mut self) {
        if self.cursor.eos {
            self.cursor.staged_frames = 0;
            self.cursor.read_frame = 0;
            return;
        }
        loop {
            let pull = self.source.pull_frames(&mut self.cursor.staging, STAGING_FRAMES);
            self.cursor.staged_frames = pull.frames;
            self.cursor.read_frame = 0;
            if pull.frames > 0 {
                return;
            }
            if pull.end_of_stream {
                if self.looping && self.source.rewind() {
                    continue;
                }
                self.cursor.eos = true;
            }
            return;
        }
    }

    /// Shifts the interpolation window forward by one source frame.
    fn advance_one(&mut self) {
        if self.cursor.read_frame >= self.cursor.staged_frames {
            self.refill_staging();
        }
        std::mem::swap(&mut self.cursor.hold, &mut self.cursor.next);
        if self.cursor.read_frame < self.cursor.staged_frames {
            let channels = self.cursor.next.len();
            let start = self.cursor.read_frame * channels;
            self.cursor
                .next
                .copy_from_slice(&self.cursor.staging[start..start + channels]);
            self.cursor.read_frame += 1;
            self.cursor.consumed += 1;
            self.cursor.zeros_past_end = 0;
        } else {
            self.cursor.next.fill(0.0);
            if self.cursor.eos {
                self.cursor.zeros_past_end = self.cursor.zeros_past_end.saturating_add(1);
            }
        }
    }

    /// True once the cursor has interpolated past the last real frame.
    fn drained(&self) -> bool {
        self.cursor.eos && self.cursor.zeros_past_end >= 2
    }

    /// Renders interpolated source frames into `out[begin..begin+count)`.
    fn fill_region(&mut self, out: &mut SignalBuffer, begin: usize, count: usize) {
        let channels = self.cursor.hold.len().min(out.channels() as usize);
        for frame in begin..begin + count {
            while self.cursor.frac >= 1.0 {
                self.advance_one();
                self.cursor.frac -= 1.0;
            }
            let frac = self.cursor.frac as f32;
            for ch in 0..channels {
                let hold = self.cursor.hold[ch];
                let next = self.cursor.next[ch];
                out.set_sample(frame, ch as u16, hold + (next - hold) * frac);
            }
            self.cursor.frac += self.eff_step;
        }
    }

    /// Advances the cursor by `count` output frames without producing audio.
    /// Mirrors `fill_region` exactly so a later promotion resumes at the
    /// same position a real channel would have reached.
    fn skip_region(&mut self, count: usize) {
        for _ in 0..count {
            while self.cursor.frac >= 1.0 {
                self.advance_one();
                self.cursor.frac -= 1.0;
            }
            self.cursor.frac += self.eff_step;
        }
    }

    /// Produces this channel's source block for the window
    /// `[clock, clock + frames)`. Called from the graph's source-fill hook.
    pub fn fill_block(&mut self, out: &mut SignalBuffer, clock: u64, frames: usize) {
        out.reset(frames, self.source_channels().max(1));

        if self.state == PlayState::Stopped || self.eff_paused {
            return;
        }

        let window_end = clock + frames as u64;

        // Resolve the scheduled start against the sample clock, not the tick
        // index: the activation offset lands mid-block when it must.
        let mut begin = 0usize;
        if self.state == PlayState::Scheduled {
            let start = self.start_sample.unwrap_or(0);
            if start >= window_end {
                return;
            }
            begin = start.saturating_sub(clock) as usize;
            self.state = PlayState::Playing;
        }

        // Scheduled end clock: render up to it, then stop or pause.
        let mut until = frames;
        let mut reached_end = false;
        if let Some(end) = self.end_sample {
            if end <= clock + begin as u64 {
                until = begin;
                reached_end = true;
            } else if end < window_end {
                until = (end - clock) as usize;
                reached_end = true;
            }
        }

        let count = until.saturating_sub(begin);
        if count > 0 {
            if self.is_virtual {
                self.skip_region(count);
            } else {
                self.fill_region(out, begin, count);
            }
        }

        if reached_end {
            if self.stop_at_end {
                self.state = PlayState::Stopped;
                self.just_ended = true;
            } else {
                self.paused = true;
                self.end_sample = None;
            }
            return;
        }

        // A non-looping source that has been fully consumed ends the channel.
        if self.drained() {
            self.state = PlayState::Stopped;
            self.just_ended = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, SoundData};
    use std::sync::Arc;

    fn ramp_channel(frames: usize, paused: bool) -> RenderChannel {
        let pcm: Vec<f32> = (0..frames).map(|i| (i + 1) as f32).collect();
        let data = Arc::new(SoundData::new(pcm, 1, 48000));
        RenderChannel::new(
            Box::new(MemorySource::new(data)),
            0,
            0,
            1,
            0,
            0,
            0,
            paused,
        )
    }

    #[test]
    fn test_unit_step_passthrough() {
        let mut channel = ramp_channel(8, false);
        let mut out = SignalBuffer::zeroed(4, 1);
        channel.fill_block(&mut out, 0, 4);

        assert_eq!(channel.state, PlayState::Playing);
        assert_eq!(out.sample(0, 0), 1.0);
        assert_eq!(out.sample(1, 0), 2.0);
        assert_eq!(out.sample(3, 0), 4.0);
    }

    #[test]
    fn test_half_step_interpolates() {
        let mut channel = ramp_channel(8, false);
        channel.eff_step = 0.5;
        let mut out = SignalBuffer::zeroed(4, 1);
        channel.fill_block(&mut out, 0, 4);

        assert_eq!(out.sample(0, 0), 1.0);
        assert_eq!(out.sample(1, 0), 1.5);
        assert_eq!(out.sample(2, 0), 2.0);
        assert_eq!(out.sample(3, 0), 2.5);
    }

    #[test]
    fn test_scheduled_start_mid_block() {
        let mut channel = ramp_channel(8, false);
        channel.start_sample = Some(6);
        let mut out = SignalBuffer::zeroed(4, 1);

        // Window [0,4): entirely before the activation sample.
        channel.fill_block(&mut out, 0, 4);
        assert_eq!(channel.state, PlayState::Scheduled);
        assert!(out.is_silent());

        // Window [4,8): activation at offset 2.
        channel.fill_block(&mut out, 4, 4);
        assert_eq!(channel.state, PlayState::Playing);
        assert_eq!(out.sample(0, 0), 0.0);
        assert_eq!(out.sample(1, 0), 0.0);
        assert_eq!(out.sample(2, 0), 1.0);
        assert_eq!(out.sample(3, 0), 2.0);
    }

    #[test]
    fn test_end_of_data_stops_channel() {
        let mut channel = ramp_channel(3, false);
        let mut out = SignalBuffer::zeroed(8, 1);
        channel.fill_block(&mut out, 0, 8);

        assert_eq!(out.sample(0, 0), 1.0);
        assert_eq!(out.sample(2, 0), 3.0);
        assert_eq!(out.sample(4, 0), 0.0);
        assert_eq!(channel.state, PlayState::Stopped);
        assert!(channel.just_ended);
    }

    #[test]
    fn test_looping_wraps() {
        let mut channel = ramp_channel(4, false);
        channel.looping = true;
        let mut out = SignalBuffer::zeroed(10, 1);
        channel.fill_block(&mut out, 0, 10);

        assert_eq!(channel.state, PlayState::Playing);
        assert_eq!(out.sample(3, 0), 4.0);
        assert_eq!(out.sample(4, 0), 1.0);
        assert_eq!(out.sample(7, 0), 4.0);
        assert_eq!(out.sample(8, 0), 1.0);
    }

    #[test]
    fn test_scheduled_end_pauses_without_stop_flag() {
        let mut channel = ramp_channel(8, false);
        channel.end_sample = Some(2);
        channel.stop_at_end = false;
        let mut out = SignalBuffer::zeroed(4, 1);
        channel.fill_block(&mut out, 0, 4);

        assert_eq!(out.sample(0, 0), 1.0);
        assert_eq!(out.sample(1, 0), 2.0);
        assert_eq!(out.sample(2, 0), 0.0);
        assert!(channel.paused);
        assert_eq!(channel.state, PlayState::Playing);
    }

    #[test]
    fn test_scheduled_end_stops_with_flag() {
        let mut channel = ramp_channel(8, false);
        channel.end_sample = Some(2);
        channel.stop_at_end = true;
        let mut out = SignalBuffer::zeroed(4, 1);
        channel.fill_block(&mut out, 0, 4);

        assert_eq!(channel.state, PlayState::Stopped);
        assert!(channel.just_ended);
    }

    #[test]
    fn test_virtual_advances_position_silently() {
        let mut real = ramp_channel(64, false);
        let mut virt = ramp_channel(64, false);
        virt.is_virtual = true;

        let mut out = SignalBuffer::zeroed(16, 1);
        real.fill_block(&mut out, 0, 16);
        let mut vout = SignalBuffer::zeroed(16, 1);
        virt.fill_block(&mut vout, 0, 16);

        assert!(vout.is_silent());
        assert_eq!(real.position_frames(), virt.position_frames());

        // Promote: the next block picks up where the virtual cursor left off.
        virt.is_virtual = false;
        virt.fill_block(&mut vout, 16, 16);
        real.fill_block(&mut out, 16, 16);
        assert_eq!(vout.sample(0, 0), out.sample(0, 0));
    }

    #[test]
    fn test_paused_holds_position() {
        let mut channel = ramp_channel(8, false);
        channel.eff_paused = true;
        let mut out = SignalBuffer::zeroed(4, 1);
        channel.fill_block(&mut out, 0, 4);
        assert!(out.is_silent());
        assert_eq!(channel.position_frames(), 0);

        channel.eff_paused = false;
        channel.fill_block(&mut out, 4, 4);
        assert_eq!(out.sample(0, 0), 1.0);
    }
}
