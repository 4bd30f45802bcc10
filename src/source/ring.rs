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

//! Lock-free SPSC ring buffer between a decode producer and the render
//! context.
//!
//! Single producer (the stream's decode thread), single consumer (the render
//! tick). Neither side ever blocks: a full ring makes the producer retry
//! later, an empty ring makes the consumer emit silence.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct FrameRing {
    /// Backing sample storage; capacity is a power of two for cheap masking.
    buffer: Vec<f32>,
    capacity: usize,
    /// Read position in samples (consumer-owned).
    read_pos: AtomicUsize,
    /// Write position in samples (producer-owned).
    write_pos: AtomicUsize,
    /// Set by the producer once no further samples will ever arrive.
    finished: AtomicBool,
    /// Samples per frame.
    channel_count: u16,
}

impl FrameRing {
    /// Creates a ring holding at least `capacity_frames` frames.
    pub fn new(capacity_frames: usize, channel_count: u16) -> Self {
        let samples = (capacity_frames.max(2) * channel_count.max(1) as usize).next_power_of_two();
        Self {
            buffer: vec![0.0; samples],
            capacity: samples,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            channel_count: channel_count.max(1),
        }
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    /// Samples available to read.
    #[inline]
    fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    /// Frames available to read.
    pub fn available_frames(&self) -> usize {
        self.available() / self.channel_count as usize
    }

    /// Frames of free space for the producer.
    pub fn space_frames(&self) -> usize {
        (self.capacity - self.available() - 1) / self.channel_count as usize
    }

    /// Marks the stream complete; the consumer reports end-of-stream once
    /// the remaining samples have been drained.
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Writes whole frames; returns the number of frames accepted.
    /// Producer side only.
    pub fn write_frames(&self, samples: &[f32]) -> usize {
        let channels = self.channel_count as usize;
        let want_frames = samples.len() / channels;
        let frames = want_frames.min(self.space_frames());
        if frames == 0 {
            return 0;
        }
        let to_write = frames * channels;
        let write = self.write_pos.load(Ordering::Acquire);
        let mask = self.capacity - 1;

        // Copy in one or two chunks depending on wrap-around.
        let first = (self.capacity - write).min(to_write);
        unsafe {
            let ptr = self.buffer.as_ptr().add(write) as *mut f32;
            std::ptr::copy_nonoverlapping(samples.as_ptr(), ptr, first);
        }
        if to_write > first {
            unsafe {
                let ptr = self.buffer.as_ptr() as *mut f32;
                std::ptr::copy_nonoverlapping(samples.as_ptr().add(first), ptr, to_write - first);
            }
        }

        self.write_pos
            .store((write + to_write) & mask, Ordering::Release);
        frames
    }

    /// Reads whole frames; returns the number of frames produced.
    /// Consumer side only.
    pub fn read_frames(&self, output: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channel_count as usize;
        let frames = max_frames
            .min(self.available_frames())
            .min(output.len() / channels);
        if frames == 0 {
            return 0;
        }
        let to_read = frames * channels;
        let read = self.read_pos.load(Ordering::Acquire);
        let mask = self.capacity - 1;

        let first = (self.capacity - read).min(to_read);
        unsafe {
            let ptr = self.buffer.as_ptr().add(read);
            std::ptr::copy_nonoverlapping(ptr, output.as_mut_ptr(), first);
        }
        if to_read > first {
            unsafe {
                let ptr = self.buffer.as_ptr();
                std::ptr::copy_nonoverlapping(ptr, output.as_mut_ptr().add(first), to_read - first);
            }
        }

        self.read_pos
            .store((read + to_read) & mask, Ordering::Release);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let ring = FrameRing::new(8, 2);
        let frames = ring.write_frames(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(frames, 2);
        assert_eq!(ring.available_frames(), 2);

        let mut out = vec![0.0; 4];
        let read = ring.read_frames(&mut out, 4);
        assert_eq!(read, 2);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.available_frames(), 0);
    }

    #[test]
    fn test_wraparound() {
        let ring = FrameRing::new(4, 1);
        let mut out = vec![0.0; 16];

        // Cycle enough data through to force the positions to wrap.
        for round in 0..10 {
            let base = round as f32 * 3.0;
            let wrote = ring.write_frames(&[base, base + 1.0, base + 2.0]);
            assert_eq!(wrote, 3);
            let read = ring.read_frames(&mut out, 3);
            assert_eq!(read, 3);
            assert_eq!(&out[..3], &[base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn test_full_ring_rejects_writes() {
        let ring = FrameRing::new(2, 2);
        // Capacity rounds up to a power of two; fill whatever space exists.
        let space = ring.space_frames();
        let data = vec![0.5; (space + 4) * 2];
        assert_eq!(ring.write_frames(&data), space);
        assert_eq!(ring.space_frames(), 0);
        assert_eq!(ring.write_frames(&[1.0, 1.0]), 0);
    }

    #[test]
    fn test_finished_flag() {
        let ring = FrameRing::new(4, 1);
        assert!(!ring.is_finished());
        ring.set_finished();
        assert!(ring.is_finished());
    }
}
