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

//! Streaming sources: a producer thread decodes ahead into a lock-free ring
//! while the render context pulls from it.
//!
//! The render tick never blocks on the producer. If the ring underruns, the
//! source substitutes silence for the missing frames and counts the underrun;
//! the rest of the mix is unaffected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::ring::FrameRing;
use super::traits::{PcmSource, Pull};

/// Chunk size (in frames) the producer decodes per iteration.
const PRODUCER_CHUNK_FRAMES: usize = 1024;

/// How long the producer sleeps when the ring is full.
const PRODUCER_BACKOFF: Duration = Duration::from_millis(2);

/// Sequential decoder driven by the producer thread. Implemented by the
/// sound bank on top of symphonia; kept abstract so tests can stream
/// synthetic PCM.
pub trait PcmReader: Send {
    /// Decodes up to `max_frames` interleaved frames into `out`. Returns the
    /// number of frames produced; 0 means end of file.
    fn read_frames(&mut self, out: &mut Vec<f32>, max_frames: usize) -> std::io::Result<usize>;

    /// Restarts decoding from the beginning. Returns false if the reader
    /// cannot seek, in which case a looping stream ends instead.
    fn restart(&mut self) -> bool;

    fn channel_count(&self) -> u16;

    fn sample_rate(&self) -> u32;

    fn length_frames(&self) -> Option<u64>;
}

/// Owns the decode thread for one streaming playback.
pub struct StreamProducer {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl StreamProducer {
    /// Spawns the decode-ahead thread. `looping` restarts the reader at end
    /// of file instead of finishing the ring.
    pub fn spawn(mut reader: Box<dyn PcmReader>, ring: Arc<FrameRing>, looping: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name("mixcore-stream".into())
            .spawn(move || {
                let mut chunk: Vec<f32> = Vec::new();
                let mut pending = 0usize; // samples of `chunk` not yet accepted by the ring
                let mut offset = 0usize;

                loop {
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }

                    if pending == 0 {
                        offset = 0;
                        match reader.read_frames(&mut chunk, PRODUCER_CHUNK_FRAMES) {
                            Ok(0) => {
                                if looping && reader.restart() {
                                    continue;
                                }
                                ring.set_finished();
                                break;
                            }
                            Ok(frames) => {
                                pending = frames * reader.channel_count() as usize;
                            }
                            Err(e) => {
                                warn!(error = %e, "Stream decode failed, ending stream");
                                ring.set_finished();
                                break;
                            }
                        }
                    }

                    let wrote = ring.write_frames(&chunk[offset..offset + pending]);
                    let wrote_samples = wrote * reader.channel_count() as usize;
                    offset += wrote_samples;
                    pending -= wrote_samples;

                    if wrote == 0 {
                        thread::sleep(PRODUCER_BACKOFF);
                    }
                }
                debug!("Stream producer exited");
            })
            .expect("failed to spawn stream producer thread");

        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Render-context view of a stream: pulls decoded frames from the ring.
pub struct StreamingSource {
    ring: Arc<FrameRing>,
    /// Keeps the producer alive for the lifetime of the playback.
    _producer: StreamProducer,
    sample_rate: u32,
    length_frames: Option<u64>,
    underruns: Arc<AtomicU64>,
}

impl StreamingSource {
    pub fn new(
        ring: Arc<FrameRing>,
        producer: StreamProducer,
        sample_rate: u32,
        length_frames: Option<u64>,
    ) -> Self {
        Self {
            ring,
            _producer: producer,
            sample_rate,
            length_frames,
            underruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared underrun counter, readable from the metrics snapshot.
    pub fn underrun_counter(&self) -> Arc<AtomicU64> {
        self.underruns.clone()
    }
}

impl PcmSource for StreamingSource {
    fn pull_frames(&mut self, out: &mut [f32], max_frames: usize) -> Pull {
        let channels = self.ring.channel_count() as usize;
        let read = self.ring.read_frames(out, max_frames);

        if read < max_frames {
            if self.ring.is_finished() {
                return Pull {
                    frames: read,
                    end_of_stream: self.ring.available_frames() == 0,
                };
            }
            // Producer fell behind: substitute silence rather than stalling
            // the tick. A dropped tick is audible everywhere; a dropped
            // stream chunk is not.
            out[read * channels..max_frames * channels].fill(0.0);
            self.underruns.fetch_add(1, Ordering::Relaxed);
            return Pull {
                frames: max_frames,
                end_of_stream: false,
            };
        }

        Pull {
            frames: read,
            end_of_stream: false,
        }
    }

    fn channel_count(&self) -> u16 {
        self.ring.channel_count()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_frames(&self) -> Option<u64> {
        self.length_frames
    }

    fn rewind(&mut self) -> bool {
        // Looping is handled inside the producer; the consumer cannot seek.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Streams a fixed ramp of mono frames.
    struct RampReader {
        next: u32,
        total: u32,
        restarts: u32,
    }

    impl PcmReader for RampReader {
        fn read_frames(&mut self, out: &mut Vec<f32>, max_frames: usize) -> std::io::Result<usize> {
            out.clear();
            let remaining = (self.total - self.next).min(max_frames as u32);
            for _ in 0..remaining {
                out.push(self.next as f32);
                self.next += 1;
            }
            Ok(remaining as usize)
        }

        fn restart(&mut self) -> bool {
            self.next = 0;
            self.restarts += 1;
            true
        }

        fn channel_count(&self) -> u16 {
            1
        }

        fn sample_rate(&self) -> u32 {
            48000
        }

        fn length_frames(&self) -> Option<u64> {
            Some(self.total as u64)
        }
    }

    #[test]
    fn test_stream_drains_to_end() {
        let ring = Arc::new(FrameRing::new(256, 1));
        let reader = RampReader {
            next: 0,
            total: 100,
            restarts: 0,
        };
        let producer = StreamProducer::spawn(Box::new(reader), ring.clone(), false);
        let mut source = StreamingSource::new(ring, producer, 48000, Some(100));

        let mut collected = Vec::new();
        let mut out = vec![0.0; 32];
        for _ in 0..100 {
            let pull = source.pull_frames(&mut out, 32);
            collected.extend_from_slice(&out[..pull.frames]);
            if pull.end_of_stream {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(collected.len(), 100);
        assert_eq!(collected[0], 0.0);
        assert_eq!(collected[99], 99.0);
    }

    #[test]
    fn test_underrun_produces_silence() {
        // A producer that never writes: an empty, unfinished ring.
        let ring = Arc::new(FrameRing::new(64, 2));
        let reader = RampReader {
            next: 0,
            total: 0,
            restarts: 0,
        };
        // total=0 finishes immediately; instead build the source around a
        // ring we never feed and keep `finished` unset by not spawning.
        let producer = StreamProducer::spawn(Box::new(reader), Arc::new(FrameRing::new(4, 1)), false);
        let mut source = StreamingSource::new(ring, producer, 48000, None);

        let mut out = vec![1.0; 16];
        let pull = source.pull_frames(&mut out, 8);
        assert_eq!(pull.frames, 8);
        assert!(!pull.end_of_stream);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(source.underrun_counter().load(Ordering::Relaxed), 1);
    }
}
