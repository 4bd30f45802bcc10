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

//! Asynchronous sound loading.
//!
//! `create_sound` returns immediately; a loader thread decodes the file and
//! publishes the result through a [`LoadCell`] the control context polls
//! (`Unloaded -> Loading -> Loaded | Error`). Fully loaded sounds are decoded
//! to interleaved f32 and resampled to the engine rate; streams decode at
//! their native rate and are rate-converted by the playback cursor.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, info, warn};

use crate::source::{PcmReader, SoundData};

/// Input block size fed to the sinc resampler.
const RESAMPLE_BLOCK_FRAMES: usize = 1024;

/// Load state of an asynchronously created sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    Unloaded = 0,
    Loading = 1,
    Loaded = 2,
    Error = 3,
}

/// Shared cell the loader thread fills in and the control context polls.
pub struct LoadCell {
    state: AtomicU8,
    data: Mutex<Option<Arc<SoundData>>>,
    error: Mutex<Option<String>>,
}

impl LoadCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LoadState::Unloaded as u8),
            data: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoadState {
        match self.state.load(Ordering::Acquire) {
            1 => LoadState::Loading,
            2 => LoadState::Loaded,
            3 => LoadState::Error,
            _ => LoadState::Unloaded,
        }
    }

    /// The decoded data, once `state()` is `Loaded`.
    pub fn data(&self) -> Option<Arc<SoundData>> {
        self.data.lock().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn set_loading(&self) {
        self.state.store(LoadState::Loading as u8, Ordering::Release);
    }

    fn complete(&self, result: Result<Arc<SoundData>, String>) {
        match result {
            Ok(data) => {
                *self.data.lock() = Some(data);
                self.state.store(LoadState::Loaded as u8, Ordering::Release);
            }
            Err(message) => {
                *self.error.lock() = Some(message);
                self.state.store(LoadState::Error as u8, Ordering::Release);
            }
        }
    }
}

impl Default for LoadCell {
    fn default() -> Self {
        Self::new()
    }
}

struct LoadJob {
    path: PathBuf,
    cell: Arc<LoadCell>,
}

/// Owns the loader thread. Jobs are processed in submission order.
pub struct SoundLoader {
    tx: Option<crossbeam_channel::Sender<LoadJob>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SoundLoader {
    /// Creates a loader that decodes into `target_rate`.
    pub fn new(target_rate: u32) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<LoadJob>();
        let worker = thread::Builder::new()
            .name("mixcore-loader".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = load_fully(&job.path, target_rate);
                    match &result {
                        Ok(data) => info!(
                            path = %job.path.display(),
                            channels = data.channel_count(),
                            frames = data.frames(),
                            memory_kb = data.memory_size() / 1024,
                            "Sound loaded"
                        ),
                        Err(e) => warn!(path = %job.path.display(), error = %e, "Sound load failed"),
                    }
                    job.cell.complete(result);
                }
                debug!("Sound loader exited");
            })
            .expect("failed to spawn loader thread");

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Queues a file for decoding. The returned cell transitions to Loading
    /// immediately and to Loaded/Error when the worker finishes.
    pub fn enqueue(&self, path: &Path) -> Arc<LoadCell> {
        let cell = Arc::new(LoadCell::new());
        cell.set_loading();
        if let Some(tx) = &self.tx {
            let _ = tx.send(LoadJob {
                path: path.to_path_buf(),
                cell: cell.clone(),
            });
        }
        cell
    }
}

impl Drop for SoundLoader {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain pending jobs and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Decodes a file completely and resamples it to `target_rate`.
fn load_fully(path: &Path, target_rate: u32) -> Result<Arc<SoundData>, String> {
    let mut reader = FileReader::open(path)?;
    let channels = reader.channel_count();
    let source_rate = reader.sample_rate();

    let mut pcm = Vec::new();
    let mut chunk = Vec::new();
    loop {
        let frames = reader
            .read_frames(&mut chunk, RESAMPLE_BLOCK_FRAMES)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        if frames == 0 {
            break;
        }
        pcm.extend_from_slice(&chunk[..frames * channels as usize]);
    }

    let pcm = if source_rate != target_rate {
        debug!(
            path = %path.display(),
            source_rate,
            target_rate,
            "Resampling sound"
        );
        resample_interleaved(&pcm, channels, source_rate, target_rate)?
    } else {
        pcm
    };

    Ok(Arc::new(SoundData::new(pcm, channels, target_rate)))
}

/// Offline sinc resampling of a whole interleaved buffer.
fn resample_interleaved(
    pcm: &[f32],
    channels: u16,
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, String> {
    let num_channels = channels.max(1) as usize;
    let frames = pcm.len() / num_channels;

    // De-interleave into the planar layout rubato works in.
    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); num_channels];
    for frame in 0..frames {
        for ch in 0..num_channels {
            planar[ch].push(pcm[frame * num_channels + ch]);
        }
    }

    let sinc_params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        oversampling_factor: 128,
        interpolation: SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / source_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        1.0,
        sinc_params,
        RESAMPLE_BLOCK_FRAMES,
        num_channels,
    )
    .map_err(|e| format!("resampler init failed: {e}"))?;

    let mut output: Vec<Vec<f32>> = vec![Vec::new(); num_channels];
    let mut position = 0usize;
    loop {
        let needed = resampler.input_frames_next();
        let remaining = frames - position;
        if remaining < needed {
            break;
        }
        let block: Vec<&[f32]> = planar
            .iter()
            .map(|ch| &ch[position..position + needed])
            .collect();
        let out = resampler
            .process(&block, None)
            .map_err(|e| format!("resampling failed: {e}"))?;
        for (ch, data) in output.iter_mut().zip(out.iter()) {
            ch.extend_from_slice(data);
        }
        position += needed;
    }

    // Flush the tail with a partial block.
    if position < frames {
        let block: Vec<&[f32]> = planar.iter().map(|ch| &ch[position..]).collect();
        let out = resampler
            .process_partial(Some(&block), None)
            .map_err(|e| format!("resampling failed: {e}"))?;
        for (ch, data) in output.iter_mut().zip(out.iter()) {
            ch.extend_from_slice(data);
        }
    }

    // Re-interleave.
    let out_frames = output.first().map(|c| c.len()).unwrap_or(0);
    let mut interleaved = Vec::with_capacity(out_frames * num_channels);
    for frame in 0..out_frames {
        for ch in 0..num_channels {
            interleaved.push(output[ch][frame]);
        }
    }
    Ok(interleaved)
}

/// Sequential symphonia decoder: the [`PcmReader`] used by streams and by
/// the full loader.
pub struct FileReader {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: u16,
    sample_rate: u32,
    length_frames: Option<u64>,
    /// Decoded samples not yet handed out.
    leftover: Vec<f32>,
    finished: bool,
}

impl FileReader {
    /// Opens and probes an audio file.
    pub fn open(path: &Path) -> Result<Self, String> {
        let file =
            File::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| format!("{}: no audio track", path.display()))?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| format!("{}: sample rate unknown", path.display()))?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| format!("{}: channel count unknown", path.display()))?;
        let length_frames = params.n_frames;

        let decoder = get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| format!("{}: {}", path.display(), e))?;

        Ok(Self {
            format_reader,
            decoder,
            track_id,
            channels,
            sample_rate,
            length_frames,
            leftover: Vec::new(),
            finished: false,
        })
    }

    /// Decodes the next packet for our track into interleaved f32.
    /// Returns false at end of file.
    fn decode_packet(&mut self) -> std::io::Result<bool> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                // Some decoders signal EOF with a decode error.
                Err(SymphoniaError::DecodeError(_)) => return Ok(false),
                Err(e) => {
                    return Err(std::io::Error::other(e.to_string()));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => {
                    return Err(std::io::Error::other(e.to_string()));
                }
            };
            if decoded.frames() == 0 {
                continue;
            }
            let mut sample_buf =
                SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            self.leftover.extend_from_slice(sample_buf.samples());
            return Ok(true);
        }
    }
}

impl PcmReader for FileReader {
    fn read_frames(&mut self, out: &mut Vec<f32>, max_frames: usize) -> std::io::Result<usize> {
        out.clear();
        let samples_wanted = max_frames * self.channels as usize;

        while self.leftover.len() < samples_wanted && !self.finished {
            if !self.decode_packet()? {
                self.finished = true;
            }
        }

        let take = samples_wanted.min(self.leftover.len());
        // Hand out whole frames only.
        let take = take - take % self.channels as usize;
        out.extend_from_slice(&self.leftover[..take]);
        self.leftover.drain(..take);
        Ok(take / self.channels as usize)
    }

    fn restart(&mut self) -> bool {
        let seek = self.format_reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: Time::from(std::time::Duration::ZERO),
                track_id: Some(self.track_id),
            },
        );
        match seek {
            Ok(_) => {
                self.decoder.reset();
                self.leftover.clear();
                self.finished = false;
                true
            }
            Err(e) => {
                debug!(error = %e, "Stream restart failed");
                false
            }
        }
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn length_frames(&self) -> Option<u64> {
        self.length_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn test_load_wav_fully() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        testutil::write_test_wav(&path, &testutil::sine(440.0, 48000, 4800), 1, 48000);

        let data = load_fully(&path, 48000).unwrap();
        assert_eq!(data.channel_count(), 1);
        assert_eq!(data.sample_rate(), 48000);
        assert_eq!(data.frames(), 4800);
        let rms = testutil::rms(data.pcm());
        assert!((rms - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.01);
    }

    #[test]
    fn test_load_resamples_to_engine_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone44.wav");
        testutil::write_test_wav(&path, &testutil::sine(440.0, 44100, 44100), 1, 44100);

        let data = load_fully(&path, 48000).unwrap();
        assert_eq!(data.sample_rate(), 48000);
        // One second of audio at the new rate, within resampler tail slack.
        let frames = data.frames() as i64;
        assert!((frames - 48000).abs() < 512, "frames = {frames}");
    }

    #[test]
    fn test_loader_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.wav");
        testutil::write_test_wav(&path, &testutil::sine(220.0, 48000, 480), 1, 48000);

        let loader = SoundLoader::new(48000);
        let cell = loader.enqueue(&path);
        testutil::eventually(
            || cell.state() == LoadState::Loaded,
            "sound never finished loading",
        );
        assert!(cell.data().is_some());
        assert!(cell.error().is_none());
    }

    #[test]
    fn test_loader_reports_missing_file() {
        let loader = SoundLoader::new(48000);
        let cell = loader.enqueue(Path::new("/nonexistent/missing.wav"));
        testutil::eventually(
            || cell.state() == LoadState::Error,
            "missing file never errored",
        );
        assert!(cell.error().is_some());
    }

    #[test]
    fn test_file_reader_streams_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.wav");
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        testutil::write_test_wav(&path, &samples, 1, 48000);

        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.channel_count(), 1);
        assert_eq!(reader.length_frames(), Some(100));

        let mut chunk = Vec::new();
        let frames = reader.read_frames(&mut chunk, 60).unwrap();
        assert_eq!(frames, 60);
        let frames = reader.read_frames(&mut chunk, 60).unwrap();
        assert_eq!(frames, 40);
        let frames = reader.read_frames(&mut chunk, 60).unwrap();
        assert_eq!(frames, 0);

        assert!(reader.restart());
        let frames = reader.read_frames(&mut chunk, 10).unwrap();
        assert_eq!(frames, 10);
        assert!((chunk[0] - 0.0).abs() < 1e-3);
    }
}
