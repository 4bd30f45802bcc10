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

//! CPAL output backend.
//!
//! The ticker pushes rendered blocks into a lock-free ring; the CPAL
//! callback drains it, zero-filling on shortfall so the hardware never
//! starves the render thread or vice versa.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info};

use super::OutputBackend;
use crate::buffer::SignalBuffer;
use crate::source::FrameRing;

/// Ring capacity in blocks: enough to decouple callback jitter from the
/// ticker without adding meaningful latency.
const RING_BLOCKS: usize = 4;

/// Lists cpal output devices across all hosts.
pub fn list_devices() -> Result<Vec<String>, Box<dyn Error>> {
    // Suppress noisy driver probing output.
    let _shh_stdout = shh::stdout()?;
    let _shh_stderr = shh::stderr()?;

    let mut names = Vec::new();
    for host_id in cpal::available_hosts() {
        let host = cpal::host_from_id(host_id)?;
        let devices = match host.devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!(err = e.to_string(), host = host_id.name(), "Unable to list devices for host");
                continue;
            }
        };
        for device in devices {
            if device.supported_output_configs().map(|mut c| c.next().is_some()).unwrap_or(false) {
                names.push(format!(
                    "{} ({})",
                    device.name().unwrap_or_else(|_| "unknown".into()),
                    host_id.name()
                ));
            }
        }
    }
    Ok(names)
}

/// A cpal-backed output device.
pub struct CpalBackend {
    name: String,
    ring: Arc<FrameRing>,
    // Held to keep the stream thread (and with it the stream) alive.
    _stream_thread: thread::JoinHandle<()>,
    block_duration: Duration,
}

impl CpalBackend {
    /// Opens the named device (or the default output device) at the
    /// engine's format.
    pub fn open(
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
        block_frames: usize,
    ) -> Result<CpalBackend, Box<dyn Error>> {
        let device = Self::find_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "unknown".into());

        let ring = Arc::new(FrameRing::new(block_frames * RING_BLOCKS, channels));
        let callback_ring = ring.clone();

        let config = cpal::StreamConfig {
            channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        // The stream is created and parked on its own thread: cpal streams
        // are not Send on all hosts.
        let stream_thread = thread::Builder::new()
            .name("mixcore-cpal".into())
            .spawn(move || {
                let channels = config.channels as usize;
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        let read = callback_ring.read_frames(data, frames);
                        data[read * channels..].fill(0.0);
                    },
                    |err| error!("CPAL output stream error: {}", err),
                    None,
                );
                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            error!("Failed to start CPAL stream: {}", e);
                            return;
                        }
                        info!("CPAL output stream started");
                        loop {
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                    Err(e) => error!("Failed to create CPAL stream: {}", e),
                }
            })?;

        Ok(CpalBackend {
            name,
            ring,
            _stream_thread: stream_thread,
            block_duration: Duration::from_secs_f64(block_frames as f64 / sample_rate as f64),
        })
    }

    fn find_device(device_name: Option<&str>) -> Result<cpal::Device, Box<dyn Error>> {
        let _shh_stdout = shh::stdout()?;
        let _shh_stderr = shh::stderr()?;

        let host = cpal::default_host();
        match device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| "no default output device".into()),
            Some(name) => {
                for device in host.devices()? {
                    if device.name().map(|n| n == name).unwrap_or(false) {
                        return Ok(device);
                    }
                }
                Err(format!("output device '{}' not found", name).into())
            }
        }
    }
}

impl OutputBackend for CpalBackend {
    fn push_block(&mut self, block: &SignalBuffer) -> Result<(), Box<dyn Error>> {
        // Wait for ring space, bounded by a few block durations so a dead
        // stream degrades to dropped audio instead of a wedged ticker.
        let samples = block.samples();
        let mut offset = 0usize;
        let channels = block.channels() as usize;
        let deadline = std::time::Instant::now() + self.block_duration * 4;

        while offset < samples.len() {
            let wrote = self.ring.write_frames(&samples[offset..]);
            offset += wrote * channels;
            if offset < samples.len() {
                if std::time::Instant::now() > deadline {
                    return Ok(());
                }
                thread::sleep(self.block_duration / 8);
            }
        }
        Ok(())
    }
}

impl fmt::Display for CpalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (CPAL)", self.name)
    }
}
