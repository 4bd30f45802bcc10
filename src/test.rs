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

//! End-to-end engine tests, driving the mixer tick manually.

use std::sync::Arc;

use crate::buffer::SignalBuffer;
use crate::dsp::{filter, oscillator, DspType};
use crate::error::EngineError;
use crate::graph::{
    BlockProcessor, DspDescriptor, MixMatrix, ParamValue, ProcessContext, ProcessFault,
};
use crate::render::{Mixer, SystemState};
use crate::source::{PcmSource, Pull, SourceFactory, SourceInfo};
use crate::spatial::Vector3;
use crate::system::{Mode, System};
use crate::EngineConfig;

const CENTER_PAN: f32 = std::f32::consts::FRAC_1_SQRT_2;

fn engine(config: EngineConfig) -> (System, Mixer) {
    System::new(&config).expect("engine construction failed")
}

fn small_config() -> EngineConfig {
    EngineConfig::default()
        .with_sample_rate(48000)
        .with_block_frames(256)
        .with_rerank_interval_blocks(1)
}

/// A mono sound holding a constant value.
fn dc_sound(system: &System, value: f32, frames: usize) -> crate::system::Sound {
    system
        .create_sound_from_pcm(vec![value; frames], 1, 48000, Mode::DEFAULT)
        .unwrap()
}

/// Ticks `blocks` times, concatenating the interleaved output.
fn collect(mixer: &mut Mixer, blocks: usize) -> Vec<f32> {
    let mut samples = Vec::new();
    for _ in 0..blocks {
        samples.extend_from_slice(mixer.tick().samples());
    }
    samples
}

fn first_audible_frame(samples: &[f32], channels: usize) -> Option<usize> {
    samples
        .iter()
        .position(|s| s.abs() > 1e-6)
        .map(|i| i / channels)
}

#[test]
fn test_cycle_rejected_and_topology_unchanged() {
    let (system, _mixer) = engine(small_config());
    let a = system.create_dsp(DspType::LowPass).unwrap();
    let b = system.create_dsp(DspType::Echo).unwrap();
    let c = system.create_dsp(DspType::Flange).unwrap();

    let ab = system.connect(&a, &b).unwrap();
    let bc = system.connect(&b, &c).unwrap();

    // Closing the loop in either direction must fail.
    assert!(matches!(
        system.connect(&c, &a),
        Err(EngineError::CycleDetected)
    ));
    assert!(matches!(
        system.connect(&b, &a),
        Err(EngineError::CycleDetected)
    ));
    // Self-edges are cycles too.
    assert!(matches!(
        system.connect(&a, &a),
        Err(EngineError::CycleDetected)
    ));

    // The rejected calls left the existing edges intact and removable.
    assert!(system.disconnect(&ab).is_ok());
    assert!(system.disconnect(&bc).is_ok());

    // With the path gone, the formerly cyclic edge is legal.
    assert!(system.connect(&c, &a).is_ok());
}

#[test]
fn test_connect_disconnect_roundtrip() {
    let (system, _mixer) = engine(small_config());
    let a = system.create_dsp(DspType::LowPass).unwrap();
    let b = system.create_dsp(DspType::Echo).unwrap();

    let conn = system.connect(&a, &b).unwrap();
    conn.set_mix(0.5).unwrap();
    system.disconnect(&conn).unwrap();

    // The handle is gone; the graph accepts the same edge fresh.
    assert!(matches!(
        conn.set_mix(1.0),
        Err(EngineError::InvalidHandle)
    ));
    let again = system.connect(&a, &b).unwrap();
    assert_eq!(again.get_mix().unwrap(), 1.0);
}

#[test]
fn test_stop_invalidates_handle() {
    let (system, mut mixer) = engine(small_config());
    let sound = dc_sound(&system, 1.0, 48000);
    let channel = system.play_sound(&sound, None, false).unwrap();
    mixer.tick();

    assert!(channel.is_playing());
    channel.stop().unwrap();

    // stop() is idempotent; everything else on the dead handle fails.
    assert!(channel.stop().is_ok());
    assert!(matches!(
        channel.set_volume(0.5),
        Err(EngineError::InvalidHandle)
    ));
    assert!(matches!(
        channel.set_paused(true),
        Err(EngineError::InvalidHandle)
    ));
    assert!(matches!(
        channel.get_delay(),
        Err(EngineError::InvalidHandle)
    ));
    assert!(!channel.is_playing());
}

#[test]
fn test_finished_channel_invalidates_handle() {
    let (system, mut mixer) = engine(small_config());
    // Shorter than one block: finishes on the first tick.
    let sound = dc_sound(&system, 1.0, 100);
    let channel = system.play_sound(&sound, None, false).unwrap();

    mixer.tick();
    mixer.tick();

    // The mixer reclaimed the channel; the very next control call sees a
    // stale handle.
    assert!(matches!(
        channel.set_volume(0.5),
        Err(EngineError::InvalidHandle)
    ));
    assert_eq!(system.metrics().channels_playing, 0);
}

#[test]
fn test_scheduled_start_is_block_size_independent() {
    let start_at: u64 = 1000;
    for block in [256usize, 512, 2048] {
        let config = EngineConfig::default()
            .with_sample_rate(48000)
            .with_block_frames(block);
        let (system, mut mixer) = engine(config);
        let sound = dc_sound(&system, 1.0, 48000);
        let channel = system.play_sound(&sound, None, false).unwrap();
        channel.set_delay(Some(start_at), None, false).unwrap();

        let samples = collect(&mut mixer, 4096 / block + 1);
        let first = first_audible_frame(&samples, 2).expect("no audio rendered");
        assert_eq!(
            first as u64, start_at,
            "activation off for block size {block}"
        );
    }
}

#[test]
fn test_scheduled_end_cuts_exactly() {
    let (system, mut mixer) = engine(small_config());
    let sound = dc_sound(&system, 1.0, 48000);
    let channel = system.play_sound(&sound, None, false).unwrap();
    channel.set_delay(Some(100), Some(400), true).unwrap();

    let samples = collect(&mut mixer, 3);
    let frames: Vec<bool> = samples.chunks(2).map(|f| f[0].abs() > 1e-6).collect();
    assert!(!frames[99]);
    assert!(frames[100]);
    assert!(frames[399]);
    assert!(!frames[400]);

    // stop_at_end reclaimed the channel.
    system.update().unwrap();
    assert!(!channel.is_playing());
}

#[test]
fn test_volume_composition_is_multiplicative() {
    let measure = |group_volume: f32, channel_volume: f32| -> f32 {
        let (system, mut mixer) = engine(small_config());
        let group = system.create_channel_group("bus").unwrap();
        let sound = dc_sound(&system, 1.0, 48000);
        let channel = system.play_sound(&sound, Some(&group), false).unwrap();
        channel.set_volume(channel_volume).unwrap();
        group.set_volume(group_volume).unwrap();

        let samples = collect(&mut mixer, 2);
        // Steady-state sample from the second block.
        samples[samples.len() - 2]
    };

    let baseline = measure(1.0, 1.0);
    let halved = measure(0.5, 0.5);
    assert!((baseline - CENTER_PAN).abs() < 1e-3, "baseline {baseline}");
    assert!(
        (halved / baseline - 0.25).abs() < 1e-4,
        "composition ratio {}",
        halved / baseline
    );
}

#[test]
fn test_group_pitch_scales_cursor() {
    let (system, mut mixer) = engine(small_config());
    let group = system.create_channel_group("pitched").unwrap();
    let ramp: Vec<f32> = (0..48000).map(|i| (i + 1) as f32).collect();
    let sound = system
        .create_sound_from_pcm(ramp, 1, 48000, Mode::DEFAULT)
        .unwrap();
    let channel = system.play_sound(&sound, Some(&group), false).unwrap();
    channel.set_volume(1.0).unwrap();
    group.set_pitch(2.0).unwrap();

    let samples = collect(&mut mixer, 1);
    // At double pitch the cursor reads every other source frame.
    for k in [1usize, 10, 100] {
        let expected = (2 * k + 1) as f32 * CENTER_PAN;
        let got = samples[k * 2];
        assert!(
            (got - expected).abs() < 1e-2,
            "frame {k}: got {got}, expected {expected}"
        );
    }
}

#[test]
fn test_virtualization_budget_and_promotion() {
    let config = small_config().with_real_voices(2);
    let (system, mut mixer) = engine(config);

    let sound = dc_sound(&system, 1.0, 480000);
    let mut channels = Vec::new();
    for volume in [0.9f32, 0.8, 0.2, 0.1] {
        let channel = system.play_sound(&sound, None, false).unwrap();
        channel.set_looping(true).unwrap();
        channel.set_volume(volume).unwrap();
        channels.push(channel);
    }

    let samples = collect(&mut mixer, 2);
    let metrics = system.metrics();
    assert_eq!(metrics.channels_playing, 4);
    assert_eq!(metrics.real_channels, 2);

    // Only the two loudest are audible in the mix.
    let expected = (0.9 + 0.8) * CENTER_PAN;
    let got = samples[samples.len() - 2];
    assert!((got - expected).abs() < 1e-2, "mix {got} vs {expected}");

    // A formerly quiet channel outranking the rest is promoted within one
    // re-rank interval (configured to every block).
    channels[3].set_volume(1.0).unwrap();
    mixer.tick();
    let samples = collect(&mut mixer, 1);
    let expected = (1.0 + 0.9) * CENTER_PAN;
    let got = samples[samples.len() - 2];
    assert!((got - expected).abs() < 1e-2, "mix {got} vs {expected}");
    assert_eq!(system.metrics().real_channels, 2);
}

#[test]
fn test_channel_capacity_is_enforced() {
    let config = small_config().with_max_channels(2);
    let (system, _mixer) = engine(config);
    let sound = dc_sound(&system, 1.0, 48000);

    let _a = system.play_sound(&sound, None, false).unwrap();
    let _b = system.play_sound(&sound, None, false).unwrap();
    assert!(matches!(
        system.play_sound(&sound, None, false),
        Err(EngineError::CapacityExceeded { .. })
    ));
}

#[test]
fn test_group_mute_and_pause_compose() {
    let (system, mut mixer) = engine(small_config());
    let group = system.create_channel_group("muted").unwrap();
    let sound = dc_sound(&system, 1.0, 48000);
    let _channel = system.play_sound(&sound, Some(&group), false).unwrap();

    group.set_mute(true).unwrap();
    let samples = collect(&mut mixer, 2);
    assert!(samples.iter().all(|s| s.abs() < 1e-6));
    assert!(group.get_mute().unwrap());

    group.set_mute(false).unwrap();
    group.set_paused(true).unwrap();
    // Paused channels hold position and render silence.
    collect(&mut mixer, 1);
    let clock_before = system.metrics().clock_samples;
    let samples = collect(&mut mixer, 1);
    assert!(samples.iter().all(|s| s.abs() < 1e-6));
    assert!(system.metrics().clock_samples > clock_before);
}

#[test]
fn test_suspend_freezes_clock_and_output() {
    let (system, mut mixer) = engine(small_config());
    let sound = dc_sound(&system, 1.0, 48000);
    let _channel = system.play_sound(&sound, None, false).unwrap();

    collect(&mut mixer, 2);
    let clock = system.dsp_clock();

    system.mixer_suspend().unwrap();
    assert_eq!(system.state(), SystemState::Suspended);
    let samples = collect(&mut mixer, 3);
    assert!(samples.iter().all(|s| *s == 0.0));
    assert_eq!(system.dsp_clock(), clock);

    system.mixer_resume().unwrap();
    assert_eq!(system.state(), SystemState::Running);
    let samples = collect(&mut mixer, 1);
    assert!(samples.iter().any(|s| s.abs() > 0.1));
    assert!(system.dsp_clock() > clock);
}

#[test]
fn test_lowpass_on_channel_chain() {
    let (system, mut mixer) = engine(small_config());
    // A Nyquist-adjacent square-ish signal: alternating +-1.
    let pcm: Vec<f32> = (0..48000).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
    let sound = system
        .create_sound_from_pcm(pcm, 1, 48000, Mode::DEFAULT)
        .unwrap();
    let channel = system.play_sound(&sound, None, false).unwrap();

    let lowpass = system.create_dsp(DspType::LowPass).unwrap();
    lowpass
        .set_parameter_float(filter::PARAM_CUTOFF, 200.0)
        .unwrap();
    channel.add_dsp(0, &lowpass).unwrap();

    let samples = collect(&mut mixer, 4);
    // A 24kHz alternation through a 200Hz lowpass all but vanishes.
    let tail = &samples[samples.len() / 2..];
    let rms = (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt();
    assert!(rms < 0.05, "lowpass left rms {rms}");

    // Bypass restores the signal.
    lowpass.set_bypass(true).unwrap();
    let samples = collect(&mut mixer, 2);
    let tail = &samples[samples.len() / 2..];
    let rms = (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt();
    assert!(rms > 0.3, "bypass left rms {rms}");
}

#[test]
fn test_faulting_custom_dsp_is_bypassed() {
    struct PanicAfter {
        remaining: u32,
    }
    impl BlockProcessor for PanicAfter {
        fn process(
            &mut self,
            _ctx: &ProcessContext,
            input: &SignalBuffer,
            output: &mut SignalBuffer,
        ) -> Result<(), ProcessFault> {
            if self.remaining == 0 {
                panic!("synthetic fault");
            }
            self.remaining -= 1;
            output.copy_from(input);
            Ok(())
        }
        fn set_param(&mut self, _index: usize, _value: &ParamValue) {}
        fn reset(&mut self) {}
    }

    let description = crate::dsp::CustomDspDescription::new(
        DspDescriptor {
            name: "panics".into(),
            params: vec![],
            output_channels: None,
        },
        || Box::new(PanicAfter { remaining: 2 }),
    );

    let (system, mut mixer) = engine(small_config());
    let sound = dc_sound(&system, 1.0, 48000);
    let channel = system.play_sound(&sound, None, false).unwrap();
    let dsp = system.create_dsp_custom(&description).unwrap();
    channel.add_dsp(0, &dsp).unwrap();

    // Two clean blocks, then the fault; the mix must keep flowing.
    let samples = collect(&mut mixer, 4);
    assert!(samples[samples.len() - 2].abs() > 0.1);
    system.update().unwrap();
    assert!(dsp.is_faulted().unwrap());
    assert_eq!(system.metrics().faults, 1);
    assert!(channel.is_playing());
}

#[test]
fn test_oscillator_play_dsp() {
    let (system, mut mixer) = engine(small_config());
    let dsp = system.create_dsp(DspType::Oscillator).unwrap();
    dsp.set_parameter_float(oscillator::PARAM_RATE, 440.0).unwrap();
    let channel = system.play_dsp(&dsp, None, false).unwrap();

    let samples = collect(&mut mixer, 2);
    let block = mixer.block_frames();
    // Second block: phase continued from the first.
    for k in 0..8 {
        let t = (block + k) as f32 / 48000.0;
        let expected = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * CENTER_PAN;
        let got = samples[(block + k) * 2];
        assert!(
            (got - expected).abs() < 1e-3,
            "frame {k}: got {got}, expected {expected}"
        );
    }

    channel.stop().unwrap();
    // A stopped generator leaves the unit available for reuse.
    system.update().unwrap();
    assert!(system.play_dsp(&dsp, None, false).is_ok());
}

#[test]
fn test_user_source_factory_plays() {
    struct Ramp {
        at: u32,
    }
    impl PcmSource for Ramp {
        fn pull_frames(&mut self, out: &mut [f32], max_frames: usize) -> Pull {
            for frame in out.iter_mut().take(max_frames) {
                *frame = self.at as f32;
                self.at += 1;
            }
            Pull {
                frames: max_frames,
                end_of_stream: false,
            }
        }
        fn channel_count(&self) -> u16 {
            1
        }
        fn sample_rate(&self) -> u32 {
            48000
        }
        fn length_frames(&self) -> Option<u64> {
            None
        }
        fn rewind(&mut self) -> bool {
            self.at = 0;
            true
        }
    }

    struct RampFactory;
    impl SourceFactory for RampFactory {
        fn describe(&self) -> SourceInfo {
            SourceInfo {
                channel_count: 1,
                sample_rate: 48000,
                length_frames: None,
            }
        }
        fn open(&self) -> Box<dyn PcmSource> {
            Box::new(Ramp { at: 0 })
        }
    }

    let (system, mut mixer) = engine(small_config());
    let sound = system
        .create_sound_from_factory(Arc::new(RampFactory), Mode::DEFAULT)
        .unwrap();
    let _channel = system.play_sound(&sound, None, false).unwrap();

    let samples = collect(&mut mixer, 1);
    assert!((samples[2] - 1.0 * CENTER_PAN).abs() < 1e-3);
    assert!((samples[20] - 10.0 * CENTER_PAN).abs() < 1e-3);
}

#[test]
fn test_mix_matrix_validation_and_routing() {
    let (system, mut mixer) = engine(small_config());
    let sound = dc_sound(&system, 1.0, 48000);
    let channel = system.play_sound(&sound, None, false).unwrap();

    // Wrong source-side channel count is refused synchronously.
    let bad = MixMatrix::new(vec![1.0, 0.0, 0.0], 3, 1).unwrap();
    assert!(matches!(
        channel.set_mix_matrix(Some(bad)),
        Err(EngineError::FormatMismatch { expected: 2, actual: 1 })
    ));

    // Route everything to the left output only.
    let left_only = MixMatrix::new(vec![1.0, 1.0, 0.0, 0.0], 2, 2).unwrap();
    channel.set_mix_matrix(Some(left_only)).unwrap();
    let samples = collect(&mut mixer, 2);
    let frame = &samples[samples.len() - 2..];
    assert!(frame[0].abs() > 0.5, "left should carry signal");
    assert!(frame[1].abs() < 1e-6, "right should be silent");
}

#[test]
fn test_3d_attenuation_feeds_mix_and_ranking() {
    let (system, mut mixer) = engine(small_config());
    let sound = system
        .create_sound_from_pcm(
            vec![1.0; 48000],
            1,
            48000,
            Mode {
                looping: true,
                spatial: true,
            },
        )
        .unwrap();
    sound.set_3d_min_max_distance(1.0, 1000.0).unwrap();
    let channel = system.play_sound(&sound, None, false).unwrap();

    // Four units straight ahead: quarter gain, centered.
    channel
        .set_3d_attributes(Vector3::new(0.0, 0.0, 4.0), Vector3::ZERO)
        .unwrap();
    let samples = collect(&mut mixer, 2);
    let frame = &samples[samples.len() - 2..];
    let total = frame[0] + frame[1];
    assert!((total - 0.25 * 2.0 * CENTER_PAN).abs() < 1e-2, "total {total}");

    // Beyond max distance: inaudible.
    channel
        .set_3d_attributes(Vector3::new(0.0, 0.0, 2000.0), Vector3::ZERO)
        .unwrap();
    let samples = collect(&mut mixer, 2);
    assert!(samples[samples.len() - 2].abs() < 1e-6);
}

#[test]
fn test_concurrent_mutation_with_running_render() {
    let (system, mut mixer) = engine(small_config());
    let sound = dc_sound(&system, 0.5, 4800);

    let render = std::thread::spawn(move || {
        for _ in 0..400 {
            mixer.tick();
        }
        mixer
    });

    // 1000 interleaved control operations racing the render loop.
    let mut channels = Vec::new();
    let mut dsps = Vec::new();
    for i in 0..1000u32 {
        match i % 5 {
            0 => {
                if let Ok(channel) = system.play_sound(&sound, None, false) {
                    channels.push(channel);
                }
            }
            1 => {
                if let Some(channel) = channels.pop() {
                    let _ = channel.stop();
                }
            }
            2 => {
                let dsp = system.create_dsp(DspType::LowPass).unwrap();
                let _ = dsp.set_parameter_float(filter::PARAM_CUTOFF, 400.0 + i as f32);
                dsps.push(dsp);
            }
            3 => {
                if dsps.len() >= 2 {
                    let a = &dsps[dsps.len() - 2];
                    let b = &dsps[dsps.len() - 1];
                    if let Ok(conn) = system.connect(a, b) {
                        let _ = system.disconnect(&conn);
                    }
                }
            }
            _ => {
                for channel in &channels {
                    let _ = channel.set_volume(0.25);
                }
                system.update().unwrap();
            }
        }
    }

    let mut mixer = render.join().expect("render thread panicked");
    // The engine is still consistent: a fresh play renders.
    for channel in channels.drain(..) {
        let _ = channel.stop();
    }
    let channel = system.play_sound(&sound, None, false).unwrap();
    mixer.tick();
    let samples = collect(&mut mixer, 1);
    assert!(samples.iter().any(|s| s.abs() > 0.1));
    assert!(channel.is_playing());
}

#[test]
fn test_group_release_moves_members_to_master() {
    let (system, mut mixer) = engine(small_config());
    let group = system.create_channel_group("doomed").unwrap();
    let sound = dc_sound(&system, 1.0, 480000);
    let channel = system.play_sound(&sound, Some(&group), false).unwrap();
    channel.set_looping(true).unwrap();
    collect(&mut mixer, 1);

    group.release().unwrap();
    assert!(matches!(
        group.set_volume(0.5),
        Err(EngineError::InvalidHandle)
    ));

    // The channel survived the release and still renders via the master.
    let samples = collect(&mut mixer, 2);
    assert!(samples[samples.len() - 2].abs() > 0.5);
    assert!(channel.is_playing());
}

#[test]
fn test_master_group_cannot_be_released() {
    let (system, _mixer) = engine(small_config());
    let master = system.master_group();
    assert!(matches!(
        master.release(),
        Err(EngineError::InvalidParam(_))
    ));
}

#[test]
fn test_dsp_parameter_validation() {
    let (system, _mixer) = engine(small_config());
    let dsp = system.create_dsp(DspType::LowPass).unwrap();

    // Out-of-range index and value both fail synchronously.
    assert!(matches!(
        dsp.set_parameter_float(99, 1000.0),
        Err(EngineError::InvalidParam(_))
    ));
    assert!(matches!(
        dsp.set_parameter_float(filter::PARAM_CUTOFF, 1_000_000.0),
        Err(EngineError::InvalidParam(_))
    ));
    // Wrong type for the index fails too.
    assert!(matches!(
        dsp.set_parameter_int(filter::PARAM_CUTOFF, 3),
        Err(EngineError::InvalidParam(_))
    ));

    dsp.set_parameter_float(filter::PARAM_CUTOFF, 1234.0).unwrap();
    assert_eq!(
        dsp.get_parameter(filter::PARAM_CUTOFF).unwrap(),
        ParamValue::Float(1234.0)
    );

    let info = dsp.parameter_info(filter::PARAM_CUTOFF).unwrap();
    assert_eq!(info.name, "cutoff");
}

#[test]
fn test_streaming_sound_plays_and_ends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.wav");
    crate::testutil::write_test_wav(&path, &vec![0.5f32; 2000], 1, 48000);

    let (system, mut mixer) = engine(small_config());
    let sound = system.create_stream(&path, Mode::DEFAULT).unwrap();
    assert_eq!(sound.sample_rate().unwrap(), 48000);
    assert_eq!(sound.length_frames().unwrap(), Some(2000));

    let channel = system.play_sound(&sound, None, false).unwrap();
    // Let the producer thread buffer the (small) file completely.
    crate::testutil::eventually(
        || system.update().is_ok() && channel.is_playing(),
        "channel never started",
    );
    std::thread::sleep(std::time::Duration::from_millis(50));

    let samples = collect(&mut mixer, 10);
    let first = first_audible_frame(&samples, 2).expect("stream produced no audio");
    assert_eq!(first, 0);

    // 2000 frames of signal, then silence, then reclamation.
    assert!(samples[1999 * 2].abs() > 0.1);
    assert!(samples[2100 * 2].abs() < 1e-6);
    system.update().unwrap();
    assert!(!channel.is_playing());
}

#[test]
fn test_ticker_drives_backend() {
    let (system, mixer) = engine(small_config());
    let backend = crate::output::mock::MockBackend::new();
    let probe = backend.clone();
    let ticker = crate::output::ticker::Ticker::spawn(mixer, Box::new(backend));

    let sound = dc_sound(&system, 1.0, 480000);
    let channel = system.play_sound(&sound, None, false).unwrap();
    channel.set_looping(true).unwrap();

    crate::testutil::eventually(|| probe.block_count() > 3, "ticker never rendered");
    assert_eq!(system.state(), SystemState::Running);

    system.release();
    drop(ticker);
    assert!(probe.samples().iter().any(|s| s.abs() > 0.1));
}

#[test]
fn test_play_unloaded_sound_is_not_ready() {
    let (system, _mixer) = engine(small_config());
    let sound = system
        .create_sound(std::path::Path::new("/nonexistent/nope.wav"), Mode::DEFAULT)
        .unwrap();
    crate::testutil::eventually(
        || matches!(sound.state(), Ok(crate::bank::LoadState::Error)),
        "load never failed",
    );
    assert!(matches!(
        system.play_sound(&sound, None, false),
        Err(EngineError::NotReady(_))
    ));
}

#[test]
fn test_loaded_file_plays_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.wav");
    crate::testutil::write_test_wav(&path, &crate::testutil::sine(440.0, 48000, 1000), 1, 48000);

    let (system, mut mixer) = engine(small_config());
    let sound = system.create_sound(&path, Mode::DEFAULT).unwrap();
    crate::testutil::eventually(
        || matches!(sound.state(), Ok(crate::bank::LoadState::Loaded)),
        "sound never loaded",
    );
    assert_eq!(sound.length_frames().unwrap(), Some(1000));

    let channel = system.play_sound(&sound, None, false).unwrap();
    let samples = collect(&mut mixer, 8);
    // A sine starts at zero; audio must appear within the first frames.
    let first = first_audible_frame(&samples, 2).expect("no audio rendered");
    assert!(first <= 1, "first audible frame {first}");
    system.update().unwrap();
    assert!(!channel.is_playing());
}
