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
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mixcore::bank::LoadState;
use mixcore::dsp::{oscillator, DspType};
use mixcore::output::cpal::CpalBackend;
use mixcore::output::ticker::Ticker;
use mixcore::util::{duration_minutes_seconds, frames_to_duration};
use mixcore::{EngineConfig, Mode, System};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A real-time audio mixing engine."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Plays one or more audio files mixed together.
    Play {
        /// The audio files to play.
        files: Vec<PathBuf>,
        /// The output device name (default output device when omitted).
        #[arg(short, long)]
        device: Option<String>,
        /// Path to an engine configuration YAML file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Loop playback until interrupted.
        #[arg(short, long)]
        looping: bool,
    },
    /// Generates a test tone.
    Tone {
        /// Frequency in Hz.
        #[arg(short, long, default_value_t = 440.0)]
        frequency: f32,
        /// Waveform: 0 sine, 1 square, 2 saw up, 3 saw down, 4 triangle,
        /// 5 noise.
        #[arg(short, long, default_value_t = 0)]
        waveform: i32,
        /// Seconds to play.
        #[arg(short, long, default_value_t = 2.0)]
        seconds: f32,
        /// The output device name (default output device when omitted).
        #[arg(short, long)]
        device: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Devices {} => {
            for device in mixcore::output::list_devices()? {
                println!("{}", device);
            }
            Ok(())
        }
        Commands::Play {
            files,
            device,
            config,
            looping,
        } => play(files, device.as_deref(), config, looping),
        Commands::Tone {
            frequency,
            waveform,
            seconds,
            device,
        } => tone(frequency, waveform, seconds, device.as_deref()),
    }
}

fn start_engine(
    config: &EngineConfig,
    device: Option<&str>,
) -> Result<(System, Ticker), Box<dyn Error>> {
    let (system, mixer) = System::new(config)?;
    let backend = CpalBackend::open(
        device,
        config.sample_rate(),
        config.output_channels(),
        config.block_frames(),
    )?;
    println!("Playing through {}", backend);
    let ticker = Ticker::spawn(mixer, Box::new(backend));
    Ok((system, ticker))
}

fn play(
    files: Vec<PathBuf>,
    device: Option<&str>,
    config: Option<PathBuf>,
    looping: bool,
) -> Result<(), Box<dyn Error>> {
    if files.is_empty() {
        return Err("no files given".into());
    }
    let config = match config {
        Some(path) => EngineConfig::from_path(&path)?,
        None => EngineConfig::default(),
    };
    let (system, ticker) = start_engine(&config, device)?;

    let mode = if looping {
        Mode::LOOP_NORMAL
    } else {
        Mode::DEFAULT
    };
    let sounds: Vec<_> = files
        .iter()
        .map(|path| system.create_sound(path, mode))
        .collect::<Result<_, _>>()?;

    // Wait for the loader, then start everything on one tick boundary.
    let mut channels = Vec::new();
    for (sound, path) in sounds.iter().zip(&files) {
        loop {
            match sound.state()? {
                LoadState::Loaded => break,
                LoadState::Error => {
                    return Err(format!(
                        "{}: {}",
                        path.display(),
                        sound.load_error()?.unwrap_or_default()
                    )
                    .into())
                }
                _ => thread::sleep(Duration::from_millis(10)),
            }
        }
        let length = sound.length_frames()?.unwrap_or(0);
        println!(
            "{} ({})",
            path.display(),
            duration_minutes_seconds(frames_to_duration(length, config.sample_rate()))
        );
        channels.push(system.play_sound(sound, None, false)?);
    }

    loop {
        system.update()?;
        let metrics = system.metrics();
        if !looping && channels.iter().all(|c| !c.is_playing()) {
            break;
        }
        print!(
            "\rchannels: {:3} (real {:3})  dsp: {:5.1}%  clock: {:>10}",
            metrics.channels_playing,
            metrics.real_channels,
            metrics.dsp_cpu_pct,
            metrics.clock_samples
        );
        use std::io::Write;
        std::io::stdout().flush()?;
        thread::sleep(Duration::from_millis(100));
    }
    println!();

    system.release();
    drop(ticker);
    Ok(())
}

fn tone(
    frequency: f32,
    waveform: i32,
    seconds: f32,
    device: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::default();
    let (system, ticker) = start_engine(&config, device)?;

    let dsp = system.create_dsp(DspType::Oscillator)?;
    dsp.set_parameter_int(oscillator::PARAM_TYPE, waveform)?;
    dsp.set_parameter_float(oscillator::PARAM_RATE, frequency)?;

    let channel = system.play_dsp(&dsp, None, true)?;
    channel.set_volume(0.5)?;
    channel.set_paused(false)?;

    thread::sleep(Duration::from_secs_f32(seconds.max(0.0)));

    channel.stop()?;
    system.release();
    drop(ticker);
    Ok(())
}
