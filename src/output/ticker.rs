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

//! The software render driver: a paced thread ticking the mixer.
//!
//! Hosts with a hardware pull callback could invoke `Mixer::tick` from the
//! callback instead; the command-queue mutation discipline is identical
//! either way. This driver covers the common case: a dedicated thread paced
//! by the block duration, elevated to real-time priority where the platform
//! allows it.

use std::thread;
use std::time::Duration;

use spin_sleep::SpinSleeper;
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{debug, info, warn};

use super::OutputBackend;
use crate::render::{Mixer, SystemState};

/// Priority requested for the render thread (0-99 crossplatform scale).
const RENDER_THREAD_PRIORITY: u8 = 70;

/// Owns the render thread. Dropping the ticker after
/// [`crate::system::System::release`] joins it.
pub struct Ticker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    /// Consumes the mixer and drives it at the block rate, pushing every
    /// rendered block into `backend`. The thread exits when the paired
    /// system requests shutdown.
    pub fn spawn(mut mixer: Mixer, mut backend: Box<dyn OutputBackend>) -> Ticker {
        let block_duration =
            Duration::from_secs_f64(mixer.block_frames() as f64 / mixer.sample_rate() as f64);

        let thread = thread::Builder::new()
            .name("mixcore-render".into())
            .spawn(move || {
                configure_render_thread_priority();
                info!(
                    backend = %backend,
                    block_ms = block_duration.as_secs_f64() * 1000.0,
                    "Render ticker started"
                );
                let shared = mixer.shared_state();
                shared.set_state(SystemState::Running);

                let sleeper = SpinSleeper::default();
                loop {
                    if shared.is_shutdown() {
                        break;
                    }
                    let started = std::time::Instant::now();
                    let block = mixer.tick();
                    if let Err(e) = backend.push_block(block) {
                        warn!(error = %e, "Output backend rejected block");
                    }
                    // Pace to the block rate; the backend's own buffering
                    // absorbs the remaining jitter.
                    let elapsed = started.elapsed();
                    if elapsed < block_duration {
                        sleeper.sleep(block_duration - elapsed);
                    }
                }
                debug!("Render ticker exited");
            })
            .expect("failed to spawn render thread");

        Ticker {
            thread: Some(thread),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Elevates the current thread for render work. Best effort: failure is
/// logged, not fatal.
fn configure_render_thread_priority() {
    let Ok(priority) = ThreadPriorityValue::try_from(RENDER_THREAD_PRIORITY) else {
        return;
    };
    let tp = ThreadPriority::Crossplatform(priority);
    let _ = set_current_thread_priority(tp);

    #[cfg(unix)]
    {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        match set_thread_priority_and_policy(
            tid,
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Enabled RT SCHED_FIFO for render thread"),
            Err(e) => debug!(error = %e, "RT scheduling unavailable for render thread"),
        }
    }
}
