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

//! The mixer: the render context's tick.
//!
//! Each tick drains the command queue, recomputes tree-inherited group
//! state, re-ranks virtualization on its interval, pulls one block through
//! the DSP graph from the master head, and publishes a metrics snapshot.
//! The tick never blocks and never aborts: faults are contained per unit,
//! metrics publishing uses try_lock, and underruns degrade to silence.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::SignalBuffer;
use crate::channel::{PlayState, RenderChannel};
use crate::clock::SampleClock;
use crate::command::{Command, RenderEvent};
use crate::graph::{mix_default, ProcessContext, RenderGraph};
use crate::group::{InheritedGroupState, RenderGroup};
use crate::spatial::{attenuation, azimuth_pan, Listener};
use crate::virt::{Candidate, Partition, VirtualizationManager};

/// Engine lifecycle, observable from the control context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemState {
    Stopped = 0,
    Initialized = 1,
    Running = 2,
    Suspended = 3,
    Shutdown = 4,
}

impl SystemState {
    fn from_u8(value: u8) -> SystemState {
        match value {
            1 => SystemState::Initialized,
            2 => SystemState::Running,
            3 => SystemState::Suspended,
            4 => SystemState::Shutdown,
            _ => SystemState::Stopped,
        }
    }
}

/// The last-published per-tick snapshot. Read by the control context (UI,
/// stats polling) without ever blocking the render tick.
#[derive(Debug, Clone, Copy)]
pub struct EngineMetrics {
    /// Output-clock samples rendered since init.
    pub clock_samples: u64,
    /// Live channels (scheduled, playing, paused), real and virtual alike.
    pub channels_playing: usize,
    /// Channels currently holding a real voice.
    pub real_channels: usize,
    /// Render cost of the last tick as a percentage of the block duration.
    pub dsp_cpu_pct: f32,
    /// Command-drain cost of the last tick, same scale.
    pub update_cpu_pct: f32,
    /// DSP unit faults observed since init.
    pub faults: u64,
    pub block_frames: usize,
    pub sample_rate: u32,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            clock_samples: 0,
            channels_playing: 0,
            real_channels: 0,
            dsp_cpu_pct: 0.0,
            update_cpu_pct: 0.0,
            faults: 0,
            block_frames: 0,
            sample_rate: 0,
        }
    }
}

/// State shared between the control and render contexts.
pub struct SharedState {
    suspended: AtomicBool,
    shutdown: AtomicBool,
    state: AtomicU8,
    metrics: Mutex<EngineMetrics>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            suspended: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            state: AtomicU8::new(SystemState::Initialized as u8),
            metrics: Mutex::new(EngineMetrics::default()),
        }
    }

    pub fn state(&self) -> SystemState {
        SystemState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SystemState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.set_state(SystemState::Suspended);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        self.set_state(SystemState::Running);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.set_state(SystemState::Shutdown);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The last-published snapshot.
    pub fn metrics(&self) -> EngineMetrics {
        *self.metrics.lock()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// The render context. Owned by whatever drives the tick: the software
/// ticker thread, or a test driving blocks manually.
pub struct Mixer {
    block_frames: usize,
    sample_rate: u32,
    output_channels: u16,
    graph: RenderGraph,
    channels: Vec<Option<RenderChannel>>,
    groups: Vec<Option<RenderGroup>>,
    master_slot: u32,
    master_fader_unit: u32,
    clock: SampleClock,
    commands: Receiver<Command>,
    events: Sender<RenderEvent>,
    virt: VirtualizationManager,
    partition: Partition,
    listener: Listener,
    shared: Arc<SharedState>,
    block_count: u64,
    rerank_interval: u64,
    real_count: usize,
    inherited: Vec<InheritedGroupState>,
    group_order: Vec<u32>,
    output: SignalBuffer,
    candidates: Vec<Candidate>,
    faults: u64,
}

impl Mixer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        block_frames: usize,
        sample_rate: u32,
        output_channels: u16,
        master_slot: u32,
        master_fader_unit: u32,
        real_voices: usize,
        rerank_interval: u64,
        clock: SampleClock,
        commands: Receiver<Command>,
        events: Sender<RenderEvent>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            block_frames,
            sample_rate,
            output_channels,
            graph: RenderGraph::new(block_frames, output_channels),
            channels: Vec::new(),
            groups: Vec::new(),
            master_slot,
            master_fader_unit,
            clock,
            commands,
            events,
            virt: VirtualizationManager::new(real_voices),
            partition: Partition::default(),
            listener: Listener::default(),
            shared,
            block_count: 0,
            rerank_interval: rerank_interval.max(1),
            real_count: 0,
            inherited: Vec::new(),
            group_order: Vec::new(),
            output: SignalBuffer::zeroed(block_frames, output_channels),
            candidates: Vec::new(),
            faults: 0,
        }
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn output_channels(&self) -> u16 {
        self.output_channels
    }

    /// The state shared with the control context (suspend/shutdown flags,
    /// metrics snapshot).
    pub fn shared_state(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    /// Renders one block and returns it. The returned buffer is valid until
    /// the next call.
    pub fn tick(&mut self) -> &SignalBuffer {
        let tick_start = Instant::now();

        // (1) Apply queued mutations at the tick boundary.
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        let drain_elapsed = tick_start.elapsed();

        // Suspended: silence, no clock advance, nothing rendered.
        if self.shared.is_suspended() {
            self.output.reset(self.block_frames, self.output_channels);
            return &self.output;
        }

        // (2) Tree-inherited group state.
        self.compute_inherited();

        // (3) Per-channel effective values for this block.
        self.prepare_channels();

        // (4) Virtualization re-rank on its interval.
        if self.block_count % self.rerank_interval == 0 {
            self.rerank();
        }

        // (5) Pull the graph from the master head down to the sources.
        let ctx = ProcessContext {
            sample_rate: self.sample_rate,
            block_frames: self.block_frames,
        };
        let clock_now = self.clock.now();
        let frames = self.block_frames;
        let channels = &mut self.channels;
        self.graph
            .evaluate(self.master_fader_unit, &ctx, frames, |slot, out| {
                match channels.get_mut(slot as usize).and_then(|c| c.as_mut()) {
                    Some(channel) => channel.fill_block(out, clock_now, frames),
                    None => out.reset(frames, 1),
                }
            });

        // (6) Adapt the master block to the output layout.
        self.output.reset(self.block_frames, self.output_channels);
        if let Some(master) = self.graph.unit(self.master_fader_unit) {
            mix_default(master.output(), &mut self.output, 1.0);
        }

        // (7) Reclaim channels that ended this tick and report faults.
        self.sweep_ended();
        for slot in self.graph.take_faulted() {
            self.faults += 1;
            let _ = self.events.send(RenderEvent::UnitFaulted { slot });
        }

        // (8) Publish the snapshot and advance the clock.
        self.publish_metrics(tick_start.elapsed().as_secs_f32(), drain_elapsed.as_secs_f32());
        self.clock.advance(self.block_frames as u64);
        self.block_count += 1;

        &self.output
    }

    fn compute_inherited(&mut self) {
        if self.inherited.len() < self.groups.len() {
            self.inherited
                .resize(self.groups.len(), InheritedGroupState::default());
        }

        // Parent-before-child order from the master.
        self.group_order.clear();
        let mut stack = vec![self.master_slot];
        while let Some(slot) = stack.pop() {
            let Some(group) = self.groups.get(slot as usize).and_then(|g| g.as_ref()) else {
                continue;
            };
            self.group_order.push(slot);
            stack.extend_from_slice(&group.children);
        }

        for &slot in &self.group_order {
            let group = self.groups[slot as usize].as_ref().unwrap();
            let parent = group
                .parent
                .and_then(|p| self.inherited.get(p as usize).copied())
                .unwrap_or_default();
            let state = InheritedGroupState {
                gain: parent.gain * group.own_gain(),
                pitch: parent.pitch * group.pitch as f64,
                paused: parent.paused || group.paused,
            };
            self.inherited[slot as usize] = state;
            self.graph
                .set_fader(group.fader_unit, group.own_gain(), group.pan);
        }
    }

    fn prepare_channels(&mut self) {
        let output_rate = self.sample_rate as f64;
        for slot in 0..self.channels.len() {
            let Some(channel) = self.channels[slot].as_mut() else {
                continue;
            };
            if channel.state == PlayState::Stopped {
                continue;
            }

            let inherited = self
                .inherited
                .get(channel.group_slot as usize)
                .copied()
                .unwrap_or_default();

            channel.eff_paused = channel.paused || inherited.paused;

            let source_rate = channel
                .frequency
                .unwrap_or(channel.source_rate() as f32)
                .max(0.0) as f64;
            channel.eff_step =
                ((source_rate / output_rate) * channel.pitch as f64 * inherited.pitch)
                    .clamp(0.0, 64.0);

            let (att, pan) = match &channel.spatial {
                Some(attrs) => (
                    attenuation(
                        &self.listener.position,
                        &attrs.position,
                        &channel.distance_bounds,
                    ),
                    azimuth_pan(&self.listener, &attrs.position),
                ),
                None => (1.0, channel.pan),
            };
            let own_gain = if channel.mute { 0.0 } else { channel.volume } * att;
            self.graph.set_fader(channel.fader_unit, own_gain, pan);

            channel.eff_audibility = own_gain.abs() * inherited.gain.abs();
        }
    }

    fn rerank(&mut self) {
        self.candidates.clear();
        for (slot, channel) in self.channels.iter().enumerate() {
            let Some(channel) = channel else { continue };
            if channel.state == PlayState::Stopped {
                continue;
            }
            let audibility = if channel.eff_paused {
                0.0
            } else {
                channel.eff_audibility
            };
            self.candidates.push(Candidate {
                slot: slot as u32,
                audibility,
                created_seq: channel.created_seq,
            });
        }

        let mut partition = std::mem::take(&mut self.partition);
        self.virt.rerank(&self.candidates, &mut partition);

        for &slot in &partition.virtualized {
            self.set_channel_virtual(slot, true);
        }
        for &slot in &partition.real {
            self.set_channel_virtual(slot, false);
        }
        self.real_count = partition.real.len();
        self.partition = partition;
    }

    fn set_channel_virtual(&mut self, slot: u32, make_virtual: bool) {
        let Some(channel) = self.channels.get_mut(slot as usize).and_then(|c| c.as_mut()) else {
            return;
        };
        if channel.is_virtual == make_virtual {
            return;
        }
        channel.is_virtual = make_virtual;

        // Freeze the channel's sub-graph in place: processors are skipped
        // entirely so filter history survives for re-promotion.
        let mut frozen_units = Vec::with_capacity(channel.chain_units.len() + 1);
        frozen_units.push(channel.fader_unit);
        frozen_units.extend_from_slice(&channel.chain_units);
        for unit_slot in frozen_units {
            if let Some(unit) = self.graph.unit_mut(unit_slot) {
                unit.frozen = make_virtual;
            }
        }
    }

    fn sweep_ended(&mut self) {
        for slot in 0..self.channels.len() {
            let Some(channel) = self.channels[slot].as_ref() else {
                continue;
            };
            if !channel.just_ended {
                continue;
            }
            let generation = channel.generation;
            let source_unit = channel.source_unit;
            let fader_unit = channel.fader_unit;
            let was_real = !channel.is_virtual;
            let mut members = vec![source_unit, fader_unit];
            members.extend_from_slice(&channel.chain_units);
            debug!(slot, "Channel finished, reclaiming");

            // Engine-owned units and chain wiring go; user DSPs that were in
            // the chain stay behind, detached and unfrozen.
            for &unit_slot in &members[2..] {
                if let Some(unit) = self.graph.unit_mut(unit_slot) {
                    unit.frozen = false;
                }
            }
            self.graph.remove_edges_within(&members);
            self.graph.remove_unit(source_unit);
            self.graph.remove_unit(fader_unit);
            self.channels[slot] = None;
            if was_real {
                self.real_count = self.real_count.saturating_sub(1);
            }
            let _ = self.events.send(RenderEvent::ChannelEnded {
                slot: slot as u32,
                generation,
            });
        }
    }

    fn publish_metrics(&self, tick_secs: f32, drain_secs: f32) {
        let block_secs = self.block_frames as f32 / self.sample_rate as f32;
        let live = self
            .channels
            .iter()
            .flatten()
            .filter(|c| c.state != PlayState::Stopped)
            .count();
        let real = self
            .channels
            .iter()
            .flatten()
            .filter(|c| c.state != PlayState::Stopped && !c.is_virtual)
            .count();

        if let Some(mut metrics) = self.shared.metrics.try_lock() {
            *metrics = EngineMetrics {
                clock_samples: self.clock.now(),
                channels_playing: live,
                real_channels: real,
                dsp_cpu_pct: 100.0 * tick_secs / block_secs,
                update_cpu_pct: 100.0 * drain_secs / block_secs,
                faults: self.faults,
                block_frames: self.block_frames,
                sample_rate: self.sample_rate,
            };
        }
    }

    fn slot_entry<T>(vec: &mut Vec<Option<T>>, slot: u32) -> &mut Option<T> {
        let index = slot as usize;
        if index >= vec.len() {
            vec.resize_with(index + 1, || None);
        }
        &mut vec[index]
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Batch(commands) => {
                for command in commands {
                    self.apply(command);
                }
            }

            Command::AddUnit { slot, unit } => self.graph.add_unit(slot, unit),
            Command::RemoveUnit { slot } => self.graph.remove_unit(slot),
            Command::Connect {
                conn_slot,
                src,
                dst,
                explicit,
            } => self.graph.connect(conn_slot, src, dst, explicit),
            Command::Disconnect { conn_slot } => self.graph.disconnect(conn_slot),
            Command::SetMixMatrix { conn_slot, matrix } => {
                self.graph.set_mix_matrix(conn_slot, matrix)
            }
            Command::SetConnectionGain { conn_slot, gain } => {
                self.graph.set_connection_gain(conn_slot, gain)
            }
            Command::SetParam { slot, index, value } => self.graph.set_param(slot, index, &value),
            Command::SetBypass { slot, bypass } => self.graph.set_bypass(slot, bypass),
            Command::SetActive { slot, active } => self.graph.set_active(slot, active),
            Command::ResetUnit { slot } => self.graph.reset_unit(slot),

            Command::AddChannel { slot, channel } => {
                let mut channel = *channel;
                channel.is_virtual = false;
                // Over-budget channels start life virtual; the next re-rank
                // may promote them if they outrank a running voice.
                let over_budget = self.real_count >= self.virt.budget();
                *Self::slot_entry(&mut self.channels, slot) = Some(channel);
                if over_budget {
                    self.set_channel_virtual(slot, true);
                } else {
                    self.real_count += 1;
                }
            }
            Command::StopChannel { slot } => {
                if let Some(channel) = self.channels.get_mut(slot as usize).and_then(|c| c.take())
                {
                    let mut members = vec![channel.source_unit, channel.fader_unit];
                    members.extend_from_slice(&channel.chain_units);
                    for &unit_slot in &channel.chain_units {
                        if let Some(unit) = self.graph.unit_mut(unit_slot) {
                            unit.frozen = false;
                        }
                    }
                    self.graph.remove_edges_within(&members);
                    self.graph.remove_unit(channel.source_unit);
                    self.graph.remove_unit(channel.fader_unit);
                    if !channel.is_virtual {
                        self.real_count = self.real_count.saturating_sub(1);
                    }
                }
            }
            Command::SetChannelPaused { slot, paused } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.paused = paused;
                }
            }
            Command::SetChannelVolume { slot, volume } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.volume = volume;
                }
            }
            Command::SetChannelPitch { slot, pitch } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.pitch = pitch;
                }
            }
            Command::SetChannelPan { slot, pan } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.pan = pan;
                }
            }
            Command::SetChannelMute { slot, mute } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.mute = mute;
                }
            }
            Command::SetChannelFrequency { slot, frequency } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.frequency = frequency;
                }
            }
            Command::SetChannelLooping { slot, looping } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.looping = looping;
                }
            }
            Command::SetChannelDelay {
                slot,
                start,
                end,
                stop_at_end,
            } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.start_sample = start;
                    c.end_sample = end;
                    c.stop_at_end = stop_at_end;
                    if start.is_some() && c.state == PlayState::Playing {
                        // A future start re-arms an already-playing channel.
                        c.state = PlayState::Scheduled;
                    }
                }
            }
            Command::SetChannelSpatial { slot, attrs } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.spatial = Some(attrs);
                }
            }
            Command::SetChannelGroup { slot, group_slot } => {
                if let Some(c) = self.channel_mut(slot) {
                    c.group_slot = group_slot;
                }
            }
            Command::SetChannelChain { slot, chain_units } => {
                // Units leaving the chain shed any virtualization freeze;
                // units in the chain of a virtual channel pick it up.
                let old: Vec<u32> = self
                    .channels
                    .get(slot as usize)
                    .and_then(|c| c.as_ref())
                    .map(|c| c.chain_units.clone())
                    .unwrap_or_default();
                for unit_slot in old {
                    if let Some(unit) = self.graph.unit_mut(unit_slot) {
                        unit.frozen = false;
                    }
                }
                let mut freeze = Vec::new();
                if let Some(c) = self.channel_mut(slot) {
                    c.chain_units = chain_units;
                    if c.is_virtual {
                        freeze.push(c.fader_unit);
                        freeze.extend_from_slice(&c.chain_units);
                    }
                }
                for unit_slot in freeze {
                    if let Some(unit) = self.graph.unit_mut(unit_slot) {
                        unit.frozen = true;
                    }
                }
            }

            Command::AddGroup { slot, group } => {
                let parent = group.parent;
                *Self::slot_entry(&mut self.groups, slot) = Some(*group);
                if let Some(parent) = parent {
                    if let Some(p) = self.groups.get_mut(parent as usize).and_then(|g| g.as_mut())
                    {
                        p.children.push(slot);
                    }
                }
            }
            Command::RemoveGroup { slot } => {
                if let Some(group) = self.groups.get_mut(slot as usize).and_then(|g| g.take()) {
                    if let Some(parent) = group.parent {
                        if let Some(p) =
                            self.groups.get_mut(parent as usize).and_then(|g| g.as_mut())
                        {
                            p.children.retain(|c| *c != slot);
                        }
                    }
                }
            }
            Command::SetGroupParent { slot, parent_slot } => {
                let old_parent = self
                    .groups
                    .get(slot as usize)
                    .and_then(|g| g.as_ref())
                    .and_then(|g| g.parent);
                if let Some(old) = old_parent {
                    if let Some(p) = self.groups.get_mut(old as usize).and_then(|g| g.as_mut()) {
                        p.children.retain(|c| *c != slot);
                    }
                }
                if let Some(group) = self.groups.get_mut(slot as usize).and_then(|g| g.as_mut()) {
                    group.parent = Some(parent_slot);
                }
                if let Some(p) = self
                    .groups
                    .get_mut(parent_slot as usize)
                    .and_then(|g| g.as_mut())
                {
                    p.children.push(slot);
                }
            }
            Command::SetGroupVolume { slot, volume } => {
                if let Some(g) = self.group_mut(slot) {
                    g.volume = volume;
                }
            }
            Command::SetGroupPitch { slot, pitch } => {
                if let Some(g) = self.group_mut(slot) {
                    g.pitch = pitch;
                }
            }
            Command::SetGroupPan { slot, pan } => {
                if let Some(g) = self.group_mut(slot) {
                    g.pan = pan;
                }
            }
            Command::SetGroupMute { slot, mute } => {
                if let Some(g) = self.group_mut(slot) {
                    g.mute = mute;
                }
            }
            Command::SetGroupPaused { slot, paused } => {
                if let Some(g) = self.group_mut(slot) {
                    g.paused = paused;
                }
            }

            Command::SetListener { listener } => self.listener = listener,
        }
    }

    fn channel_mut(&mut self, slot: u32) -> Option<&mut RenderChannel> {
        self.channels.get_mut(slot as usize).and_then(|c| c.as_mut())
    }

    fn group_mut(&mut self, slot: u32) -> Option<&mut RenderGroup> {
        self.groups.get_mut(slot as usize).and_then(|g| g.as_mut())
    }
}
