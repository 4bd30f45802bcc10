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

//! The control context: the `System` façade and its handle objects.
//!
//! The control side keeps a shadow of every object (sounds, channels,
//! groups, DSP units, connections) in generation-counted arenas. Every
//! operation validates fully against the shadow (handle liveness, ranges,
//! acyclicity) before any mutation is enqueued, so a failed call never
//! leaves the graph half-changed. Validated mutations are applied to the
//! shadow immediately and shipped to the render context as a single
//! command (batched when compound), which the mixer applies at the next
//! tick boundary.
//!
//! A `System` is an explicit instance: several can coexist in one process,
//! and nothing here is a process-wide global.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bank::{FileReader, LoadCell, LoadState, SoundLoader};
use crate::channel::RenderChannel;
use crate::clock::SampleClock;
use crate::command::{Command, RenderEvent};
use crate::config::EngineConfig;
use crate::dsp::{CustomDspDescription, DspType};
use crate::error::{EngineError, Result};
use crate::graph::{
    DspDescriptor, FaderState, MixMatrix, ParamDef, ParamValue, RenderUnit, UnitKind,
};
use crate::group::RenderGroup;
use crate::handle::{Arena, ChannelId, ConnectionId, DspId, GroupId, RawHandle, SoundId};
use crate::render::{EngineMetrics, Mixer, SharedState, SystemState};
use crate::source::{
    FrameRing, MemorySource, PcmReader, PcmSource, SilenceSource, SoundData, SourceFactory,
    StreamProducer, StreamingSource,
};
use crate::spatial::{DistanceBounds, EmitterAttributes, Listener, Vector3};

/// Playback flags applied when a sound is created, overridable per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mode {
    /// Loop indefinitely instead of stopping at end of data.
    pub looping: bool,
    /// Position the channel in 3D (distance attenuation + azimuth pan).
    pub spatial: bool,
}

impl Mode {
    pub const DEFAULT: Mode = Mode {
        looping: false,
        spatial: false,
    };
    pub const LOOP_NORMAL: Mode = Mode {
        looping: true,
        spatial: false,
    };
}

enum SoundKind {
    /// Decoded and resident (from PCM or a finished load).
    Memory(Arc<SoundData>),
    /// Loading asynchronously on the loader thread.
    File { cell: Arc<LoadCell> },
    /// Streamed from disk at play time.
    Stream {
        path: PathBuf,
        channel_count: u16,
        sample_rate: u32,
        length_frames: Option<u64>,
    },
    /// User-provided source factory.
    User(Arc<dyn SourceFactory>),
}

struct ShadowSound {
    kind: SoundKind,
    mode: Mode,
    bounds: DistanceBounds,
}

struct ShadowChannel {
    sound: SoundId,
    group: GroupId,
    source_unit: u32,
    fader_unit: u32,
    bus_conn: ConnectionId,
    chain: Vec<DspId>,
    volume: f32,
    pitch: f32,
    pan: f32,
    mute: bool,
    paused: bool,
    frequency: Option<f32>,
    looping: bool,
    start_sample: Option<u64>,
    end_sample: Option<u64>,
    stop_at_end: bool,
    spatial: bool,
}

struct ShadowGroup {
    name: String,
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    channels: Vec<ChannelId>,
    bus_unit: u32,
    fader_unit: u32,
    parent_conn: Option<ConnectionId>,
    chain: Vec<DspId>,
    volume: f32,
    pitch: f32,
    pan: f32,
    mute: bool,
    paused: bool,
}

impl ShadowGroup {
    fn new(
        name: String,
        parent: Option<GroupId>,
        bus_unit: u32,
        fader_unit: u32,
        parent_conn: Option<ConnectionId>,
    ) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            channels: Vec::new(),
            bus_unit,
            fader_unit,
            parent_conn,
            chain: Vec::new(),
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            mute: false,
            paused: false,
        }
    }
}

enum UnitRole {
    /// A user-visible DSP unit.
    Effect {
        descriptor: DspDescriptor,
        params: Vec<ParamValue>,
        bypass: bool,
        active: bool,
        faulted: bool,
        /// Chain the unit is spliced into, if any (no sharing).
        attached: bool,
    },
    ChannelSource,
    ChannelFader,
    GroupBus,
    GroupFader,
}

struct ShadowUnit {
    role: UnitRole,
}

struct ShadowConnection {
    src_unit: u32,
    dst_unit: u32,
    /// Created by an explicit `connect` (as opposed to chain/tree wiring).
    explicit: bool,
    matrix: Option<MixMatrix>,
    gain: f32,
}

struct Shadow {
    sounds: Arena<ShadowSound>,
    channels: Arena<ShadowChannel>,
    groups: Arena<ShadowGroup>,
    units: Arena<ShadowUnit>,
    connections: Arena<ShadowConnection>,
    listener: Listener,
    master: GroupId,
    next_seq: u64,
}

impl Shadow {
    /// True if `to` is reachable from `from` along connection direction.
    /// Used for connect-time cycle rejection: adding src->dst is a cycle
    /// iff src is already reachable from dst.
    fn reachable(&self, from: u32, to: u32) -> bool {
        let mut stack = vec![from];
        let mut visited = Vec::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if visited.contains(&node) {
                continue;
            }
            visited.push(node);
            for (_, conn) in self.connections.iter() {
                if conn.src_unit == node {
                    stack.push(conn.dst_unit);
                }
            }
        }
        false
    }

    /// Frees a channel's engine-owned units and connections and detaches
    /// its chain DSPs. Mirrors the mixer-side reclamation.
    fn release_channel_objects(&mut self, channel: &ShadowChannel) {
        let source_gen = self.unit_generation(channel.source_unit);
        let fader_gen = self.unit_generation(channel.fader_unit);
        let _ = self.units.remove(RawHandle {
            slot: channel.source_unit,
            generation: source_gen,
        });
        let _ = self.units.remove(RawHandle {
            slot: channel.fader_unit,
            generation: fader_gen,
        });
        let _ = self.connections.remove(channel.bus_conn.0);

        // The chain edges (source -> effects -> fader) are engine wiring;
        // drop them all. Explicit app-made connections survive.
        let mut members = vec![channel.source_unit, channel.fader_unit];
        members.extend(channel.chain.iter().map(|d| d.slot()));
        let stale: Vec<RawHandle> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                !c.explicit
                    && members.contains(&c.src_unit)
                    && members.contains(&c.dst_unit)
            })
            .map(|(h, _)| h)
            .collect();
        for handle in stale {
            let _ = self.connections.remove(handle);
        }
        for dsp in &channel.chain {
            if let Ok(unit) = self.units.get_mut(dsp.0) {
                if let UnitRole::Effect { attached, .. } = &mut unit.role {
                    *attached = false;
                }
            }
        }
    }

    /// Current generation of a unit slot, for constructing a valid handle.
    fn unit_generation(&self, slot: u32) -> u32 {
        self.units
            .iter()
            .find(|(h, _)| h.slot == slot)
            .map(|(h, _)| h.generation)
            .unwrap_or(0)
    }
}

struct ControlShared {
    shadow: Mutex<Shadow>,
    commands: Sender<Command>,
    events: Receiver<RenderEvent>,
    state: Arc<SharedState>,
    clock: SampleClock,
    loader: SoundLoader,
    sample_rate: u32,
    block_frames: usize,
    output_channels: u16,
    stream_ring_frames: usize,
}

impl ControlShared {
    /// Locks the shadow, first applying render-context completions so a
    /// channel the mixer reclaimed last tick is already invalid here.
    fn lock(&self) -> parking_lot::MutexGuard<'_, Shadow> {
        let mut shadow = self.shadow.lock();
        while let Ok(event) = self.events.try_recv() {
            match event {
                RenderEvent::ChannelEnded { slot, generation } => {
                    let handle = RawHandle { slot, generation };
                    if let Ok(channel) = self.shadow_channel_remove(&mut shadow, handle) {
                        shadow.release_channel_objects(&channel);
                        debug!(slot, "Finished channel reclaimed");
                    }
                }
                RenderEvent::UnitFaulted { slot } => {
                    let handle = RawHandle {
                        slot,
                        generation: shadow.unit_generation(slot),
                    };
                    if let Ok(unit) = shadow.units.get_mut(handle) {
                        if let UnitRole::Effect { faulted, .. } = &mut unit.role {
                            *faulted = true;
                        }
                    }
                }
            }
        }
        shadow
    }

    fn shadow_channel_remove(
        &self,
        shadow: &mut Shadow,
        handle: RawHandle,
    ) -> Result<ShadowChannel> {
        let channel = shadow.channels.remove(handle)?;
        if let Ok(group) = shadow.groups.get_mut(channel.group.0) {
            group
                .channels
                .retain(|c| !(c.slot() == handle.slot && c.generation() == handle.generation));
        }
        Ok(channel)
    }

    fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

/// The engine instance: the control context's entry point.
///
/// Construction returns the paired [`Mixer`]; hand it to an output driver
/// (`output::Ticker` + a backend) or tick it manually in tests.
#[derive(Clone)]
pub struct System {
    shared: Arc<ControlShared>,
}

impl System {
    /// Creates an engine and its render context.
    pub fn new(config: &EngineConfig) -> Result<(System, Mixer)> {
        config.validate()?;

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let clock = SampleClock::new();
        let state = Arc::new(SharedState::new());

        let mut shadow = Shadow {
            sounds: Arena::new("sound"),
            channels: Arena::with_limit("channel", config.max_channels()),
            groups: Arena::new("group"),
            units: Arena::new("dsp unit"),
            connections: Arena::new("connection"),
            listener: Listener::default(),
            master: GroupId::new(0, 0),
            next_seq: 0,
        };

        // The master group and its units occupy the first slots on both
        // sides of the queue.
        let bus = shadow.units.insert(ShadowUnit {
            role: UnitRole::GroupBus,
        })?;
        let fader = shadow.units.insert(ShadowUnit {
            role: UnitRole::GroupFader,
        })?;
        let bus_to_fader = shadow.connections.insert(ShadowConnection {
            src_unit: bus.slot,
            dst_unit: fader.slot,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;
        let master = shadow.groups.insert(ShadowGroup::new(
            "master".into(),
            None,
            bus.slot,
            fader.slot,
            None,
        ))?;
        shadow.master = GroupId(master);

        let mixer = Mixer::new(
            config.block_frames(),
            config.sample_rate(),
            config.output_channels(),
            master.slot,
            fader.slot,
            config.real_voices(),
            config.rerank_interval_blocks(),
            clock.clone(),
            command_rx,
            event_tx,
            state.clone(),
        );

        let shared = Arc::new(ControlShared {
            shadow: Mutex::new(shadow),
            commands: command_tx,
            events: event_rx,
            state,
            clock,
            loader: SoundLoader::new(config.sample_rate()),
            sample_rate: config.sample_rate(),
            block_frames: config.block_frames(),
            output_channels: config.output_channels(),
            stream_ring_frames: config.stream_ring_frames(),
        });

        shared.send(Command::Batch(vec![
            Command::AddUnit {
                slot: bus.slot,
                unit: RenderUnit::new("master:bus".into(), UnitKind::Bus, None),
            },
            Command::AddUnit {
                slot: fader.slot,
                unit: RenderUnit::new(
                    "master:fader".into(),
                    UnitKind::Fader(FaderState::new()),
                    Some(config.output_channels()),
                ),
            },
            Command::Connect {
                conn_slot: bus_to_fader.slot,
                src: bus.slot,
                dst: fader.slot,
                explicit: false,
            },
            Command::AddGroup {
                slot: master.slot,
                group: Box::new(RenderGroup::new(
                    "master".into(),
                    None,
                    bus.slot,
                    fader.slot,
                    u32::MAX,
                )),
            },
        ]));

        info!(
            sample_rate = config.sample_rate(),
            block_frames = config.block_frames(),
            output_channels = config.output_channels(),
            max_channels = config.max_channels(),
            real_voices = config.real_voices(),
            "Engine initialized"
        );

        Ok((System { shared: shared.clone() }, mixer))
    }

    /// Queues a file for asynchronous decoding. Poll [`Sound::state`] and
    /// play once Loaded.
    pub fn create_sound(&self, path: &Path, mode: Mode) -> Result<Sound> {
        let cell = self.shared.loader.enqueue(path);
        let mut shadow = self.shared.lock();
        let handle = shadow.sounds.insert(ShadowSound {
            kind: SoundKind::File { cell },
            mode,
            bounds: DistanceBounds::default(),
        })?;
        Ok(Sound {
            id: SoundId(handle),
            shared: self.shared.clone(),
        })
    }

    /// Wraps caller-provided interleaved f32 PCM as a sound, ready
    /// immediately.
    pub fn create_sound_from_pcm(
        &self,
        pcm: Vec<f32>,
        channel_count: u16,
        sample_rate: u32,
        mode: Mode,
    ) -> Result<Sound> {
        if channel_count == 0 {
            return Err(EngineError::param("channel_count must be nonzero"));
        }
        if sample_rate == 0 {
            return Err(EngineError::param("sample_rate must be nonzero"));
        }
        let data = Arc::new(SoundData::new(pcm, channel_count, sample_rate));
        let mut shadow = self.shared.lock();
        let handle = shadow.sounds.insert(ShadowSound {
            kind: SoundKind::Memory(data),
            mode,
            bounds: DistanceBounds::default(),
        })?;
        Ok(Sound {
            id: SoundId(handle),
            shared: self.shared.clone(),
        })
    }

    /// Registers a user source factory as a sound (procedurally generated
    /// audio; a fresh source is opened per playback).
    pub fn create_sound_from_factory(
        &self,
        factory: Arc<dyn SourceFactory>,
        mode: Mode,
    ) -> Result<Sound> {
        let info = factory.describe();
        if info.channel_count == 0 || info.sample_rate == 0 {
            return Err(EngineError::param(
                "factory must describe nonzero channels and sample rate",
            ));
        }
        let mut shadow = self.shared.lock();
        let handle = shadow.sounds.insert(ShadowSound {
            kind: SoundKind::User(factory),
            mode,
            bounds: DistanceBounds::default(),
        })?;
        Ok(Sound {
            id: SoundId(handle),
            shared: self.shared.clone(),
        })
    }

    /// Opens a file for streaming playback: the file is probed now, decoded
    /// incrementally at play time by a producer thread.
    pub fn create_stream(&self, path: &Path, mode: Mode) -> Result<Sound> {
        let reader =
            FileReader::open(path).map_err(EngineError::NotReady)?;
        let channel_count = reader.channel_count();
        let sample_rate = reader.sample_rate();
        let length_frames = reader.length_frames();
        drop(reader);

        let mut shadow = self.shared.lock();
        let handle = shadow.sounds.insert(ShadowSound {
            kind: SoundKind::Stream {
                path: path.to_path_buf(),
                channel_count,
                sample_rate,
                length_frames,
            },
            mode,
            bounds: DistanceBounds::default(),
        })?;
        Ok(Sound {
            id: SoundId(handle),
            shared: self.shared.clone(),
        })
    }

    /// The always-present root group.
    pub fn master_group(&self) -> ChannelGroup {
        let shadow = self.shared.lock();
        ChannelGroup {
            id: shadow.master,
            shared: self.shared.clone(),
        }
    }

    /// Creates a group parented to the master group.
    pub fn create_channel_group(&self, name: &str) -> Result<ChannelGroup> {
        let mut shadow = self.shared.lock();
        let master = shadow.master;
        let master_bus = shadow.groups.get(master.0)?.bus_unit;

        let bus = shadow.units.insert(ShadowUnit {
            role: UnitRole::GroupBus,
        })?;
        let fader = shadow.units.insert(ShadowUnit {
            role: UnitRole::GroupFader,
        })?;
        let bus_to_fader = shadow.connections.insert(ShadowConnection {
            src_unit: bus.slot,
            dst_unit: fader.slot,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;
        let to_parent = shadow.connections.insert(ShadowConnection {
            src_unit: fader.slot,
            dst_unit: master_bus,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;
        let handle = shadow.groups.insert(ShadowGroup::new(
            name.into(),
            Some(master),
            bus.slot,
            fader.slot,
            Some(ConnectionId(to_parent)),
        ))?;
        shadow.groups.get_mut(master.0)?.children.push(GroupId(handle));

        self.shared.send(Command::Batch(vec![
            Command::AddUnit {
                slot: bus.slot,
                unit: RenderUnit::new(format!("{name}:bus"), UnitKind::Bus, None),
            },
            Command::AddUnit {
                slot: fader.slot,
                unit: RenderUnit::new(
                    format!("{name}:fader"),
                    UnitKind::Fader(FaderState::new()),
                    Some(self.shared.output_channels),
                ),
            },
            Command::Connect {
                conn_slot: bus_to_fader.slot,
                src: bus.slot,
                dst: fader.slot,
                explicit: false,
            },
            Command::AddGroup {
                slot: handle.slot,
                group: Box::new(RenderGroup::new(
                    name.into(),
                    Some(master.slot()),
                    bus.slot,
                    fader.slot,
                    to_parent.slot,
                )),
            },
            Command::Connect {
                conn_slot: to_parent.slot,
                src: fader.slot,
                dst: master_bus,
                explicit: false,
            },
        ]));

        debug!(name, "Channel group created");
        Ok(ChannelGroup {
            id: GroupId(handle),
            shared: self.shared.clone(),
        })
    }

    /// Creates a built-in DSP unit, detached.
    pub fn create_dsp(&self, dsp_type: DspType) -> Result<Dsp> {
        let descriptor = dsp_type.descriptor();
        let processor = dsp_type.create_processor(self.shared.sample_rate);
        self.create_dsp_inner(descriptor, processor)
    }

    /// Instantiates a registered user DSP description, detached.
    pub fn create_dsp_custom(&self, description: &CustomDspDescription) -> Result<Dsp> {
        let descriptor = description.descriptor().clone();
        let processor = description.create();
        self.create_dsp_inner(descriptor, processor)
    }

    fn create_dsp_inner(
        &self,
        descriptor: DspDescriptor,
        processor: Box<dyn crate::graph::BlockProcessor>,
    ) -> Result<Dsp> {
        let params: Vec<ParamValue> = descriptor
            .params
            .iter()
            .map(ParamValue::default_for)
            .collect();
        let fixed = descriptor.output_channels;
        let name = descriptor.name.clone();

        let mut shadow = self.shared.lock();
        let handle = shadow.units.insert(ShadowUnit {
            role: UnitRole::Effect {
                descriptor,
                params,
                bypass: false,
                active: true,
                faulted: false,
                attached: false,
            },
        })?;
        self.shared.send(Command::AddUnit {
            slot: handle.slot,
            unit: RenderUnit::new(name, UnitKind::Effect(processor), fixed),
        });
        Ok(Dsp {
            id: DspId(handle),
            shared: self.shared.clone(),
        })
    }

    /// Connects two DSP units, rejecting edges that would create a cycle.
    /// The default mix matrix adapts to the endpoint shapes; set an explicit
    /// one on the returned connection.
    pub fn connect(&self, src: &Dsp, dst: &Dsp) -> Result<DspConnection> {
        let mut shadow = self.shared.lock();
        for id in [src.id, dst.id] {
            match &shadow.units.get(id.0)?.role {
                UnitRole::Effect { .. } => {}
                _ => return Err(EngineError::InvalidHandle),
            }
        }
        if src.id == dst.id || shadow.reachable(dst.id.slot(), src.id.slot()) {
            return Err(EngineError::CycleDetected);
        }

        let handle = shadow.connections.insert(ShadowConnection {
            src_unit: src.id.slot(),
            dst_unit: dst.id.slot(),
            explicit: true,
            matrix: None,
            gain: 1.0,
        })?;
        self.shared.send(Command::Connect {
            conn_slot: handle.slot,
            src: src.id.slot(),
            dst: dst.id.slot(),
            explicit: true,
        });
        Ok(DspConnection {
            id: ConnectionId(handle),
            shared: self.shared.clone(),
        })
    }

    /// Removes a connection made with [`System::connect`].
    pub fn disconnect(&self, connection: &DspConnection) -> Result<()> {
        let mut shadow = self.shared.lock();
        let conn = shadow.connections.get(connection.id.0)?;
        if !conn.explicit {
            return Err(EngineError::InvalidHandle);
        }
        shadow.connections.remove(connection.id.0)?;
        self.shared.send(Command::Disconnect {
            conn_slot: connection.id.slot(),
        });
        Ok(())
    }

    /// Starts a sound on a new channel. The channel begins in the given
    /// group (master if None), paused or live.
    pub fn play_sound(
        &self,
        sound: &Sound,
        group: Option<&ChannelGroup>,
        paused: bool,
    ) -> Result<Channel> {
        let mut shadow = self.shared.lock();
        let entry = shadow.sounds.get(sound.id.0)?;
        let mode = entry.mode;
        let bounds = entry.bounds;

        // Resolve the playable source; a still-loading sound is refused.
        let source: Box<dyn PcmSource> = match &entry.kind {
            SoundKind::Memory(data) => Box::new(MemorySource::new(data.clone())),
            SoundKind::File { cell } => match cell.state() {
                LoadState::Loaded => match cell.data() {
                    Some(data) => Box::new(MemorySource::new(data)),
                    None => return Err(EngineError::NotReady("sound data unavailable".into())),
                },
                LoadState::Error => {
                    return Err(EngineError::NotReady(
                        cell.error().unwrap_or_else(|| "load failed".into()),
                    ))
                }
                _ => return Err(EngineError::NotReady("sound is still loading".into())),
            },
            SoundKind::Stream {
                path,
                channel_count,
                sample_rate,
                length_frames,
            } => {
                let reader = FileReader::open(path).map_err(EngineError::NotReady)?;
                let ring = Arc::new(FrameRing::new(
                    self.shared.stream_ring_frames,
                    *channel_count,
                ));
                let producer = StreamProducer::spawn(Box::new(reader), ring.clone(), mode.looping);
                Box::new(StreamingSource::new(
                    ring,
                    producer,
                    *sample_rate,
                    *length_frames,
                ))
            }
            SoundKind::User(factory) => factory.open(),
        };

        self.play_source_locked(&mut shadow, source, sound.id, group, paused, mode, bounds)
    }

    /// Plays a detached DSP unit as a sound source (tone generation): the
    /// unit is spliced into a new channel fed by silence.
    pub fn play_dsp(
        &self,
        dsp: &Dsp,
        group: Option<&ChannelGroup>,
        paused: bool,
    ) -> Result<Channel> {
        let mut shadow = self.shared.lock();
        match &shadow.units.get(dsp.id.0)?.role {
            UnitRole::Effect { attached: true, .. } => {
                return Err(EngineError::param("DSP is already attached"))
            }
            UnitRole::Effect { .. } => {}
            _ => return Err(EngineError::InvalidHandle),
        }

        let source = Box::new(SilenceSource::new(1, self.shared.sample_rate));
        let channel = self.play_source_locked(
            &mut shadow,
            source,
            SoundId::new(u32::MAX, u32::MAX),
            group,
            paused,
            Mode {
                looping: true,
                spatial: false,
            },
            DistanceBounds::default(),
        )?;
        drop(shadow);
        if let Err(e) = channel.add_dsp(0, dsp) {
            let _ = channel.stop();
            return Err(e);
        }
        Ok(channel)
    }

    #[allow(clippy::too_many_arguments)]
    fn play_source_locked(
        &self,
        shadow: &mut Shadow,
        source: Box<dyn PcmSource>,
        sound: SoundId,
        group: Option<&ChannelGroup>,
        paused: bool,
        mode: Mode,
        bounds: DistanceBounds,
    ) -> Result<Channel> {
        let group_id = match group {
            Some(g) => {
                shadow.groups.get(g.id.0)?;
                g.id
            }
            None => shadow.master,
        };
        let group_bus = shadow.groups.get(group_id.0)?.bus_unit;

        let source_unit = shadow.units.insert(ShadowUnit {
            role: UnitRole::ChannelSource,
        })?;
        let fader_unit = match shadow.units.insert(ShadowUnit {
            role: UnitRole::ChannelFader,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = shadow.units.remove(source_unit);
                return Err(e);
            }
        };
        let source_to_fader = shadow.connections.insert(ShadowConnection {
            src_unit: source_unit.slot,
            dst_unit: fader_unit.slot,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;
        let to_bus = shadow.connections.insert(ShadowConnection {
            src_unit: fader_unit.slot,
            dst_unit: group_bus,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        let channel_handle = match shadow.channels.insert(ShadowChannel {
            sound,
            group: group_id,
            source_unit: source_unit.slot,
            fader_unit: fader_unit.slot,
            bus_conn: ConnectionId(to_bus),
            chain: Vec::new(),
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            mute: false,
            paused,
            frequency: None,
            looping: mode.looping,
            start_sample: None,
            end_sample: None,
            stop_at_end: false,
            spatial: mode.spatial,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                // Fixed channel budget exhausted: roll the unit/connection
                // allocations back so nothing is half-created.
                let _ = shadow.units.remove(source_unit);
                let _ = shadow.units.remove(fader_unit);
                let _ = shadow.connections.remove(source_to_fader);
                let _ = shadow.connections.remove(to_bus);
                return Err(e);
            }
        };
        shadow
            .groups
            .get_mut(group_id.0)?
            .channels
            .push(ChannelId(channel_handle));

        let seq = shadow.next_seq;
        shadow.next_seq += 1;

        let mut render_channel = RenderChannel::new(
            source,
            group_id.slot(),
            source_unit.slot,
            fader_unit.slot,
            to_bus.slot,
            channel_handle.generation,
            seq,
            paused,
        );
        render_channel.looping = mode.looping;
        render_channel.distance_bounds = bounds;
        if mode.spatial {
            render_channel.spatial = Some(EmitterAttributes::default());
        }

        self.shared.send(Command::Batch(vec![
            Command::AddUnit {
                slot: source_unit.slot,
                unit: RenderUnit::new(
                    "channel:source".into(),
                    UnitKind::Source {
                        channel_slot: channel_handle.slot,
                    },
                    None,
                ),
            },
            Command::AddUnit {
                slot: fader_unit.slot,
                unit: RenderUnit::new(
                    "channel:fader".into(),
                    UnitKind::Fader(FaderState::new()),
                    Some(self.shared.output_channels),
                ),
            },
            Command::AddChannel {
                slot: channel_handle.slot,
                channel: Box::new(render_channel),
            },
            Command::Connect {
                conn_slot: source_to_fader.slot,
                src: source_unit.slot,
                dst: fader_unit.slot,
                explicit: false,
            },
            Command::Connect {
                conn_slot: to_bus.slot,
                src: fader_unit.slot,
                dst: group_bus,
                explicit: false,
            },
        ]));

        Ok(Channel {
            id: ChannelId(channel_handle),
            shared: self.shared.clone(),
        })
    }

    /// Applies deferred housekeeping: drains render completions and loader
    /// results. Call periodically from the application loop.
    pub fn update(&self) -> Result<()> {
        drop(self.shared.lock());
        Ok(())
    }

    /// Halts mixing: the render tick outputs silence and the clock freezes.
    pub fn mixer_suspend(&self) -> Result<()> {
        self.shared.state.suspend();
        Ok(())
    }

    /// Resumes mixing after [`System::mixer_suspend`].
    pub fn mixer_resume(&self) -> Result<()> {
        self.shared.state.resume();
        Ok(())
    }

    pub fn state(&self) -> SystemState {
        self.shared.state.state()
    }

    /// The last-published render snapshot (never blocks the render tick).
    pub fn metrics(&self) -> EngineMetrics {
        self.shared.state.metrics()
    }

    /// The output sample clock.
    pub fn dsp_clock(&self) -> u64 {
        self.shared.clock.now()
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn block_frames(&self) -> usize {
        self.shared.block_frames
    }

    pub fn output_channels(&self) -> u16 {
        self.shared.output_channels
    }

    /// Positions the listener for 3D channels.
    pub fn set_3d_listener_attributes(
        &self,
        position: Vector3,
        velocity: Vector3,
        forward: Vector3,
        up: Vector3,
    ) -> Result<()> {
        let listener = Listener {
            position,
            velocity,
            forward,
            up,
        };
        let mut shadow = self.shared.lock();
        shadow.listener = listener;
        self.shared.send(Command::SetListener { listener });
        Ok(())
    }

    /// The listener attributes last set on this system.
    pub fn get_3d_listener_attributes(&self) -> Listener {
        self.shared.lock().listener
    }

    /// Shuts the engine down; the ticker exits after the current block.
    pub fn release(&self) {
        self.shared.state.request_shutdown();
        info!("Engine shutdown requested");
    }
}

/// A loaded (or loading) sound.
#[derive(Clone)]
pub struct Sound {
    id: SoundId,
    shared: Arc<ControlShared>,
}

impl Sound {
    /// The load state machine: Unloaded -> Loading -> Loaded | Error.
    pub fn state(&self) -> Result<LoadState> {
        let shadow = self.shared.lock();
        let entry = shadow.sounds.get(self.id.0)?;
        Ok(match &entry.kind {
            SoundKind::File { cell } => cell.state(),
            _ => LoadState::Loaded,
        })
    }

    /// Why loading failed, if it did.
    pub fn load_error(&self) -> Result<Option<String>> {
        let shadow = self.shared.lock();
        let entry = shadow.sounds.get(self.id.0)?;
        Ok(match &entry.kind {
            SoundKind::File { cell } => cell.error(),
            _ => None,
        })
    }

    /// Length in source-native frames (convert with
    /// [`crate::clock::output_samples`] before scheduling against the
    /// output clock).
    pub fn length_frames(&self) -> Result<Option<u64>> {
        let shadow = self.shared.lock();
        let entry = shadow.sounds.get(self.id.0)?;
        Ok(match &entry.kind {
            SoundKind::Memory(data) => Some(data.frames()),
            SoundKind::File { cell } => match cell.state() {
                LoadState::Loaded => cell.data().map(|d| d.frames()),
                _ => return Err(EngineError::NotReady("sound is still loading".into())),
            },
            SoundKind::Stream { length_frames, .. } => *length_frames,
            SoundKind::User(factory) => factory.describe().length_frames,
        })
    }

    /// The source's native sample rate.
    pub fn sample_rate(&self) -> Result<u32> {
        let shadow = self.shared.lock();
        let entry = shadow.sounds.get(self.id.0)?;
        Ok(match &entry.kind {
            SoundKind::Memory(data) => data.sample_rate(),
            SoundKind::File { cell } => match cell.state() {
                LoadState::Loaded => cell.data().map(|d| d.sample_rate()).unwrap_or(0),
                _ => return Err(EngineError::NotReady("sound is still loading".into())),
            },
            SoundKind::Stream { sample_rate, .. } => *sample_rate,
            SoundKind::User(factory) => factory.describe().sample_rate,
        })
    }

    /// Overrides the default playback mode applied to new channels.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut shadow = self.shared.lock();
        shadow.sounds.get_mut(self.id.0)?.mode = mode;
        Ok(())
    }

    /// Sets the distance rolloff bounds used when channels of this sound
    /// are 3D.
    pub fn set_3d_min_max_distance(&self, min: f32, max: f32) -> Result<()> {
        if !(min > 0.0 && max > min) {
            return Err(EngineError::param("require 0 < min < max"));
        }
        let mut shadow = self.shared.lock();
        shadow.sounds.get_mut(self.id.0)?.bounds = DistanceBounds { min, max };
        Ok(())
    }

    /// Frees the sound entry. Channels already playing it keep their data.
    pub fn release(&self) -> Result<()> {
        let mut shadow = self.shared.lock();
        shadow.sounds.remove(self.id.0)?;
        Ok(())
    }
}

/// A playing (or scheduled) channel handle.
///
/// Handles are validated on every call; once the channel stops (explicitly
/// or by reaching end of data) all operations fail with `InvalidHandle`.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    shared: Arc<ControlShared>,
}

impl Channel {
    fn mutate(
        &self,
        f: impl FnOnce(&mut ShadowChannel) -> Result<Command>,
    ) -> Result<()> {
        let mut shadow = self.shared.lock();
        let channel = shadow.channels.get_mut(self.id.0)?;
        let command = f(channel)?;
        self.shared.send(command);
        Ok(())
    }

    /// True while the handle refers to a live channel.
    pub fn is_playing(&self) -> bool {
        self.shared.lock().channels.contains(self.id.0)
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let slot = self.id.slot();
        self.mutate(|c| {
            c.paused = paused;
            Ok(Command::SetChannelPaused { slot, paused })
        })
    }

    pub fn get_paused(&self) -> Result<bool> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.paused)
    }

    pub fn get_volume(&self) -> Result<f32> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.volume)
    }

    pub fn get_pitch(&self) -> Result<f32> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.pitch)
    }

    pub fn get_pan(&self) -> Result<f32> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.pan)
    }

    pub fn get_mute(&self) -> Result<bool> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.mute)
    }

    /// The frequency override, if one was set.
    pub fn get_frequency(&self) -> Result<Option<f32>> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.frequency)
    }

    pub fn get_looping(&self) -> Result<bool> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.looping)
    }

    /// True when the channel was created from a 3D sound or positioned via
    /// [`Channel::set_3d_attributes`].
    pub fn is_3d(&self) -> Result<bool> {
        let shadow = self.shared.lock();
        Ok(shadow.channels.get(self.id.0)?.spatial)
    }

    /// The sound this channel is playing.
    pub fn current_sound(&self) -> Result<Sound> {
        let shadow = self.shared.lock();
        let sound = shadow.channels.get(self.id.0)?.sound;
        Ok(Sound {
            id: sound,
            shared: self.shared.clone(),
        })
    }

    /// Linear volume; composes multiplicatively with the owning groups.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            return Err(EngineError::param("volume must be finite"));
        }
        let slot = self.id.slot();
        self.mutate(|c| {
            c.volume = volume;
            Ok(Command::SetChannelVolume { slot, volume })
        })
    }

    /// Playback rate multiplier on top of the source rate.
    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        if !(0.0..=16.0).contains(&pitch) {
            return Err(EngineError::param("pitch must be in 0..=16"));
        }
        let slot = self.id.slot();
        self.mutate(|c| {
            c.pitch = pitch;
            Ok(Command::SetChannelPitch { slot, pitch })
        })
    }

    /// Pan position in [-1, 1]; ignored while the channel is 3D.
    pub fn set_pan(&self, pan: f32) -> Result<()> {
        if !(-1.0..=1.0).contains(&pan) {
            return Err(EngineError::param("pan must be in -1..=1"));
        }
        let slot = self.id.slot();
        self.mutate(|c| {
            c.pan = pan;
            Ok(Command::SetChannelPan { slot, pan })
        })
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        let slot = self.id.slot();
        self.mutate(|c| {
            c.mute = mute;
            Ok(Command::SetChannelMute { slot, mute })
        })
    }

    /// Overrides the source's native rate for cursor stepping (Hz).
    pub fn set_frequency(&self, frequency: f32) -> Result<()> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(EngineError::param("frequency must be positive"));
        }
        let slot = self.id.slot();
        self.mutate(|c| {
            c.frequency = Some(frequency);
            Ok(Command::SetChannelFrequency {
                slot,
                frequency: Some(frequency),
            })
        })
    }

    pub fn set_looping(&self, looping: bool) -> Result<()> {
        let slot = self.id.slot();
        self.mutate(|c| {
            c.looping = looping;
            Ok(Command::SetChannelLooping { slot, looping })
        })
    }

    /// Schedules activation (and optionally deactivation) against the
    /// output sample clock. Both values are absolute clock samples; convert
    /// source-rate lengths with [`crate::clock::output_samples`] first.
    /// With `stop_at_end` false the channel pauses at `end` instead of
    /// stopping.
    pub fn set_delay(
        &self,
        start: Option<u64>,
        end: Option<u64>,
        stop_at_end: bool,
    ) -> Result<()> {
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(EngineError::param("delay end must be after start"));
            }
        }
        let slot = self.id.slot();
        self.mutate(|c| {
            c.start_sample = start;
            c.end_sample = end;
            c.stop_at_end = stop_at_end;
            Ok(Command::SetChannelDelay {
                slot,
                start,
                end,
                stop_at_end,
            })
        })
    }

    pub fn get_delay(&self) -> Result<(Option<u64>, Option<u64>, bool)> {
        let shadow = self.shared.lock();
        let channel = shadow.channels.get(self.id.0)?;
        Ok((channel.start_sample, channel.end_sample, channel.stop_at_end))
    }

    /// Places the channel in 3D space.
    pub fn set_3d_attributes(&self, position: Vector3, velocity: Vector3) -> Result<()> {
        let slot = self.id.slot();
        self.mutate(|c| {
            c.spatial = true;
            Ok(Command::SetChannelSpatial {
                slot,
                attrs: EmitterAttributes { position, velocity },
            })
        })
    }

    /// Moves the channel to another group.
    pub fn set_channel_group(&self, group: &ChannelGroup) -> Result<()> {
        let mut shadow = self.shared.lock();
        shadow.groups.get(group.id.0)?;
        let new_bus = shadow.groups.get(group.id.0)?.bus_unit;

        let channel = shadow.channels.get(self.id.0)?;
        let old_group = channel.group;
        if old_group == group.id {
            return Ok(());
        }
        let fader_slot = channel.fader_unit;
        let old_conn = channel.bus_conn;

        shadow.connections.remove(old_conn.0)?;
        let new_conn = shadow.connections.insert(ShadowConnection {
            src_unit: fader_slot,
            dst_unit: new_bus,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        let channel = shadow.channels.get_mut(self.id.0)?;
        channel.group = group.id;
        channel.bus_conn = ConnectionId(new_conn);

        if let Ok(old) = shadow.groups.get_mut(old_group.0) {
            old.channels.retain(|c| *c != self.id);
        }
        shadow.groups.get_mut(group.id.0)?.channels.push(self.id);

        self.shared.send(Command::Batch(vec![
            Command::Disconnect {
                conn_slot: old_conn.slot(),
            },
            Command::Connect {
                conn_slot: new_conn.slot,
                src: fader_slot,
                dst: new_bus,
                explicit: false,
            },
            Command::SetChannelGroup {
                slot: self.id.slot(),
                group_slot: group.id.slot(),
            },
        ]));
        Ok(())
    }

    /// Replaces the output mix matrix on this channel's connection into its
    /// group. Rows must match the engine output layout.
    pub fn set_mix_matrix(&self, matrix: Option<MixMatrix>) -> Result<()> {
        if let Some(m) = &matrix {
            if m.in_channels() != self.shared.output_channels {
                return Err(EngineError::FormatMismatch {
                    expected: self.shared.output_channels,
                    actual: m.in_channels(),
                });
            }
        }
        let mut shadow = self.shared.lock();
        let conn = shadow.channels.get(self.id.0)?.bus_conn;
        shadow.connections.get_mut(conn.0)?.matrix = matrix.clone();
        self.shared.send(Command::SetMixMatrix {
            conn_slot: conn.slot(),
            matrix,
        });
        Ok(())
    }

    /// Splices a detached DSP unit into this channel's chain at `index`
    /// (0 = nearest the output).
    pub fn add_dsp(&self, index: usize, dsp: &Dsp) -> Result<()> {
        let mut shadow = self.shared.lock();
        match &shadow.units.get(dsp.id.0)?.role {
            UnitRole::Effect { attached: true, .. } => {
                return Err(EngineError::param("DSP is already attached"))
            }
            UnitRole::Effect { .. } => {}
            _ => return Err(EngineError::InvalidHandle),
        }
        let channel = shadow.channels.get(self.id.0)?;
        if index > channel.chain.len() {
            return Err(EngineError::param(format!(
                "chain position {index} out of range (len {})",
                channel.chain.len()
            )));
        }

        // Neighbors around the insertion point: D (downstream) and U
        // (upstream) currently share an edge that gets split.
        let downstream = if index == 0 {
            channel.fader_unit
        } else {
            channel.chain[index - 1].slot()
        };
        let upstream = if index == channel.chain.len() {
            channel.source_unit
        } else {
            channel.chain[index].slot()
        };

        let old_edge = shadow
            .connections
            .iter()
            .find(|(_, c)| !c.explicit && c.src_unit == upstream && c.dst_unit == downstream)
            .map(|(h, _)| h)
            .ok_or(EngineError::InvalidHandle)?;
        shadow.connections.remove(old_edge)?;

        let up_edge = shadow.connections.insert(ShadowConnection {
            src_unit: upstream,
            dst_unit: dsp.id.slot(),
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;
        let down_edge = shadow.connections.insert(ShadowConnection {
            src_unit: dsp.id.slot(),
            dst_unit: downstream,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        let channel = shadow.channels.get_mut(self.id.0)?;
        channel.chain.insert(index, dsp.id);
        let chain_units: Vec<u32> = channel.chain.iter().map(|d| d.slot()).collect();

        if let UnitRole::Effect { attached, .. } = &mut shadow.units.get_mut(dsp.id.0)?.role {
            *attached = true;
        }

        self.shared.send(Command::Batch(vec![
            Command::Disconnect {
                conn_slot: old_edge.slot,
            },
            Command::Connect {
                conn_slot: up_edge.slot,
                src: upstream,
                dst: dsp.id.slot(),
                explicit: false,
            },
            Command::Connect {
                conn_slot: down_edge.slot,
                src: dsp.id.slot(),
                dst: downstream,
                explicit: false,
            },
            Command::SetChannelChain {
                slot: self.id.slot(),
                chain_units,
            },
        ]));
        Ok(())
    }

    /// Removes a DSP unit from this channel's chain, reconnecting its
    /// neighbors.
    pub fn remove_dsp(&self, dsp: &Dsp) -> Result<()> {
        let mut shadow = self.shared.lock();
        let channel = shadow.channels.get(self.id.0)?;
        let index = channel
            .chain
            .iter()
            .position(|d| *d == dsp.id)
            .ok_or(EngineError::InvalidHandle)?;

        let downstream = if index == 0 {
            channel.fader_unit
        } else {
            channel.chain[index - 1].slot()
        };
        let upstream = if index == channel.chain.len() - 1 {
            channel.source_unit
        } else {
            channel.chain[index + 1].slot()
        };
        let target = dsp.id.slot();

        let up_edge = shadow
            .connections
            .iter()
            .find(|(_, c)| !c.explicit && c.src_unit == upstream && c.dst_unit == target)
            .map(|(h, _)| h)
            .ok_or(EngineError::InvalidHandle)?;
        let down_edge = shadow
            .connections
            .iter()
            .find(|(_, c)| !c.explicit && c.src_unit == target && c.dst_unit == downstream)
            .map(|(h, _)| h)
            .ok_or(EngineError::InvalidHandle)?;
        shadow.connections.remove(up_edge)?;
        shadow.connections.remove(down_edge)?;
        let joined = shadow.connections.insert(ShadowConnection {
            src_unit: upstream,
            dst_unit: downstream,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        let channel = shadow.channels.get_mut(self.id.0)?;
        channel.chain.remove(index);
        let chain_units: Vec<u32> = channel.chain.iter().map(|d| d.slot()).collect();

        if let UnitRole::Effect { attached, .. } = &mut shadow.units.get_mut(dsp.id.0)?.role {
            *attached = false;
        }

        self.shared.send(Command::Batch(vec![
            Command::Disconnect {
                conn_slot: up_edge.slot,
            },
            Command::Disconnect {
                conn_slot: down_edge.slot,
            },
            Command::Connect {
                conn_slot: joined.slot,
                src: upstream,
                dst: downstream,
                explicit: false,
            },
            Command::SetChannelChain {
                slot: self.id.slot(),
                chain_units,
            },
        ]));
        Ok(())
    }

    /// Stops playback and invalidates this handle. Idempotent: stopping an
    /// already-gone channel succeeds, but any other operation on it fails
    /// with `InvalidHandle`.
    pub fn stop(&self) -> Result<()> {
        let mut shadow = self.shared.lock();
        let Ok(channel) = self.shared.shadow_channel_remove(&mut shadow, self.id.0) else {
            return Ok(());
        };
        shadow.release_channel_objects(&channel);
        self.shared.send(Command::StopChannel {
            slot: self.id.slot(),
        });
        debug!(slot = self.id.slot(), "Channel stopped");
        Ok(())
    }
}

/// A hierarchical channel group handle.
#[derive(Clone)]
pub struct ChannelGroup {
    id: GroupId,
    shared: Arc<ControlShared>,
}

impl ChannelGroup {
    pub fn name(&self) -> Result<String> {
        let shadow = self.shared.lock();
        Ok(shadow.groups.get(self.id.0)?.name.clone())
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            return Err(EngineError::param("volume must be finite"));
        }
        let mut shadow = self.shared.lock();
        shadow.groups.get_mut(self.id.0)?.volume = volume;
        self.shared.send(Command::SetGroupVolume {
            slot: self.id.slot(),
            volume,
        });
        Ok(())
    }

    pub fn get_volume(&self) -> Result<f32> {
        let shadow = self.shared.lock();
        Ok(shadow.groups.get(self.id.0)?.volume)
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        if !(0.0..=16.0).contains(&pitch) {
            return Err(EngineError::param("pitch must be in 0..=16"));
        }
        let mut shadow = self.shared.lock();
        shadow.groups.get_mut(self.id.0)?.pitch = pitch;
        self.shared.send(Command::SetGroupPitch {
            slot: self.id.slot(),
            pitch,
        });
        Ok(())
    }

    pub fn get_pitch(&self) -> Result<f32> {
        let shadow = self.shared.lock();
        Ok(shadow.groups.get(self.id.0)?.pitch)
    }

    pub fn set_pan(&self, pan: f32) -> Result<()> {
        if !(-1.0..=1.0).contains(&pan) {
            return Err(EngineError::param("pan must be in -1..=1"));
        }
        let mut shadow = self.shared.lock();
        shadow.groups.get_mut(self.id.0)?.pan = pan;
        self.shared.send(Command::SetGroupPan {
            slot: self.id.slot(),
            pan,
        });
        Ok(())
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        let mut shadow = self.shared.lock();
        shadow.groups.get_mut(self.id.0)?.mute = mute;
        self.shared.send(Command::SetGroupMute {
            slot: self.id.slot(),
            mute,
        });
        Ok(())
    }

    pub fn get_mute(&self) -> Result<bool> {
        let shadow = self.shared.lock();
        Ok(shadow.groups.get(self.id.0)?.mute)
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let mut shadow = self.shared.lock();
        shadow.groups.get_mut(self.id.0)?.paused = paused;
        self.shared.send(Command::SetGroupPaused {
            slot: self.id.slot(),
            paused,
        });
        Ok(())
    }

    pub fn get_paused(&self) -> Result<bool> {
        let shadow = self.shared.lock();
        Ok(shadow.groups.get(self.id.0)?.paused)
    }

    /// Re-parents `child` under this group. Rejected if it would create a
    /// cycle in the group tree.
    pub fn add_group(&self, child: &ChannelGroup) -> Result<()> {
        let mut shadow = self.shared.lock();
        if child.id == shadow.master {
            return Err(EngineError::param("cannot re-parent the master group"));
        }
        shadow.groups.get(child.id.0)?;

        // Walk up from self; finding `child` means child is an ancestor.
        let mut cursor = Some(self.id);
        while let Some(id) = cursor {
            if id == child.id {
                return Err(EngineError::CycleDetected);
            }
            cursor = shadow.groups.get(id.0)?.parent;
        }

        let own_bus = shadow.groups.get(self.id.0)?.bus_unit;
        let child_entry = shadow.groups.get(child.id.0)?;
        let child_fader = child_entry.fader_unit;
        let old_parent = child_entry.parent;
        let old_conn = child_entry.parent_conn;

        if let Some(old_conn) = old_conn {
            shadow.connections.remove(old_conn.0)?;
        }
        let new_conn = shadow.connections.insert(ShadowConnection {
            src_unit: child_fader,
            dst_unit: own_bus,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        if let Some(old_parent) = old_parent {
            if let Ok(old) = shadow.groups.get_mut(old_parent.0) {
                old.children.retain(|c| *c != child.id);
            }
        }
        {
            let child_entry = shadow.groups.get_mut(child.id.0)?;
            child_entry.parent = Some(self.id);
            child_entry.parent_conn = Some(ConnectionId(new_conn));
        }
        shadow.groups.get_mut(self.id.0)?.children.push(child.id);

        let mut commands = Vec::new();
        if let Some(old_conn) = old_conn {
            commands.push(Command::Disconnect {
                conn_slot: old_conn.slot(),
            });
        }
        commands.push(Command::Connect {
            conn_slot: new_conn.slot,
            src: child_fader,
            dst: own_bus,
            explicit: false,
        });
        commands.push(Command::SetGroupParent {
            slot: child.id.slot(),
            parent_slot: self.id.slot(),
        });
        self.shared.send(Command::Batch(commands));
        Ok(())
    }

    /// Splices a detached DSP unit into this group's chain at `index`
    /// (0 = nearest the output).
    pub fn add_dsp(&self, index: usize, dsp: &Dsp) -> Result<()> {
        let mut shadow = self.shared.lock();
        match &shadow.units.get(dsp.id.0)?.role {
            UnitRole::Effect { attached: true, .. } => {
                return Err(EngineError::param("DSP is already attached"))
            }
            UnitRole::Effect { .. } => {}
            _ => return Err(EngineError::InvalidHandle),
        }
        let group = shadow.groups.get(self.id.0)?;
        if index > group.chain.len() {
            return Err(EngineError::param(format!(
                "chain position {index} out of range (len {})",
                group.chain.len()
            )));
        }

        let downstream = if index == 0 {
            group.fader_unit
        } else {
            group.chain[index - 1].slot()
        };
        let upstream = if index == group.chain.len() {
            group.bus_unit
        } else {
            group.chain[index].slot()
        };

        let old_edge = shadow
            .connections
            .iter()
            .find(|(_, c)| !c.explicit && c.src_unit == upstream && c.dst_unit == downstream)
            .map(|(h, _)| h)
            .ok_or(EngineError::InvalidHandle)?;
        shadow.connections.remove(old_edge)?;

        let up_edge = shadow.connections.insert(ShadowConnection {
            src_unit: upstream,
            dst_unit: dsp.id.slot(),
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;
        let down_edge = shadow.connections.insert(ShadowConnection {
            src_unit: dsp.id.slot(),
            dst_unit: downstream,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        shadow.groups.get_mut(self.id.0)?.chain.insert(index, dsp.id);
        if let UnitRole::Effect { attached, .. } = &mut shadow.units.get_mut(dsp.id.0)?.role {
            *attached = true;
        }

        self.shared.send(Command::Batch(vec![
            Command::Disconnect {
                conn_slot: old_edge.slot,
            },
            Command::Connect {
                conn_slot: up_edge.slot,
                src: upstream,
                dst: dsp.id.slot(),
                explicit: false,
            },
            Command::Connect {
                conn_slot: down_edge.slot,
                src: dsp.id.slot(),
                dst: downstream,
                explicit: false,
            },
        ]));
        Ok(())
    }

    /// Removes a DSP unit from this group's chain.
    pub fn remove_dsp(&self, dsp: &Dsp) -> Result<()> {
        let mut shadow = self.shared.lock();
        let group = shadow.groups.get(self.id.0)?;
        let index = group
            .chain
            .iter()
            .position(|d| *d == dsp.id)
            .ok_or(EngineError::InvalidHandle)?;

        let downstream = if index == 0 {
            group.fader_unit
        } else {
            group.chain[index - 1].slot()
        };
        let upstream = if index == group.chain.len() - 1 {
            group.bus_unit
        } else {
            group.chain[index + 1].slot()
        };
        let target = dsp.id.slot();

        let up_edge = shadow
            .connections
            .iter()
            .find(|(_, c)| !c.explicit && c.src_unit == upstream && c.dst_unit == target)
            .map(|(h, _)| h)
            .ok_or(EngineError::InvalidHandle)?;
        let down_edge = shadow
            .connections
            .iter()
            .find(|(_, c)| !c.explicit && c.src_unit == target && c.dst_unit == downstream)
            .map(|(h, _)| h)
            .ok_or(EngineError::InvalidHandle)?;
        shadow.connections.remove(up_edge)?;
        shadow.connections.remove(down_edge)?;
        let joined = shadow.connections.insert(ShadowConnection {
            src_unit: upstream,
            dst_unit: downstream,
            explicit: false,
            matrix: None,
            gain: 1.0,
        })?;

        shadow.groups.get_mut(self.id.0)?.chain.remove(index);
        if let UnitRole::Effect { attached, .. } = &mut shadow.units.get_mut(dsp.id.0)?.role {
            *attached = false;
        }

        self.shared.send(Command::Batch(vec![
            Command::Disconnect {
                conn_slot: up_edge.slot,
            },
            Command::Disconnect {
                conn_slot: down_edge.slot,
            },
            Command::Connect {
                conn_slot: joined.slot,
                src: upstream,
                dst: downstream,
                explicit: false,
            },
        ]));
        Ok(())
    }

    /// Releases the group; its channels and child groups move to the master
    /// group. The master group itself cannot be released.
    pub fn release(&self) -> Result<()> {
        let master = {
            let shadow = self.shared.lock();
            if self.id == shadow.master {
                return Err(EngineError::param("the master group cannot be released"));
            }
            shadow.groups.get(self.id.0)?;
            ChannelGroup {
                id: shadow.master,
                shared: self.shared.clone(),
            }
        };

        // Move members out one by one (each move is itself atomic).
        loop {
            let child = {
                let shadow = self.shared.lock();
                shadow.groups.get(self.id.0)?.children.first().copied()
            };
            match child {
                Some(id) => master.add_group(&ChannelGroup {
                    id,
                    shared: self.shared.clone(),
                })?,
                None => break,
            }
        }
        loop {
            let channel = {
                let shadow = self.shared.lock();
                shadow.groups.get(self.id.0)?.channels.first().copied()
            };
            match channel {
                Some(id) => Channel {
                    id,
                    shared: self.shared.clone(),
                }
                .set_channel_group(&master)?,
                None => break,
            }
        }

        let mut shadow = self.shared.lock();
        let group = shadow.groups.remove(self.id.0)?;
        if let Some(parent) = group.parent {
            if let Ok(p) = shadow.groups.get_mut(parent.0) {
                p.children.retain(|c| *c != self.id);
            }
        }
        let mut commands = Vec::new();
        if let Some(conn) = group.parent_conn {
            shadow.connections.remove(conn.0)?;
            commands.push(Command::Disconnect {
                conn_slot: conn.slot(),
            });
        }
        // The bus->fader edge dies with the units.
        let bus_handle = RawHandle {
            slot: group.bus_unit,
            generation: shadow.unit_generation(group.bus_unit),
        };
        let fader_handle = RawHandle {
            slot: group.fader_unit,
            generation: shadow.unit_generation(group.fader_unit),
        };
        let _ = shadow.units.remove(bus_handle);
        let _ = shadow.units.remove(fader_handle);
        let stale: Vec<RawHandle> = shadow
            .connections
            .iter()
            .filter(|(_, c)| {
                c.src_unit == group.bus_unit
                    || c.dst_unit == group.bus_unit
                    || c.src_unit == group.fader_unit
                    || c.dst_unit == group.fader_unit
            })
            .map(|(h, _)| h)
            .collect();
        for handle in stale {
            let _ = shadow.connections.remove(handle);
        }
        commands.push(Command::RemoveUnit {
            slot: group.bus_unit,
        });
        commands.push(Command::RemoveUnit {
            slot: group.fader_unit,
        });
        commands.push(Command::RemoveGroup {
            slot: self.id.slot(),
        });
        self.shared.send(Command::Batch(commands));
        debug!(name = %group.name, "Channel group released");
        Ok(())
    }
}

/// A DSP unit handle.
#[derive(Clone)]
pub struct Dsp {
    id: DspId,
    shared: Arc<ControlShared>,
}

impl Dsp {
    fn with_effect<T>(
        &self,
        f: impl FnOnce(&mut DspDescriptor, &mut Vec<ParamValue>, &mut bool, &mut bool, &mut bool) -> Result<T>,
    ) -> Result<T> {
        let mut shadow = self.shared.lock();
        let unit = shadow.units.get_mut(self.id.0)?;
        match &mut unit.role {
            UnitRole::Effect {
                descriptor,
                params,
                bypass,
                active,
                faulted,
                ..
            } => f(descriptor, params, bypass, active, faulted),
            _ => Err(EngineError::InvalidHandle),
        }
    }

    pub fn name(&self) -> Result<String> {
        self.with_effect(|descriptor, _, _, _, _| Ok(descriptor.name.clone()))
    }

    pub fn parameter_count(&self) -> Result<usize> {
        self.with_effect(|descriptor, _, _, _, _| Ok(descriptor.params.len()))
    }

    /// The definition (name, range, default) of one parameter.
    pub fn parameter_info(&self, index: usize) -> Result<ParamDef> {
        self.with_effect(|descriptor, _, _, _, _| {
            descriptor
                .params
                .get(index)
                .cloned()
                .ok_or_else(|| EngineError::param(format!("no parameter {index}")))
        })
    }

    fn set_parameter(&self, index: usize, value: ParamValue) -> Result<()> {
        let slot = self.id.slot();
        self.with_effect(|descriptor, params, _, _, _| {
            let def = descriptor
                .params
                .get(index)
                .ok_or_else(|| EngineError::param(format!("no parameter {index}")))?;
            if !value.matches(def) {
                return Err(EngineError::param(format!(
                    "value out of range for parameter '{}'",
                    def.name
                )));
            }
            params[index] = value.clone();
            Ok(())
        })?;
        self.shared.send(Command::SetParam { slot, index, value });
        Ok(())
    }

    pub fn set_parameter_float(&self, index: usize, value: f32) -> Result<()> {
        self.set_parameter(index, ParamValue::Float(value))
    }

    pub fn set_parameter_int(&self, index: usize, value: i32) -> Result<()> {
        self.set_parameter(index, ParamValue::Int(value))
    }

    pub fn set_parameter_bool(&self, index: usize, value: bool) -> Result<()> {
        self.set_parameter(index, ParamValue::Bool(value))
    }

    pub fn set_parameter_data(&self, index: usize, value: Vec<u8>) -> Result<()> {
        self.set_parameter(index, ParamValue::Data(value))
    }

    /// The last value set through this API (control-side view).
    pub fn get_parameter(&self, index: usize) -> Result<ParamValue> {
        self.with_effect(|_, params, _, _, _| {
            params
                .get(index)
                .cloned()
                .ok_or_else(|| EngineError::param(format!("no parameter {index}")))
        })
    }

    /// Pass-through mode: audio flows, processing is skipped.
    pub fn set_bypass(&self, bypass: bool) -> Result<()> {
        let slot = self.id.slot();
        self.with_effect(|_, _, b, _, _| {
            *b = bypass;
            Ok(())
        })?;
        self.shared.send(Command::SetBypass { slot, bypass });
        Ok(())
    }

    pub fn get_bypass(&self) -> Result<bool> {
        self.with_effect(|_, _, bypass, _, _| Ok(*bypass))
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        let slot = self.id.slot();
        self.with_effect(|_, _, _, a, _| {
            *a = active;
            Ok(())
        })?;
        self.shared.send(Command::SetActive { slot, active });
        Ok(())
    }

    pub fn get_active(&self) -> Result<bool> {
        self.with_effect(|_, _, _, active, _| Ok(*active))
    }

    /// True once the unit faulted during render and was force-bypassed.
    pub fn is_faulted(&self) -> Result<bool> {
        self.with_effect(|_, _, _, _, faulted| Ok(*faulted))
    }

    /// Clears processor history (delay lines, filter memory).
    pub fn reset(&self) -> Result<()> {
        let slot = self.id.slot();
        self.with_effect(|_, _, _, _, _| Ok(()))?;
        self.shared.send(Command::ResetUnit { slot });
        Ok(())
    }

    /// Destroys the unit. It must be detached from any chain first.
    pub fn release(&self) -> Result<()> {
        let mut shadow = self.shared.lock();
        match &shadow.units.get(self.id.0)?.role {
            UnitRole::Effect { attached: true, .. } => {
                return Err(EngineError::param("DSP is still attached"))
            }
            UnitRole::Effect { .. } => {}
            _ => return Err(EngineError::InvalidHandle),
        }
        // Drop any explicit connections touching this unit.
        let slot = self.id.slot();
        let stale: Vec<RawHandle> = shadow
            .connections
            .iter()
            .filter(|(_, c)| c.src_unit == slot || c.dst_unit == slot)
            .map(|(h, _)| h)
            .collect();
        let mut commands: Vec<Command> = stale
            .iter()
            .map(|h| Command::Disconnect { conn_slot: h.slot })
            .collect();
        for handle in stale {
            let _ = shadow.connections.remove(handle);
        }
        shadow.units.remove(self.id.0)?;
        commands.push(Command::RemoveUnit { slot });
        self.shared.send(Command::Batch(commands));
        Ok(())
    }
}

/// A connection handle returned by [`System::connect`].
#[derive(Clone)]
pub struct DspConnection {
    id: ConnectionId,
    shared: Arc<ControlShared>,
}

impl DspConnection {
    /// Sets an explicit mix matrix (None restores shape-adaptive default
    /// routing). An upstream channel-count change re-zeroes an explicit
    /// matrix rather than remapping it.
    pub fn set_mix_matrix(&self, matrix: Option<MixMatrix>) -> Result<()> {
        let mut shadow = self.shared.lock();
        shadow.connections.get_mut(self.id.0)?.matrix = matrix.clone();
        self.shared.send(Command::SetMixMatrix {
            conn_slot: self.id.slot(),
            matrix,
        });
        Ok(())
    }

    pub fn get_mix_matrix(&self) -> Result<Option<MixMatrix>> {
        let shadow = self.shared.lock();
        Ok(shadow.connections.get(self.id.0)?.matrix.clone())
    }

    /// Scalar gain applied on top of the matrix.
    pub fn set_mix(&self, gain: f32) -> Result<()> {
        if !gain.is_finite() {
            return Err(EngineError::param("gain must be finite"));
        }
        let mut shadow = self.shared.lock();
        shadow.connections.get_mut(self.id.0)?.gain = gain;
        self.shared.send(Command::SetConnectionGain {
            conn_slot: self.id.slot(),
            gain,
        });
        Ok(())
    }

    pub fn get_mix(&self) -> Result<f32> {
        let shadow = self.shared.lock();
        Ok(shadow.connections.get(self.id.0)?.gain)
    }
}
