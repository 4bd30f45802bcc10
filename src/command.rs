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

//! The control-to-render command queue.
//!
//! Every mutation of graph topology, channel state, or parameters travels
//! through these commands and is applied by the mixer at the start of a
//! tick, never to live structures mid-render. A control operation that
//! needs several mutations wraps them in `Batch` so a tick can never observe
//! half of it. Validation happens before enqueue; application is
//! unconditional.

use crate::channel::RenderChannel;
use crate::graph::{MixMatrix, ParamValue, RenderUnit};
use crate::group::RenderGroup;
use crate::spatial::{EmitterAttributes, Listener};

/// A mutation applied at the next tick boundary.
pub enum Command {
    /// Applies the contained commands back to back within one drain.
    Batch(Vec<Command>),

    // Graph topology and unit state.
    AddUnit { slot: u32, unit: RenderUnit },
    RemoveUnit { slot: u32 },
    Connect { conn_slot: u32, src: u32, dst: u32, explicit: bool },
    Disconnect { conn_slot: u32 },
    SetMixMatrix { conn_slot: u32, matrix: Option<MixMatrix> },
    SetConnectionGain { conn_slot: u32, gain: f32 },
    SetParam { slot: u32, index: usize, value: ParamValue },
    SetBypass { slot: u32, bypass: bool },
    SetActive { slot: u32, active: bool },
    ResetUnit { slot: u32 },

    // Channels.
    AddChannel { slot: u32, channel: Box<RenderChannel> },
    StopChannel { slot: u32 },
    SetChannelPaused { slot: u32, paused: bool },
    SetChannelVolume { slot: u32, volume: f32 },
    SetChannelPitch { slot: u32, pitch: f32 },
    SetChannelPan { slot: u32, pan: f32 },
    SetChannelMute { slot: u32, mute: bool },
    SetChannelFrequency { slot: u32, frequency: Option<f32> },
    SetChannelLooping { slot: u32, looping: bool },
    SetChannelDelay {
        slot: u32,
        start: Option<u64>,
        end: Option<u64>,
        stop_at_end: bool,
    },
    SetChannelSpatial { slot: u32, attrs: EmitterAttributes },
    SetChannelGroup { slot: u32, group_slot: u32 },
    /// Records a DSP unit as part of a channel's chain (for freezing on
    /// virtualization); the wiring itself travels as Connect/Disconnect.
    SetChannelChain { slot: u32, chain_units: Vec<u32> },

    // Groups.
    AddGroup { slot: u32, group: Box<RenderGroup> },
    RemoveGroup { slot: u32 },
    SetGroupParent { slot: u32, parent_slot: u32 },
    SetGroupVolume { slot: u32, volume: f32 },
    SetGroupPitch { slot: u32, pitch: f32 },
    SetGroupPan { slot: u32, pan: f32 },
    SetGroupMute { slot: u32, mute: bool },
    SetGroupPaused { slot: u32, paused: bool },

    // Global.
    SetListener { listener: Listener },
}

/// Events flowing back from the render context, drained by the control
/// context on every shadow access.
#[derive(Debug, Clone, Copy)]
pub enum RenderEvent {
    /// A channel reached its terminal state and was reclaimed by the mixer.
    /// The generation identifies which incarnation of the slot ended.
    ChannelEnded { slot: u32, generation: u32 },
    /// A DSP unit faulted during render and is now force-bypassed.
    UnitFaulted { slot: u32 },
}
