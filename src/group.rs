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

//! Render-side channel groups.
//!
//! Groups form a tree rooted at the master group. Each group owns two graph
//! units: a bus that sums its children (channels and nested groups) and a
//! fader applying the group's own volume/pan/mute. Volume and pitch compose
//! multiplicatively down the tree, pause and mute compose as OR.

/// A channel group mirrored on the render side.
pub struct RenderGroup {
    pub name: String,
    /// Parent group slot; None only for the master group.
    pub parent: Option<u32>,
    /// Child group slots, in insertion order.
    pub children: Vec<u32>,
    /// Graph unit summing this group's children.
    pub bus_unit: u32,
    /// Graph unit applying this group's own volume/pan/mute.
    pub fader_unit: u32,
    /// Connection from this group's fader into the parent bus.
    pub parent_connection: u32,
    pub volume: f32,
    pub pitch: f32,
    pub pan: f32,
    pub mute: bool,
    pub paused: bool,
}

impl RenderGroup {
    pub fn new(
        name: String,
        parent: Option<u32>,
        bus_unit: u32,
        fader_unit: u32,
        parent_connection: u32,
    ) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            bus_unit,
            fader_unit,
            parent_connection,
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            mute: false,
            paused: false,
        }
    }

    /// The gain this group contributes to descendants' audibility.
    pub fn own_gain(&self) -> f32 {
        if self.mute {
            0.0
        } else {
            self.volume
        }
    }
}

/// Inherited (tree-composed) per-group values, recomputed each tick into
/// slot-indexed scratch vectors owned by the mixer.
#[derive(Clone, Copy)]
pub struct InheritedGroupState {
    /// Product of volumes (with mutes) from the master down to this group.
    pub gain: f32,
    /// Product of pitches from the master down to this group.
    pub pitch: f64,
    /// OR of pause flags from the master down to this group.
    pub paused: bool,
}

impl Default for InheritedGroupState {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pitch: 1.0,
            paused: false,
        }
    }
}
