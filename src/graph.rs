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

//! The render-side DSP graph.
//!
//! Units and connections are mirrored from the control-side shadow via the
//! command queue; slot indices are shared between the two sides. The graph
//! is evaluated once per tick by pulling from the master head backward
//! through each unit's inputs; no locks are taken on this path.

pub mod connection;
pub mod unit;

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

pub use connection::{MixMatrix, RenderConnection};
pub use unit::{
    BlockProcessor, DspDescriptor, ParamDef, ParamKind, ParamValue, ProcessContext, ProcessFault,
};

use crate::buffer::SignalBuffer;
use crate::spatial::pan_gains;

/// Mixes `input` into `output` with the shape-adaptive default routing
/// (identity / mono spread / averaging downmix), without materializing a
/// matrix on the render path.
pub fn mix_default(input: &SignalBuffer, output: &mut SignalBuffer, gain: f32) {
    let frames = input.frames().min(output.frames());
    let in_ch = input.channels();
    let out_ch = output.channels();

    if in_ch == 1 {
        for r in 0..out_ch {
            for frame in 0..frames {
                let mixed = output.sample(frame, r) + input.sample(frame, 0) * gain;
                output.set_sample(frame, r, mixed);
            }
        }
    } else if out_ch == 1 {
        let g = gain / in_ch as f32;
        for c in 0..in_ch {
            for frame in 0..frames {
                let mixed = output.sample(frame, 0) + input.sample(frame, c) * g;
                output.set_sample(frame, 0, mixed);
            }
        }
    } else {
        for ch in 0..in_ch.min(out_ch) {
            for frame in 0..frames {
                let mixed = output.sample(frame, ch) + input.sample(frame, ch) * gain;
                output.set_sample(frame, ch, mixed);
            }
        }
    }
}

/// Gain/pan stage at the head of every channel and group. The mixer writes
/// the per-block target (own volume x mute x attenuation) before evaluation;
/// the fader ramps toward it across the block to avoid zipper noise.
pub struct FaderState {
    target_gain: f32,
    last_gain: f32,
    pan: f32,
    primed: bool,
}

impl FaderState {
    pub fn new() -> Self {
        Self {
            target_gain: 1.0,
            last_gain: 1.0,
            pan: 0.0,
            primed: false,
        }
    }

    pub fn set_target(&mut self, gain: f32, pan: f32) {
        self.target_gain = gain;
        self.pan = pan;
        if !self.primed {
            self.last_gain = gain;
            self.primed = true;
        }
    }

    fn process(&mut self, input: &SignalBuffer, output: &mut SignalBuffer) {
        let frames = input.frames().min(output.frames());
        let in_ch = input.channels();
        let out_ch = output.channels();

        // Route with pan where the shapes allow it, default-mix otherwise.
        if out_ch == 2 && in_ch == 1 {
            let (l, r) = pan_gains(self.pan);
            for frame in 0..frames {
                let s = input.sample(frame, 0);
                output.set_sample(frame, 0, s * l);
                output.set_sample(frame, 1, s * r);
            }
        } else if out_ch == 2 && in_ch == 2 {
            // Balance law: unity at center, constant-power toward the edges.
            let (l, r) = pan_gains(self.pan);
            let norm = std::f32::consts::SQRT_2;
            let (lg, rg) = ((l * norm).min(1.0), (r * norm).min(1.0));
            for frame in 0..frames {
                output.set_sample(frame, 0, input.sample(frame, 0) * lg);
                output.set_sample(frame, 1, input.sample(frame, 1) * rg);
            }
        } else {
            mix_default(input, output, 1.0);
        }

        // Per-frame gain ramp toward the target.
        let start = self.last_gain;
        let delta = self.target_gain - start;
        if delta == 0.0 {
            if start != 1.0 {
                output.apply_gain(start);
            }
        } else {
            let step = delta / frames.max(1) as f32;
            for frame in 0..frames {
                let g = start + step * (frame + 1) as f32;
                for ch in 0..out_ch {
                    let s = output.sample(frame, ch);
                    output.set_sample(frame, ch, s * g);
                }
            }
        }
        self.last_gain = self.target_gain;
    }
}

impl Default for FaderState {
    fn default() -> Self {
        Self::new()
    }
}

/// What a unit does when evaluated.
pub enum UnitKind {
    /// Channel source tap; the mixer fills its output directly.
    Source { channel_slot: u32 },
    /// Sums its inputs (the collection point of a group).
    Bus,
    /// Gain/pan head of a channel or group.
    Fader(FaderState),
    /// A processing unit: built-in effect or user DSP.
    Effect(Box<dyn BlockProcessor>),
}

/// A unit instance living in the render graph.
pub struct RenderUnit {
    pub name: String,
    pub kind: UnitKind,
    pub bypass: bool,
    pub active: bool,
    pub faulted: bool,
    /// Set while the owning channel is virtualized: the unit outputs
    /// silence and its processor is skipped, preserving internal state.
    pub frozen: bool,
    /// Some(n) pins the output channel count; None negotiates from inputs.
    pub fixed_output_channels: Option<u16>,
    /// Connection slots feeding this unit.
    inputs: Vec<u32>,
    output: SignalBuffer,
    out_channels: u16,
}

impl RenderUnit {
    pub fn new(name: String, kind: UnitKind, fixed_output_channels: Option<u16>) -> Self {
        Self {
            name,
            kind,
            bypass: false,
            active: true,
            faulted: false,
            frozen: false,
            fixed_output_channels,
            inputs: Vec::new(),
            output: SignalBuffer::zeroed(0, 1),
            out_channels: 1,
        }
    }

    /// The unit's most recent output block.
    pub fn output(&self) -> &SignalBuffer {
        &self.output
    }
}

/// The render-context graph: slot-indexed units and connections plus a
/// cached evaluation order.
pub struct RenderGraph {
    units: Vec<Option<RenderUnit>>,
    connections: Vec<Option<RenderConnection>>,
    order: Vec<u32>,
    dirty: bool,
    scratch: SignalBuffer,
    faulted_this_tick: Vec<u32>,
}

impl RenderGraph {
    pub fn new(block_frames: usize, output_channels: u16) -> Self {
        Self {
            units: Vec::new(),
            connections: Vec::new(),
            order: Vec::new(),
            dirty: true,
            scratch: SignalBuffer::zeroed(block_frames, output_channels),
            faulted_this_tick: Vec::new(),
        }
    }

    fn slot_mut<T>(vec: &mut Vec<Option<T>>, slot: u32) -> &mut Option<T> {
        let index = slot as usize;
        if index >= vec.len() {
            vec.resize_with(index + 1, || None);
        }
        &mut vec[index]
    }

    pub fn add_unit(&mut self, slot: u32, unit: RenderUnit) {
        *Self::slot_mut(&mut self.units, slot) = Some(unit);
        self.dirty = true;
    }

    /// Removes a unit and every connection touching it.
    pub fn remove_unit(&mut self, slot: u32) {
        let stale: Vec<u32> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.as_ref()
                    .filter(|c| c.src == slot || c.dst == slot)
                    .map(|_| i as u32)
            })
            .collect();
        for conn in stale {
            self.disconnect(conn);
        }
        if let Some(entry) = self.units.get_mut(slot as usize) {
            *entry = None;
        }
        self.dirty = true;
    }

    pub fn unit(&self, slot: u32) -> Option<&RenderUnit> {
        self.units.get(slot as usize).and_then(|u| u.as_ref())
    }

    pub fn unit_mut(&mut self, slot: u32) -> Option<&mut RenderUnit> {
        self.units.get_mut(slot as usize).and_then(|u| u.as_mut())
    }

    pub fn connect(&mut self, conn_slot: u32, src: u32, dst: u32, explicit: bool) {
        *Self::slot_mut(&mut self.connections, conn_slot) =
            Some(RenderConnection::new(src, dst, explicit));
        if let Some(unit) = self.unit_mut(dst) {
            unit.inputs.push(conn_slot);
        } else {
            error!(dst, "Connect to nonexistent unit");
        }
        self.dirty = true;
    }

    /// Removes engine-owned (non-explicit) edges running between units of
    /// the given set. Used when reclaiming a channel: its chain edges go,
    /// application-made connections between the same units stay.
    pub fn remove_edges_within(&mut self, units: &[u32]) {
        let stale: Vec<u32> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.as_ref()
                    .filter(|c| !c.explicit && units.contains(&c.src) && units.contains(&c.dst))
                    .map(|_| i as u32)
            })
            .collect();
        for conn in stale {
            self.disconnect(conn);
        }
    }

    pub fn disconnect(&mut self, conn_slot: u32) {
        let Some(conn) = self
            .connections
            .get_mut(conn_slot as usize)
            .and_then(|c| c.take())
        else {
            return;
        };
        if let Some(unit) = self.unit_mut(conn.dst) {
            unit.inputs.retain(|c| *c != conn_slot);
        }
        self.dirty = true;
    }

    pub fn set_mix_matrix(&mut self, conn_slot: u32, matrix: Option<MixMatrix>) {
        if let Some(conn) = self
            .connections
            .get_mut(conn_slot as usize)
            .and_then(|c| c.as_mut())
        {
            conn.matrix = matrix;
        }
    }

    pub fn set_connection_gain(&mut self, conn_slot: u32, gain: f32) {
        if let Some(conn) = self
            .connections
            .get_mut(conn_slot as usize)
            .and_then(|c| c.as_mut())
        {
            conn.gain = gain;
        }
    }

    pub fn set_param(&mut self, slot: u32, index: usize, value: &ParamValue) {
        if let Some(unit) = self.unit_mut(slot) {
            if let UnitKind::Effect(processor) = &mut unit.kind {
                processor.set_param(index, value);
            }
        }
    }

    pub fn set_bypass(&mut self, slot: u32, bypass: bool) {
        if let Some(unit) = self.unit_mut(slot) {
            unit.bypass = bypass;
        }
    }

    pub fn set_active(&mut self, slot: u32, active: bool) {
        if let Some(unit) = self.unit_mut(slot) {
            unit.active = active;
        }
    }

    /// Updates the fader target of a channel/group head.
    pub fn set_fader(&mut self, slot: u32, gain: f32, pan: f32) {
        if let Some(unit) = self.unit_mut(slot) {
            if let UnitKind::Fader(fader) = &mut unit.kind {
                fader.set_target(gain, pan);
            }
        }
    }

    /// Clears processor history on a unit (used on virtual->real transitions
    /// when the caller opts for a cold start; the default freeze path never
    /// calls this).
    pub fn reset_unit(&mut self, slot: u32) {
        if let Some(unit) = self.unit_mut(slot) {
            if let UnitKind::Effect(processor) = &mut unit.kind {
                processor.reset();
            }
        }
    }

    /// Units that faulted during the most recent evaluation.
    pub fn take_faulted(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.faulted_this_tick)
    }

    /// Recomputes the evaluation order: post-order DFS from the master head
    /// along connection inputs, so every unit is evaluated after all of its
    /// sources. The control side rejects cycles at connect time; a back edge
    /// found here is a bug and is skipped to keep the tick alive.
    fn rebuild_order(&mut self, root: u32) {
        self.order.clear();
        let mut state = vec![0u8; self.units.len()];
        let mut stack: Vec<(u32, usize)> = Vec::new();

        if self.units.get(root as usize).map_or(true, |u| u.is_none()) {
            return;
        }
        state[root as usize] = 1;
        stack.push((root, 0));

        while let Some((slot, child)) = stack.pop() {
            let inputs_len = self.units[slot as usize]
                .as_ref()
                .map_or(0, |u| u.inputs.len());
            if child < inputs_len {
                stack.push((slot, child + 1));
                let conn_slot = self.units[slot as usize].as_ref().unwrap().inputs[child];
                let Some(conn) = self.connections.get(conn_slot as usize).and_then(|c| c.as_ref())
                else {
                    continue;
                };
                let src = conn.src;
                if self.units.get(src as usize).map_or(true, |u| u.is_none()) {
                    continue;
                }
                match state[src as usize] {
                    0 => {
                        state[src as usize] = 1;
                        stack.push((src, 0));
                    }
                    1 => {
                        error!(src, dst = slot, "Cycle found in render graph, skipping edge");
                    }
                    _ => {}
                }
            } else {
                state[slot as usize] = 2;
                self.order.push(slot);
            }
        }
    }

    /// Evaluates the graph for one block. `fill_source` renders a channel's
    /// source tap into the provided buffer (shape included); it is invoked
    /// exactly once per reachable source unit.
    pub fn evaluate<F>(
        &mut self,
        root: u32,
        ctx: &ProcessContext,
        frames: usize,
        mut fill_source: F,
    ) where
        F: FnMut(u32, &mut SignalBuffer),
    {
        if self.dirty {
            self.rebuild_order(root);
            self.dirty = false;
        }

        for i in 0..self.order.len() {
            let slot = self.order[i];
            self.evaluate_unit(slot, ctx, frames, &mut fill_source);
        }
    }

    fn evaluate_unit<F>(&mut self, slot: u32, ctx: &ProcessContext, frames: usize, fill_source: &mut F)
    where
        F: FnMut(u32, &mut SignalBuffer),
    {
        // Source units are filled directly by the mixer.
        let is_source = match self.units.get(slot as usize).and_then(|u| u.as_ref()) {
            Some(unit) => matches!(unit.kind, UnitKind::Source { .. }),
            None => return,
        };
        if is_source {
            let unit = self.units[slot as usize].as_mut().unwrap();
            let channel_slot = match unit.kind {
                UnitKind::Source { channel_slot } => channel_slot,
                _ => unreachable!(),
            };
            let mut out = std::mem::take(&mut unit.output);
            fill_source(channel_slot, &mut out);
            let unit = self.units[slot as usize].as_mut().unwrap();
            unit.out_channels = out.channels();
            unit.output = out;
            return;
        }

        // Negotiate the input channel count from the already-evaluated
        // sources feeding this unit.
        let mut in_ch: u16 = 0;
        for idx in 0..self.units[slot as usize].as_ref().unwrap().inputs.len() {
            let conn_slot = self.units[slot as usize].as_ref().unwrap().inputs[idx];
            let Some(conn) = self.connections.get(conn_slot as usize).and_then(|c| c.as_ref())
            else {
                continue;
            };
            if let Some(src) = self.units.get(conn.src as usize).and_then(|u| u.as_ref()) {
                in_ch = in_ch.max(src.out_channels);
            }
        }
        let in_ch = in_ch.max(1);
        let out_ch = self.units[slot as usize]
            .as_ref()
            .unwrap()
            .fixed_output_channels
            .unwrap_or(in_ch);

        // Reconcile explicit matrices against current shapes; an upstream
        // shape change zeroes the matrix (silence over garbage).
        for idx in 0..self.units[slot as usize].as_ref().unwrap().inputs.len() {
            let conn_slot = self.units[slot as usize].as_ref().unwrap().inputs[idx];
            let src_ch = self
                .connections
                .get(conn_slot as usize)
                .and_then(|c| c.as_ref())
                .and_then(|c| self.units.get(c.src as usize).and_then(|u| u.as_ref()))
                .map(|u| u.out_channels);
            if let (Some(src_ch), Some(conn)) = (
                src_ch,
                self.connections
                    .get_mut(conn_slot as usize)
                    .and_then(|c| c.as_mut()),
            ) {
                conn.reconcile(in_ch, src_ch);
            }
        }

        // Sum all inputs into the scratch buffer through their matrices.
        self.scratch.reset(frames, in_ch);
        for idx in 0..self.units[slot as usize].as_ref().unwrap().inputs.len() {
            let conn_slot = self.units[slot as usize].as_ref().unwrap().inputs[idx];
            let Some(conn) = self.connections.get(conn_slot as usize).and_then(|c| c.as_ref())
            else {
                continue;
            };
            let Some(src) = self.units.get(conn.src as usize).and_then(|u| u.as_ref()) else {
                continue;
            };
            match &conn.matrix {
                Some(matrix) => matrix.apply(&src.output, &mut self.scratch, conn.gain),
                None => mix_default(&src.output, &mut self.scratch, conn.gain),
            }
        }

        // Produce the unit's output.
        let mut out = {
            let unit = self.units[slot as usize].as_mut().unwrap();
            std::mem::take(&mut unit.output)
        };
        out.reset(frames, out_ch);

        let scratch = &self.scratch;
        let unit = self.units[slot as usize].as_mut().unwrap();
        if !unit.active || unit.frozen {
            // Inactive and frozen units contribute silence; frozen
            // processors are not run, so their history is preserved.
        } else if unit.bypass || unit.faulted {
            mix_default(scratch, &mut out, 1.0);
        } else {
            match &mut unit.kind {
                UnitKind::Bus => mix_default(scratch, &mut out, 1.0),
                UnitKind::Fader(fader) => fader.process(scratch, &mut out),
                UnitKind::Effect(processor) => {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        processor.process(ctx, scratch, &mut out)
                    }));
                    let failed = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(fault)) => Some(fault.to_string()),
                        Err(_) => Some("processor panicked".to_string()),
                    };
                    if let Some(reason) = failed {
                        warn!(unit = %unit.name, reason = %reason, "DSP unit faulted, bypassing");
                        unit.faulted = true;
                        out.fill_silence();
                        mix_default(scratch, &mut out, 1.0);
                        self.faulted_this_tick.push(slot);
                    }
                }
                UnitKind::Source { .. } => unreachable!(),
            }
        }

        let unit = self.units[slot as usize].as_mut().unwrap();
        unit.out_channels = out_ch;
        unit.output = out;
    }
}
