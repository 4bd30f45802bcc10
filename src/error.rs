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

/// Errors returned by control-context operations.
///
/// Render-context faults are never surfaced as errors across the render
/// boundary; they are contained per DSP unit (bypass-and-continue) and
/// reported through the metrics snapshot and `Dsp::is_faulted`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The handle refers to an object that has been stopped, released, or
    /// reclaimed. Handles are generation-counted; a stale generation is
    /// detected on every access.
    #[error("invalid handle: object no longer exists")]
    InvalidHandle,

    /// A parameter index or value was out of range.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Channel counts or sample formats were incompatible at a connection.
    #[error("format mismatch: expected {expected} channels, got {actual}")]
    FormatMismatch { expected: u16, actual: u16 },

    /// The requested connection would create a cycle in the DSP graph.
    #[error("connection rejected: would create a cycle in the DSP graph")]
    CycleDetected,

    /// The sound is still loading (or failed to load) and cannot be played.
    #[error("sound is not ready: {0}")]
    NotReady(String),

    /// A DSP callback failed during render. The unit has been bypassed.
    #[error("DSP unit faulted during render")]
    Fault,

    /// A fixed-capacity arena (e.g. the channel table sized at init) is full.
    #[error("capacity exceeded: no free {kind} slots (limit {limit})")]
    CapacityExceeded { kind: &'static str, limit: usize },

    /// The output backend failed.
    #[error("output backend error: {0}")]
    Backend(String),
}

impl EngineError {
    /// Shorthand for an out-of-range parameter value.
    pub(crate) fn param(msg: impl Into<String>) -> Self {
        EngineError::InvalidParam(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
