//! Crate-wide error types.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::Frame;

// =============================================================================
// Structured reason types
// =============================================================================
// These store debugging data as plain fields (no allocation on the hot path)
// and format lazily in their Display impls.

/// Why a snapshot chain could not be rebuilt from the ring.
///
/// A requested frame that is absent from the ring altogether is reported
/// as [`VaultError::FrameNotFound`], not as a reconstruction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ReconstructFailure {
    /// Walking backwards from the requested frame ran out of retained
    /// frames before a non-delta base was found.
    NoBaseFrame {
        /// The oldest frame the backward scan reached.
        searched_back_to: Frame,
    },
    /// A frame inside the delta chain has been evicted.
    BrokenChain {
        /// The missing link.
        missing: Frame,
    },
    /// A link in the chain failed to decode.
    LinkDecodeFailed {
        /// The frame whose payload failed to decode.
        frame: Frame,
    },
}

impl Display for ReconstructFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBaseFrame { searched_back_to } => {
                write!(
                    f,
                    "no non-delta base frame retained (searched back to {})",
                    searched_back_to
                )
            },
            Self::BrokenChain { missing } => {
                write!(f, "delta chain is missing frame {}", missing)
            },
            Self::LinkDecodeFailed { frame } => {
                write!(f, "failed to decode chain link at frame {}", frame)
            },
        }
    }
}

/// Why a `load_frame` request was rejected before touching the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LoadRejectReason {
    /// The slot found for the frame holds no payload.
    EmptySlot,
    /// The slot reports a non-positive decoded size.
    InvalidSize,
    /// The destination buffer is smaller than the decoded snapshot.
    OutputTooSmall {
        /// Bytes the snapshot decodes to.
        required: usize,
        /// Bytes the caller provided.
        available: usize,
    },
}

impl Display for LoadRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySlot => write!(f, "slot has no state buffer"),
            Self::InvalidSize => write!(f, "slot has an invalid decoded size"),
            Self::OutputTooSmall {
                required,
                available,
            } => {
                write!(
                    f,
                    "output buffer too small ({} bytes needed, {} available)",
                    required, available
                )
            },
        }
    }
}

// =============================================================================
// Main error enum
// =============================================================================

/// All error conditions this library can surface. Most public functions
/// return a [`VaultResult`](crate::VaultResult).
///
/// # Forward Compatibility
///
/// This enum is `#[non_exhaustive]`; always include a wildcard arm when
/// matching.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum VaultError {
    /// The simulation is already a full prediction window ahead of the last
    /// confirmed remote frame; local input is refused until the window
    /// drains. Retry after remote inputs are confirmed.
    PredictionBarrier,
    /// A frame lookup in the saved-frame ring missed.
    FrameNotFound {
        /// The frame that was requested.
        frame: Frame,
    },
    /// A `load_frame` request was rejected without touching the simulation.
    LoadRejected {
        /// The frame that was requested.
        frame: Frame,
        /// Why the request was rejected.
        reason: LoadRejectReason,
    },
    /// A delta chain could not be rebuilt into a raw snapshot.
    ReconstructionFailed {
        /// The frame being rebuilt.
        frame: Frame,
        /// Why the rebuild failed.
        reason: ReconstructFailure,
    },
    /// An LZ4 payload did not decode to exactly its recorded size. Fatal
    /// for the affected load; the caller must abort the tick.
    DecompressionFailed {
        /// The frame whose payload failed to decode.
        frame: Frame,
        /// The size the payload should have decoded to.
        expected: usize,
    },
    /// The simulation's save callback refused to serialize, or produced an
    /// empty snapshot.
    SaveFailed {
        /// The frame being saved.
        frame: Frame,
    },
    /// The simulation's load callback refused the snapshot bytes.
    LoadFailed {
        /// The frame being restored.
        frame: Frame,
    },
    /// The simulation's advance callback refused to step during replay.
    AdvanceFailed {
        /// The frame at which the step was refused.
        frame: Frame,
    },
    /// A rewind arena patch record failed to decode.
    RewindPatchCorrupt {
        /// Bytes the patch should have decoded to.
        expected: usize,
    },
    /// The rewind arena is too small to hold even one patch record.
    RewindCapacityInsufficient {
        /// Bytes one maximum-size record needs.
        required: usize,
        /// Bytes the arena holds.
        capacity: usize,
    },
    /// An invalid request, usually wrong parameters for a function call.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
}

impl Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PredictionBarrier => {
                write!(
                    f,
                    "Prediction barrier reached, cannot accept local input without catching up."
                )
            },
            Self::FrameNotFound { frame } => {
                write!(f, "Frame {} not found in the saved-frame ring.", frame)
            },
            Self::LoadRejected { frame, reason } => {
                write!(f, "Load of frame {} rejected: {}", frame, reason)
            },
            Self::ReconstructionFailed { frame, reason } => {
                write!(f, "Failed to reconstruct frame {}: {}", frame, reason)
            },
            Self::DecompressionFailed { frame, expected } => {
                write!(
                    f,
                    "Failed to decompress frame {} (expected {} bytes).",
                    frame, expected
                )
            },
            Self::SaveFailed { frame } => {
                write!(f, "Simulation refused to save state for frame {}.", frame)
            },
            Self::LoadFailed { frame } => {
                write!(f, "Simulation refused to load state for frame {}.", frame)
            },
            Self::AdvanceFailed { frame } => {
                write!(f, "Simulation refused to advance at frame {}.", frame)
            },
            Self::RewindPatchCorrupt { expected } => {
                write!(
                    f,
                    "Failed to decode rewind patch (expected {} bytes).",
                    expected
                )
            },
            Self::RewindCapacityInsufficient { required, capacity } => {
                write!(
                    f,
                    "Rewind arena capacity insufficient ({} bytes needed per record, {} total).",
                    required, capacity
                )
            },
            Self::InvalidRequest { info } => {
                write!(f, "Invalid request: {}", info)
            },
        }
    }
}

impl Error for VaultError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        // Error context is stored as structured fields, not wrapped errors.
        None
    }
}
