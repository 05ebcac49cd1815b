//! # Framevault
//!
//! Framevault is a rollback state engine for deterministic simulations,
//! written in 100% safe Rust. It keeps a bounded ring of recent frame
//! snapshots (stored as XOR deltas against their neighbour and compressed
//! with LZ4), predicts missing remote inputs, detects mispredictions, and
//! drives a rollback-and-replay to reconcile them. A separate circular
//! byte arena ([`RewindBuffer`]) provides a single-player "rewind" feature
//! built on the same store-frames-as-differences idea.
//!
//! The simulation itself is opaque to the engine: it is reached through
//! the [`SimulationHandler`] trait, whose implementor serializes its whole
//! observable state into a byte buffer on demand and restores it from one.
//!
//! ## Per-tick control flow
//!
//! ```text
//! synchronize_inputs()  -> inputs for the current frame (confirmed or predicted)
//! <simulation advances one tick>
//! increment_frame()     -> saves a snapshot of the new frame
//! check_simulation()    -> on misprediction: load the oldest wrong frame,
//!                          replay forward with corrected inputs
//! ```
//!
//! Snapshot compression can optionally run on a background worker thread
//! (`SyncConfig::async_compress`); results are merged back lazily on the
//! simulation thread. With the worker on or off, the bytes the engine
//! reproduces for any frame are identical.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub use config::SyncConfig;
pub use error::{LoadRejectReason, ReconstructFailure, VaultError};
pub use frame_info::{ConnectStatus, GameInput, MAX_INPUT_BYTES};
pub use rewind::RewindBuffer;
pub use sync::{
    SaveOutput, SavedFrameInfo, SimulationHandler, SimulationRejected, SnapshotEncoding,
    StateStats, SyncEngine,
};

/// A specialized `Result` type for framevault operations.
///
/// The second type parameter may override the error type:
///
/// ```
/// use framevault::VaultResult;
///
/// fn tick() -> VaultResult<()> {
///     Ok(())
/// }
/// ```
pub type VaultResult<T, E = VaultError> = std::result::Result<T, E>;

pub mod checksum;
#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
#[doc(hidden)]
pub mod rewind;
pub mod rng;
#[doc(hidden)]
pub mod sync;

pub(crate) mod codec;
pub(crate) mod simd;

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The deepest rollback the engine supports. `SyncConfig::num_prediction_frames`
/// may be configured lower, never higher.
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// Number of snapshot slots in the saved-frame ring. Two more than the
/// prediction depth so the frame being replaced and the frame being written
/// never collide with a frame a rollback may still need.
pub const SAVED_FRAME_SLOTS: usize = MAX_PREDICTION_FRAMES + 2;

/// Snapshots at `frame % KEYFRAME_INTERVAL == 0` are always stored in
/// non-delta form, bounding every delta reconstruction chain to fewer than
/// `KEYFRAME_INTERVAL` links.
pub const KEYFRAME_INTERVAL: i32 = 4;

/// A frame is a single step of deterministic simulation execution.
///
/// Frame numbers start at 0 and increase monotonically. The sentinel
/// [`Frame::NULL`] (-1) represents "no frame".
///
/// # Examples
///
/// ```
/// use framevault::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame".
    pub const NULL: Self = Self(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value. No validation is
    /// performed; use [`Frame::is_valid`] to check.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the frame as a `usize`, or `None` if the frame is negative.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// Adds a value to this frame, saturating at the numeric bounds.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: i32) -> Self {
        Self(self.0.saturating_add(rhs))
    }

    /// Subtracts a value from this frame, saturating at the numeric bounds.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: i32) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl std::ops::Rem<i32> for Frame {
    type Output = i32;

    #[inline]
    fn rem(self, rhs: i32) -> Self::Output {
        self.0 % rhs
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

// #########
// # TESTS #
// #########
