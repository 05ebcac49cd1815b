//! Per-frame data: player inputs and peer connection status.

use crate::Frame;

/// Maximum size in bytes of a single player's input for one frame.
///
/// Inputs are stored inline in fixed-size arrays so they stay `Copy` and the
/// per-player queues never allocate per frame.
pub const MAX_INPUT_BYTES: usize = 64;

/// The input of a single player for a single frame, as an opaque byte blob.
///
/// Two inputs are considered equal iff they have the same `size` and their
/// first `size` bytes are identical; the associated frame number does not
/// participate in input comparison.
#[derive(Copy, Clone)]
pub struct GameInput {
    /// The frame this input belongs to. [`Frame::NULL`] marks an empty slot.
    pub frame: Frame,
    size: usize,
    bits: [u8; MAX_INPUT_BYTES],
}

impl GameInput {
    /// Creates an input for `frame` from the given bytes.
    ///
    /// `data` longer than [`MAX_INPUT_BYTES`] is truncated; the engine's
    /// configuration validation keeps real callers well below the cap.
    #[must_use]
    pub fn new(frame: Frame, data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_INPUT_BYTES);
        let size = data.len().min(MAX_INPUT_BYTES);
        let mut bits = [0u8; MAX_INPUT_BYTES];
        bits[..size].copy_from_slice(&data[..size]);
        Self { frame, size, bits }
    }

    /// Creates an all-zero input of `size` bytes for `frame`.
    #[must_use]
    pub fn blank(frame: Frame, size: usize) -> Self {
        debug_assert!(size <= MAX_INPUT_BYTES);
        Self {
            frame,
            size: size.min(MAX_INPUT_BYTES),
            bits: [0u8; MAX_INPUT_BYTES],
        }
    }

    /// The input payload.
    #[inline]
    #[must_use]
    pub fn bits(&self) -> &[u8] {
        &self.bits[..self.size]
    }

    /// The input payload size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Zeroes the input payload, keeping frame and size.
    pub fn erase(&mut self) {
        self.bits = [0u8; MAX_INPUT_BYTES];
    }

    /// Byte-wise equality over the payload. With `bits_only` the frame
    /// numbers are ignored.
    pub(crate) fn equal(&self, other: &Self, bits_only: bool) -> bool {
        (bits_only || self.frame == other.frame)
            && self.size == other.size
            && self.bits[..self.size] == other.bits[..other.size]
    }
}

impl Default for GameInput {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            size: 0,
            bits: [0u8; MAX_INPUT_BYTES],
        }
    }
}

impl std::fmt::Debug for GameInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameInput")
            .field("frame", &self.frame)
            .field("bits", &self.bits())
            .finish()
    }
}

/// Connection state of a single peer, owned by the calling network layer
/// and borrowed by the engine per call.
///
/// A disconnected peer contributes zeroed inputs for every frame past its
/// `last_frame`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ConnectStatus {
    /// Whether the peer is disconnected.
    pub disconnected: bool,
    /// The last frame for which this peer's input is authoritative.
    pub last_frame: Frame,
}

impl Default for ConnectStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod game_input_tests {
    use super::*;

    #[test]
    fn test_input_equality() {
        let a = GameInput::new(Frame::new(0), &[1, 2, 3, 4]);
        let b = GameInput::new(Frame::new(0), &[1, 2, 3, 4]);
        assert!(a.equal(&b, false));
    }

    #[test]
    fn test_input_equality_bits_only() {
        let a = GameInput::new(Frame::new(0), &[1, 2, 3, 4]);
        let b = GameInput::new(Frame::new(9), &[1, 2, 3, 4]);
        assert!(a.equal(&b, true));
        assert!(!a.equal(&b, false));
    }

    #[test]
    fn test_input_inequality_on_size() {
        let a = GameInput::new(Frame::new(0), &[1, 2, 3]);
        let b = GameInput::new(Frame::new(0), &[1, 2, 3, 0]);
        assert!(!a.equal(&b, true));
    }

    #[test]
    fn test_erase_zeroes_bits() {
        let mut a = GameInput::new(Frame::new(4), &[0xFF; 8]);
        a.erase();
        assert_eq!(a.bits(), &[0u8; 8]);
        assert_eq!(a.frame, Frame::new(4));
        assert_eq!(a.size(), 8);
    }

    #[test]
    fn test_blank_matches_erased() {
        let blank = GameInput::blank(Frame::new(2), 4);
        let mut erased = GameInput::new(Frame::new(2), &[9, 9, 9, 9]);
        erased.erase();
        assert!(blank.equal(&erased, false));
    }
}
