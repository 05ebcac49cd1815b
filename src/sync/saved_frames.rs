//! The saved-frame ring: a fixed ring of recent snapshots, each stored
//! raw, LZ4-compressed, as an XOR delta against the previous frame, or as
//! a compressed delta.

use std::sync::Arc;

use tracing::trace;

use crate::error::{LoadRejectReason, ReconstructFailure};
use crate::sync::scratch::ScratchBuffer;
use crate::{codec, simd, Frame, VaultError, VaultResult, SAVED_FRAME_SLOTS};

/// How a snapshot is encoded in its ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotEncoding {
    /// The raw serialized simulation state.
    Raw,
    /// LZ4 of the raw state.
    Compressed,
    /// `XOR(raw[F], raw[F-1])`, uncompressed.
    Delta,
    /// LZ4 of the XOR delta.
    DeltaCompressed,
}

/// A snapshot payload, tagged with its encoding.
///
/// `Raw` and `Delta` payloads are shared (`Arc`) with any in-flight
/// background compression job; `Arc::ptr_eq` plus the frame number is how
/// a finished job proves it still belongs to the slot it was queued for.
/// Compressed payloads are never inputs to further compression and stay
/// uniquely owned.
#[derive(Debug, Clone)]
pub(crate) enum SnapshotPayload {
    Raw(Arc<Vec<u8>>),
    Compressed(Vec<u8>),
    Delta(Arc<Vec<u8>>),
    DeltaCompressed(Vec<u8>),
}

impl SnapshotPayload {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Self::Raw(bytes) | Self::Delta(bytes) => bytes,
            Self::Compressed(bytes) | Self::DeltaCompressed(bytes) => bytes,
        }
    }

    /// Stored length in bytes (compressed length for LZ4 payloads).
    pub(crate) fn stored_len(&self) -> usize {
        self.bytes().len()
    }

    pub(crate) fn encoding(&self) -> SnapshotEncoding {
        match self {
            Self::Raw(_) => SnapshotEncoding::Raw,
            Self::Compressed(_) => SnapshotEncoding::Compressed,
            Self::Delta(_) => SnapshotEncoding::Delta,
            Self::DeltaCompressed(_) => SnapshotEncoding::DeltaCompressed,
        }
    }

    /// Whether the payload decodes to a delta rather than a raw snapshot.
    pub(crate) fn is_delta(&self) -> bool {
        matches!(self, Self::Delta(_) | Self::DeltaCompressed(_))
    }

    /// Whether the payload is LZ4-encoded.
    pub(crate) fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_) | Self::DeltaCompressed(_))
    }
}

/// One slot of the saved-frame ring.
#[derive(Debug, Clone)]
pub(crate) struct SavedFrame {
    /// Which frame this snapshot represents; `Frame::NULL` if empty.
    pub(crate) frame: Frame,
    /// The encoded payload, `None` if the slot is empty.
    pub(crate) payload: Option<SnapshotPayload>,
    /// Length after fully decoding into raw snapshot bytes.
    pub(crate) uncompressed_size: usize,
    /// Opaque checksum supplied by the save callback; carried verbatim.
    pub(crate) checksum: u32,
    /// A background compression job for this slot is in flight.
    pub(crate) compress_pending: bool,
}

impl Default for SavedFrame {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            payload: None,
            uncompressed_size: 0,
            checksum: 0,
            compress_pending: false,
        }
    }
}

impl SavedFrame {
    /// Decodes the payload into `out` as raw-or-delta bytes (one LZ4 pass,
    /// no chain walking). Requires `out` to hold `uncompressed_size` bytes.
    pub(crate) fn decode_raw(&self, out: &mut [u8]) -> VaultResult<()> {
        let payload = self.payload.as_ref().ok_or(VaultError::LoadRejected {
            frame: self.frame,
            reason: LoadRejectReason::EmptySlot,
        })?;
        if self.uncompressed_size == 0 {
            return Err(VaultError::LoadRejected {
                frame: self.frame,
                reason: LoadRejectReason::InvalidSize,
            });
        }
        if out.len() < self.uncompressed_size {
            return Err(VaultError::LoadRejected {
                frame: self.frame,
                reason: LoadRejectReason::OutputTooSmall {
                    required: self.uncompressed_size,
                    available: out.len(),
                },
            });
        }

        if payload.is_compressed() {
            if !codec::decompress_exact(payload.bytes(), out, self.uncompressed_size) {
                return Err(VaultError::DecompressionFailed {
                    frame: self.frame,
                    expected: self.uncompressed_size,
                });
            }
        } else {
            simd::copy_bytes(
                &mut out[..self.uncompressed_size],
                &payload.bytes()[..self.uncompressed_size],
            );
        }
        Ok(())
    }
}

/// Fixed-capacity ring of saved frames. New saves land at `head`, which
/// then advances; lookups are linear scans keyed on the frame number.
#[derive(Debug)]
pub(crate) struct SavedFrames {
    pub(crate) frames: Vec<SavedFrame>,
    pub(crate) head: usize,
}

impl SavedFrames {
    pub(crate) fn new() -> Self {
        Self {
            frames: vec![SavedFrame::default(); SAVED_FRAME_SLOTS],
            head: 0,
        }
    }

    /// Finds the slot holding `frame`, if any.
    pub(crate) fn find(&self, frame: Frame) -> Option<usize> {
        let found = self.frames.iter().position(|slot| slot.frame == frame);
        if found.is_none() {
            trace!(%frame, "saved frame not found in ring");
        }
        found
    }

    pub(crate) fn advance_head(&mut self) {
        self.head = (self.head + 1) % SAVED_FRAME_SLOTS;
    }

    /// The slot written by the most recent save.
    pub(crate) fn last_saved_index(&self) -> usize {
        (self.head + SAVED_FRAME_SLOTS - 1) % SAVED_FRAME_SLOTS
    }

    /// Rebuilds the raw snapshot of `frame` into `out`.
    ///
    /// Non-delta entries decode directly. Delta entries scan backwards for
    /// the nearest non-delta base, then replay the chain forward, XOR-ing
    /// each delta on top; a non-delta entry inside the chain simply
    /// resynchronizes the buffer. Chain failures are surfaced distinctly
    /// from a plain ring miss.
    pub(crate) fn reconstruct(
        &self,
        frame: Frame,
        out: &mut ScratchBuffer,
        delta_scratch: &mut ScratchBuffer,
    ) -> VaultResult<()> {
        let index = self
            .find(frame)
            .ok_or(VaultError::FrameNotFound { frame })?;
        let target = &self.frames[index];

        if !target
            .payload
            .as_ref()
            .is_some_and(SnapshotPayload::is_delta)
        {
            out.ensure(target.uncompressed_size);
            return target.decode_raw(out.as_mut_slice());
        }

        // Scan backwards for a frame that can stand alone.
        let mut base_frame = frame;
        loop {
            if !base_frame.is_valid() {
                return Err(VaultError::ReconstructionFailed {
                    frame,
                    reason: ReconstructFailure::NoBaseFrame {
                        searched_back_to: base_frame + 1,
                    },
                });
            }
            let base_index =
                self.find(base_frame)
                    .ok_or(VaultError::ReconstructionFailed {
                        frame,
                        reason: ReconstructFailure::BrokenChain {
                            missing: base_frame,
                        },
                    })?;
            let base = &self.frames[base_index];
            if !base.payload.as_ref().is_some_and(SnapshotPayload::is_delta) {
                out.ensure(base.uncompressed_size);
                base.decode_raw(out.as_mut_slice())?;
                break;
            }
            base_frame = base_frame - 1;
        }

        // Replay the chain forward on top of the base.
        let mut f = base_frame + 1;
        while f <= frame {
            let link_index = self.find(f).ok_or(VaultError::ReconstructionFailed {
                frame,
                reason: ReconstructFailure::BrokenChain { missing: f },
            })?;
            let link = &self.frames[link_index];

            if !link.payload.as_ref().is_some_and(SnapshotPayload::is_delta) {
                // a keyframe mid-chain resynchronizes the buffer
                out.ensure(link.uncompressed_size);
                link.decode_raw(out.as_mut_slice())?;
            } else {
                delta_scratch.ensure(link.uncompressed_size);
                link.decode_raw(delta_scratch.as_mut_slice())?;
                if out.len() < link.uncompressed_size {
                    return Err(VaultError::ReconstructionFailed {
                        frame,
                        reason: ReconstructFailure::LinkDecodeFailed { frame: f },
                    });
                }
                simd::xor_in_place(
                    &mut out.as_mut_slice()[..link.uncompressed_size],
                    &delta_scratch.as_slice()[..link.uncompressed_size],
                );
            }
            f += 1;
        }

        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_slot(frame: i32, bytes: &[u8]) -> SavedFrame {
        SavedFrame {
            frame: Frame::new(frame),
            payload: Some(SnapshotPayload::Raw(Arc::new(bytes.to_vec()))),
            uncompressed_size: bytes.len(),
            checksum: 0,
            compress_pending: false,
        }
    }

    fn delta_slot(frame: i32, current: &[u8], previous: &[u8]) -> SavedFrame {
        let delta: Vec<u8> = current
            .iter()
            .zip(previous.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        SavedFrame {
            frame: Frame::new(frame),
            payload: Some(SnapshotPayload::Delta(Arc::new(delta))),
            uncompressed_size: current.len(),
            checksum: 0,
            compress_pending: false,
        }
    }

    fn state(frame: i32) -> Vec<u8> {
        (0..32).map(|i| (i as u8).wrapping_add(frame as u8 * 13)).collect()
    }

    #[test]
    fn test_find_hits_and_misses() {
        let mut ring = SavedFrames::new();
        ring.frames[3] = raw_slot(7, &state(7));
        assert_eq!(ring.find(Frame::new(7)), Some(3));
        assert_eq!(ring.find(Frame::new(8)), None);
    }

    #[test]
    fn test_decode_raw_copies_raw_payload() {
        let bytes = state(0);
        let slot = raw_slot(0, &bytes);
        let mut out = vec![0u8; bytes.len()];
        slot.decode_raw(&mut out).expect("decode raw");
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_decode_raw_rejects_small_output() {
        let bytes = state(0);
        let slot = raw_slot(0, &bytes);
        let mut out = vec![0u8; bytes.len() - 1];
        let err = slot.decode_raw(&mut out).unwrap_err();
        assert!(matches!(
            err,
            VaultError::LoadRejected {
                reason: LoadRejectReason::OutputTooSmall { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_decode_raw_rejects_empty_slot() {
        let slot = SavedFrame::default();
        let mut out = vec![0u8; 8];
        let err = slot.decode_raw(&mut out).unwrap_err();
        assert!(matches!(
            err,
            VaultError::LoadRejected {
                reason: LoadRejectReason::EmptySlot,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_compressed_roundtrip() {
        let bytes = vec![42u8; 256];
        let compressed = crate::codec::compress(&bytes, 1).expect("compressible");
        let slot = SavedFrame {
            frame: Frame::new(1),
            payload: Some(SnapshotPayload::Compressed(compressed)),
            uncompressed_size: bytes.len(),
            checksum: 0,
            compress_pending: false,
        };
        let mut out = vec![0u8; bytes.len()];
        slot.decode_raw(&mut out).expect("decode compressed");
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_reconstruct_delta_chain() {
        let mut ring = SavedFrames::new();
        let s0 = state(0);
        let s1 = state(1);
        let s2 = state(2);
        ring.frames[0] = raw_slot(0, &s0);
        ring.frames[1] = delta_slot(1, &s1, &s0);
        ring.frames[2] = delta_slot(2, &s2, &s1);

        let mut out = ScratchBuffer::new();
        let mut scratch = ScratchBuffer::new();
        ring.reconstruct(Frame::new(2), &mut out, &mut scratch)
            .expect("chain intact");
        assert_eq!(out.as_slice(), s2.as_slice());
    }

    #[test]
    fn test_reconstruct_resyncs_on_mid_chain_keyframe() {
        let mut ring = SavedFrames::new();
        let s0 = state(0);
        let s1 = state(1);
        let s2 = state(2);
        ring.frames[0] = raw_slot(0, &s0);
        ring.frames[1] = raw_slot(1, &s1);
        ring.frames[2] = delta_slot(2, &s2, &s1);

        let mut out = ScratchBuffer::new();
        let mut scratch = ScratchBuffer::new();
        ring.reconstruct(Frame::new(2), &mut out, &mut scratch)
            .expect("chain intact");
        assert_eq!(out.as_slice(), s2.as_slice());
    }

    #[test]
    fn test_reconstruct_broken_chain_is_distinct_from_miss() {
        let mut ring = SavedFrames::new();
        let s0 = state(0);
        let s1 = state(1);
        let s2 = state(2);
        ring.frames[0] = raw_slot(0, &s0);
        // frame 1 evicted
        ring.frames[2] = delta_slot(2, &s2, &s1);

        let mut out = ScratchBuffer::new();
        let mut scratch = ScratchBuffer::new();

        let err = ring
            .reconstruct(Frame::new(2), &mut out, &mut scratch)
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::ReconstructionFailed {
                reason: ReconstructFailure::BrokenChain { .. },
                ..
            }
        ));

        let miss = ring
            .reconstruct(Frame::new(9), &mut out, &mut scratch)
            .unwrap_err();
        assert!(matches!(miss, VaultError::FrameNotFound { .. }));
    }

    #[test]
    fn test_reconstruct_without_base_fails() {
        let mut ring = SavedFrames::new();
        let s0 = state(0);
        let s1 = state(1);
        // only a delta at frame 1; frame 0 was never retained... but a
        // missing frame 0 reads as a broken chain. An all-delta ring down
        // to frame 0 exercises the no-base path instead.
        ring.frames[0] = delta_slot(0, &s0, &s0);
        ring.frames[1] = delta_slot(1, &s1, &s0);

        let mut out = ScratchBuffer::new();
        let mut scratch = ScratchBuffer::new();
        let err = ring
            .reconstruct(Frame::new(1), &mut out, &mut scratch)
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::ReconstructionFailed {
                reason: ReconstructFailure::NoBaseFrame { .. },
                ..
            }
        ));
    }
}
