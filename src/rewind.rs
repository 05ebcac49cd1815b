//! Rewind ring buffer: a circular byte arena of XOR patch records.
//!
//! Snapshots are stored as the XOR difference against the previously
//! pushed snapshot, LZ4-compressed when that is a win. Records link to
//! their neighbours with absolute-offset words embedded in the arena, so
//! newer snapshots evict older ones from the tail without fragmentation:
//!
//! ```text
//! [.. payload ..][back_ptr][<- head]          (most recent record)
//! ```
//!
//! The word just below `head` holds the offset of the previous record,
//! and the word at a record's start position later receives the offset of
//! its successor — walking is possible in both directions. Wrapping is
//! handled by restarting at the arena origin whenever the next record
//! could touch the arena end, and the tail retreats whenever the next
//! record could collide with it. On average this keeps roughly twice the
//! maximum record size unused; that slack is what keeps head and tail
//! from ever colliding.

use tracing::error;

use crate::{codec, simd, VaultError, VaultResult};

const WORD: usize = std::mem::size_of::<usize>();
const PATCH_HEADER: usize = 2 * WORD;
const RAW_FLAG: usize = 1;

fn read_word(data: &[u8], at: usize) -> usize {
    let mut bytes = [0u8; WORD];
    bytes.copy_from_slice(&data[at..at + WORD]);
    usize::from_ne_bytes(bytes)
}

fn write_word(data: &mut [u8], at: usize, value: usize) {
    data[at..at + WORD].copy_from_slice(&value.to_ne_bytes());
}

/// A bounded history of simulation snapshots supporting constant-time
/// push and pop at the head, with automatic eviction at the tail.
///
/// ```
/// use framevault::RewindBuffer;
///
/// let mut rewind = RewindBuffer::new(4, 4096)?;
/// rewind.push(&[1, 2, 3, 4])?;
/// rewind.push(&[1, 2, 3, 5])?;
///
/// assert_eq!(rewind.pop()?, Some(&[1, 2, 3, 5][..]));
/// assert_eq!(rewind.pop()?, Some(&[1, 2, 3, 4][..]));
/// assert_eq!(rewind.pop()?, None);
/// # Ok::<(), framevault::VaultError>(())
/// ```
#[derive(Debug)]
pub struct RewindBuffer {
    /// The circular patch arena.
    data: Vec<u8>,
    capacity: usize,
    /// Offset just past the most recent record's back-pointer word.
    head: usize,
    /// Offset of the oldest record's link word.
    tail: usize,

    /// Uncompressed copy of the most recently pushed snapshot; patches
    /// only make sense applied on top of it.
    this_block: Vec<u8>,
    /// Staging block the caller writes the next snapshot into.
    next_block: Vec<u8>,
    /// XOR workspace shared by encode and decode.
    delta_scratch: Vec<u8>,

    state_size: usize,
    block_size: usize,
    max_comp_size: usize,
    entries: usize,
    this_valid: bool,
}

impl RewindBuffer {
    /// Creates an arena of `capacity` bytes for snapshots of exactly
    /// `state_size` bytes.
    pub fn new(state_size: usize, capacity: usize) -> VaultResult<Self> {
        if state_size == 0 {
            return Err(VaultError::InvalidRequest {
                info: "rewind state size must be non-zero".into(),
            });
        }
        // Blocks are rounded up to 2-byte alignment; the padding byte is
        // zero in every block, so it never perturbs a delta.
        let block_size = (state_size + 1) & !1usize;
        // A record is surrounded by link words on both sides.
        let max_comp_size = PATCH_HEADER + codec::compress_bound(block_size) + 2 * WORD;
        if capacity < WORD + max_comp_size {
            return Err(VaultError::RewindCapacityInsufficient {
                required: WORD + max_comp_size,
                capacity,
            });
        }
        Ok(Self {
            data: vec![0u8; capacity],
            capacity,
            head: WORD,
            tail: WORD,
            this_block: vec![0u8; block_size],
            next_block: vec![0u8; block_size],
            delta_scratch: vec![0u8; block_size],
            state_size,
            block_size,
            max_comp_size,
            entries: 0,
            this_valid: false,
        })
    }

    /// Snapshot size this arena was created for.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Number of snapshots currently reachable by popping.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// The uncompressed baseline snapshot: the most recently pushed state,
    /// or whatever the last pop decoded. Meaningful once anything was
    /// pushed; also the state an exhausted pop leaves behind.
    #[must_use]
    pub fn current(&self) -> &[u8] {
        &self.this_block[..self.state_size]
    }

    /// First half of a push: returns the staging block for the caller to
    /// serialize the new snapshot into. Follow with [`commit_push`].
    ///
    /// If the baseline was consumed by earlier pops, the most recent
    /// record is re-adopted as baseline first, so the patch written by
    /// `commit_push` applies to the right state.
    ///
    /// [`commit_push`]: Self::commit_push
    pub fn begin_push(&mut self) -> &mut [u8] {
        if !self.this_valid && self.pop_internal().unwrap_or(false) {
            self.this_valid = true;
            self.entries += 1;
        }
        &mut self.next_block[..self.state_size]
    }

    /// Second half of a push: encodes the staged snapshot as a patch
    /// against the baseline, evicting from the tail as needed.
    pub fn commit_push(&mut self) -> VaultResult<()> {
        if self.this_valid {
            if self.capacity < WORD + self.max_comp_size {
                return Err(VaultError::RewindCapacityInsufficient {
                    required: WORD + self.max_comp_size,
                    capacity: self.capacity,
                });
            }

            // Retreat the tail until one maximum-size record fits between
            // head and tail. An empty arena has nothing left to evict.
            while self.head != self.tail {
                let remaining =
                    (self.tail + self.capacity - WORD - self.head - 1) % self.capacity + 1;
                if remaining > self.max_comp_size {
                    break;
                }
                self.tail = read_word(&self.data, self.tail);
                self.entries = self.entries.saturating_sub(1);
            }

            let mut pos = self.head + WORD;
            let written = self.write_patch(pos);
            pos += written;

            // A record must never span the arena end; restart at the
            // origin instead, nudging a tail parked at the start sentinel.
            if pos + self.max_comp_size > self.capacity {
                pos = 0;
                if self.tail == WORD {
                    self.tail = read_word(&self.data, self.tail);
                }
            }
            write_word(&mut self.data, pos, self.head);
            pos += WORD;
            write_word(&mut self.data, self.head, pos);
            self.head = pos;
        } else {
            self.this_valid = true;
        }

        std::mem::swap(&mut self.this_block, &mut self.next_block);
        self.entries += 1;
        Ok(())
    }

    /// Pushes a snapshot in one call. `state` must be exactly
    /// [`state_size`](Self::state_size) bytes.
    pub fn push(&mut self, state: &[u8]) -> VaultResult<()> {
        if state.len() != self.state_size {
            return Err(VaultError::InvalidRequest {
                info: format!(
                    "rewind push of {} bytes into a {}-byte arena slot",
                    state.len(),
                    self.state_size
                ),
            });
        }
        self.begin_push().copy_from_slice(state);
        self.commit_push()
    }

    /// Pops the most recent snapshot, returning `Ok(None)` once the
    /// history is exhausted (the baseline remains readable via
    /// [`current`](Self::current)).
    pub fn pop(&mut self) -> VaultResult<Option<&[u8]>> {
        if self.pop_internal()? {
            Ok(Some(&self.this_block[..self.state_size]))
        } else {
            Ok(None)
        }
    }

    fn pop_internal(&mut self) -> VaultResult<bool> {
        if self.this_valid {
            // The baseline IS the most recent snapshot; hand it back
            // without touching the arena.
            self.this_valid = false;
            self.entries = self.entries.saturating_sub(1);
            return Ok(true);
        }

        if self.head == self.tail {
            return Ok(false);
        }

        let start = read_word(&self.data, self.head - WORD);
        self.head = start;
        self.decode_patch(start + WORD)?;
        self.entries = self.entries.saturating_sub(1);
        Ok(true)
    }

    /// Encodes `this XOR next` at arena offset `at` (header + payload),
    /// returning the bytes written. Falls back to the raw delta when LZ4
    /// is not a win.
    fn write_patch(&mut self, at: usize) -> usize {
        let Self {
            data,
            this_block,
            next_block,
            delta_scratch,
            block_size,
            ..
        } = self;
        simd::xor_into(delta_scratch, this_block, next_block);

        let bound = codec::compress_bound(*block_size);
        let payload_at = at + PATCH_HEADER;
        let mut flags = 0usize;
        let payload_size = match codec::compress_into_slice(
            delta_scratch,
            &mut data[payload_at..payload_at + bound],
            1,
        ) {
            Some(len) if len > 0 && len < *block_size => len,
            _ => {
                data[payload_at..payload_at + *block_size].copy_from_slice(delta_scratch);
                flags |= RAW_FLAG;
                *block_size
            },
        };

        write_word(data, at, payload_size);
        write_word(data, at + WORD, flags);
        PATCH_HEADER + payload_size
    }

    /// Applies the patch at arena offset `at` onto the baseline block.
    fn decode_patch(&mut self, at: usize) -> VaultResult<()> {
        let corrupt = VaultError::RewindPatchCorrupt {
            expected: self.block_size,
        };
        if at.checked_add(PATCH_HEADER).map_or(true, |end| end > self.capacity) {
            error!("rewind patch header overruns the arena");
            return Err(corrupt);
        }
        let payload_size = read_word(&self.data, at);
        let flags = read_word(&self.data, at + WORD);
        let payload_at = at + PATCH_HEADER;

        if payload_size > self.capacity - payload_at {
            error!("rewind patch overruns the arena");
            return Err(corrupt);
        }

        let Self {
            data,
            this_block,
            delta_scratch,
            block_size,
            ..
        } = self;
        let payload = &data[payload_at..payload_at + payload_size];

        if flags & RAW_FLAG != 0 {
            if payload_size != *block_size {
                error!("raw rewind patch has the wrong size");
                return Err(corrupt);
            }
            delta_scratch.copy_from_slice(payload);
        } else if !codec::decompress_exact(payload, delta_scratch, *block_size) {
            error!("failed to decode rewind patch");
            return Err(corrupt);
        }

        simd::xor_in_place(this_block, delta_scratch);
        Ok(())
    }
}

// #########
// # TESTS #
// #########
