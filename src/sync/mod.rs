//! # Sync engine — rollback core
//!
//! The sync engine manages state snapshots and input prediction for a
//! deterministic simulation. Each tick it hands out inputs (confirmed or
//! predicted), saves a snapshot of the advanced frame, and — when a late
//! authoritative input contradicts a prediction — rolls the simulation
//! back to the oldest wrong frame and replays forward with corrected
//! inputs.
//!
//! ## Snapshot encoding
//!
//! Snapshots live in a fixed ring of [`SAVED_FRAME_SLOTS`] entries. Every
//! [`KEYFRAME_INTERVAL`]-th frame is stored standalone; frames in between
//! are stored as the XOR difference against their predecessor, which is
//! mostly zeros for a typical simulation and compresses extremely well.
//! Either form is then LZ4-compressed when that actually shrinks it —
//! inline, or on a background worker thread when
//! [`SyncConfig::async_compress`] is set. A snapshot whose compression is
//! still in flight is simply served in its uncompressed form; the engine's
//! observable output never depends on worker timing.
//!
//! ## The simulation boundary
//!
//! The engine drives the simulation exclusively through
//! [`SimulationHandler`]. `save_state` receives a reusable buffer from an
//! internal pool and may fill it or substitute its own allocation;
//! whatever comes back is owned by the engine until the slot is recycled.

mod compressor;
mod pool;
mod saved_frames;
mod scratch;

pub use saved_frames::SnapshotEncoding;

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::frame_info::{ConnectStatus, GameInput};
use crate::input_queue::InputQueue;
use crate::sync::compressor::{CompressJob, CompressResult, CompressWorker};
use crate::sync::pool::StateBufferPool;
use crate::sync::saved_frames::{SavedFrames, SnapshotPayload};
use crate::sync::scratch::ScratchBuffer;
use crate::{
    codec, simd, Frame, SyncConfig, VaultError, VaultResult, KEYFRAME_INTERVAL,
    SAVED_FRAME_SLOTS,
};

/// Returned by a [`SimulationHandler`] callback to abort the current
/// engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulationRejected;

impl std::fmt::Display for SimulationRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "simulation rejected the request")
    }
}

impl std::error::Error for SimulationRejected {}

/// A serialized snapshot produced by [`SimulationHandler::save_state`].
#[derive(Debug)]
pub struct SaveOutput {
    /// The full serialized simulation state.
    pub bytes: Vec<u8>,
    /// Any checksum the simulation chooses; carried verbatim by the
    /// engine and never interpreted.
    pub checksum: u32,
}

/// The boundary between the engine and the opaque simulation.
///
/// All three callbacks must be deterministic: restoring a snapshot and
/// advancing with the same inputs must reproduce the same state bytes.
pub trait SimulationHandler {
    /// Serializes the entire observable simulation state.
    ///
    /// `scratch` is a reusable buffer (cleared, with capacity from earlier
    /// saves); the implementation may fill and return it, or return any
    /// other buffer it likes. Errors abort the save.
    fn save_state(
        &mut self,
        frame: Frame,
        scratch: Vec<u8>,
    ) -> Result<SaveOutput, SimulationRejected>;

    /// Restores the simulation to the state encoded by `state`.
    fn load_state(&mut self, state: &[u8]) -> Result<(), SimulationRejected>;

    /// Advances the simulation by one tick using `inputs`, the
    /// concatenated per-player input blocks produced by
    /// [`SyncEngine::synchronize_inputs`]. Bit `i` of `disconnect_flags`
    /// marks player `i` as disconnected (its block is zeroed).
    fn advance_frame(
        &mut self,
        inputs: &[u8],
        disconnect_flags: u32,
    ) -> Result<(), SimulationRejected>;
}

/// Diagnostic view of one saved-frame ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedFrameInfo {
    /// The frame the slot holds.
    pub frame: Frame,
    /// How the snapshot is encoded right now. An async compression still
    /// in flight reports the uncompressed encoding.
    pub encoding: SnapshotEncoding,
    /// Bytes stored in the slot.
    pub stored_len: usize,
    /// Bytes the snapshot decodes to.
    pub uncompressed_size: usize,
    /// The checksum the save callback supplied for this frame.
    pub checksum: u32,
}

/// Snapshot-store statistics, pull-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateStats {
    /// Frames stored in delta form so far.
    pub delta_frames: u32,
    /// Frames stored standalone so far.
    pub keyframes: u32,
    /// Stored-to-raw percentage of the most recent delta frame.
    pub delta_ratio_last: u32,
    /// Largest stored-to-raw percentage observed for a delta frame.
    pub delta_ratio_max: u32,
    /// Average stored-to-raw percentage across all delta frames.
    pub delta_ratio_avg: u32,
    /// Compression jobs currently queued.
    pub compress_job_queue_len: usize,
    /// Compression results awaiting merge.
    pub compress_result_queue_len: usize,
    /// Peak job queue length observed.
    pub compress_job_queue_max: usize,
    /// Peak result queue length observed.
    pub compress_result_queue_max: usize,
    /// Ring slots with a compression currently in flight.
    pub compress_pending_count: usize,
}

#[derive(Debug, Default)]
struct DeltaStats {
    delta_bytes_sum: u64,
    delta_raw_bytes_sum: u64,
    delta_frames: u32,
    keyframes: u32,
    delta_ratio_last: u32,
    delta_ratio_max: u32,
}

impl DeltaStats {
    fn record_delta(&mut self, stored_len: usize, raw_len: usize) {
        let mut ratio = 0u32;
        if raw_len > 0 {
            ratio = ((stored_len as u64 * 100) / raw_len as u64).min(100) as u32;
        }
        self.delta_ratio_last = ratio;
        if ratio > self.delta_ratio_max {
            self.delta_ratio_max = ratio;
        }
        self.delta_bytes_sum += stored_len as u64;
        self.delta_raw_bytes_sum += raw_len as u64;
        self.delta_frames += 1;
    }

    fn average_ratio(&self) -> u32 {
        if self.delta_raw_bytes_sum == 0 {
            return 0;
        }
        ((self.delta_bytes_sum * 100) / self.delta_raw_bytes_sum).min(100) as u32
    }
}

/// The raw bytes of the most recently saved or loaded frame, kept around
/// so the next save can be stored as a delta against it.
#[derive(Debug, Default)]
struct LastState {
    data: ScratchBuffer,
    size: usize,
    frame: Frame,
    valid: bool,
}

impl LastState {
    fn update(&mut self, bytes: &[u8], frame: Frame) {
        self.data.ensure(bytes.len());
        simd::copy_bytes(self.data.as_mut_slice(), bytes);
        self.size = bytes.len();
        self.frame = frame;
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.size = 0;
        self.frame = Frame::NULL;
        self.data.reset();
    }
}

/// The rollback sync engine.
///
/// One instance per session. All methods are called from the simulation
/// thread; the only other thread the engine ever owns is the optional
/// compression worker, which never touches engine state directly.
#[derive(Debug)]
pub struct SyncEngine {
    config: SyncConfig,
    lz4_accel: i32,
    max_prediction: usize,

    frame_count: Frame,
    last_confirmed_frame: Frame,
    rolling_back: bool,

    saved: SavedFrames,
    input_queues: Vec<InputQueue>,
    pool: StateBufferPool,
    decompress_buffer: ScratchBuffer,
    delta_buffer: ScratchBuffer,
    last_state: LastState,
    delta_stats: DeltaStats,
    worker: Option<CompressWorker>,
}

impl SyncEngine {
    /// Creates an engine for the given configuration, starting the
    /// compression worker when `async_compress` is set.
    pub fn new(config: SyncConfig) -> VaultResult<Self> {
        let config = config.validated()?;
        let lz4_accel = config.resolved_lz4_accel();
        let input_queues = (0..config.num_players)
            .map(|id| InputQueue::new(id, config.input_size))
            .collect();
        let worker = config.async_compress.then(CompressWorker::start);
        debug!(
            num_players = config.num_players,
            input_size = config.input_size,
            prediction = config.num_prediction_frames,
            lz4_accel,
            async_compress = config.async_compress,
            "sync engine initialized"
        );
        Ok(Self {
            max_prediction: config.num_prediction_frames,
            lz4_accel,
            config,
            frame_count: Frame::new(0),
            last_confirmed_frame: Frame::NULL,
            rolling_back: false,
            saved: SavedFrames::new(),
            input_queues,
            pool: StateBufferPool::new(),
            decompress_buffer: ScratchBuffer::new(),
            delta_buffer: ScratchBuffer::new(),
            last_state: LastState::default(),
            delta_stats: DeltaStats::default(),
            worker,
        })
    }

    /// The current frame of the simulation.
    #[must_use]
    pub fn frame_count(&self) -> Frame {
        self.frame_count
    }

    /// Whether a rollback replay is in progress.
    #[must_use]
    pub fn in_rollback(&self) -> bool {
        self.rolling_back
    }

    /// Marks every frame up to `frame` as confirmed by all peers and
    /// discards input history that no future prediction can need.
    pub fn set_last_confirmed_frame(&mut self, frame: Frame) {
        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// Sets the frame delay for one player's inputs.
    pub fn set_frame_delay(&mut self, queue: usize, delay: usize) -> VaultResult<()> {
        self.queue_index_checked(queue)?;
        self.input_queues[queue].set_frame_delay(delay);
        Ok(())
    }

    /// Adds the local player's input for the current frame.
    ///
    /// Refused with [`VaultError::PredictionBarrier`] when the simulation
    /// is already a full prediction window ahead of the last confirmed
    /// remote frame. The very first input also snapshots frame 0, so there
    /// is always a state to roll back to.
    pub fn add_local_input(
        &mut self,
        sim: &mut dyn SimulationHandler,
        queue: usize,
        mut input: GameInput,
    ) -> VaultResult<Frame> {
        self.queue_index_checked(queue)?;

        let frames_behind = self.frame_count - self.last_confirmed_frame;
        if self.frame_count >= self.max_prediction as i32
            && frames_behind >= self.max_prediction as i32
        {
            trace!(
                frame = %self.frame_count,
                frames_behind,
                "rejecting local input: prediction barrier reached"
            );
            return Err(VaultError::PredictionBarrier);
        }

        // The very first input snapshots frame 0 exactly once, even with
        // several local players adding inputs for the same frame.
        if self.frame_count == 0 && self.saved.find(Frame::new(0)).is_none() {
            self.save_current_frame(sim)?;
        }

        trace!(frame = %self.frame_count, queue, "adding undelayed local input");
        input.frame = self.frame_count;
        Ok(self.input_queues[queue].add_input(input))
    }

    /// Adds a remote player's input as it arrives from the network layer.
    pub fn add_remote_input(&mut self, queue: usize, input: GameInput) -> VaultResult<Frame> {
        self.queue_index_checked(queue)?;
        Ok(self.input_queues[queue].add_input(input))
    }

    /// Writes every player's input for the current frame into `output`
    /// (concatenated blocks of `input_size` bytes) and returns the
    /// disconnect flag bitmask. Missing remote inputs are predicted.
    pub fn synchronize_inputs(
        &mut self,
        connect_status: &[ConnectStatus],
        output: &mut [u8],
    ) -> VaultResult<u32> {
        self.check_io_shapes(connect_status, output)?;

        let input_size = self.config.input_size;
        let mut disconnect_flags = 0u32;
        output[..self.config.num_players * input_size].fill(0);

        for (index, status) in connect_status
            .iter()
            .enumerate()
            .take(self.config.num_players)
        {
            if status.disconnected && self.frame_count > status.last_frame {
                disconnect_flags |= 1 << index;
            } else {
                let (input, _) = self.input_queues[index].input(self.frame_count);
                output[index * input_size..index * input_size + input.size()]
                    .copy_from_slice(input.bits());
            }
        }
        Ok(disconnect_flags)
    }

    /// Like [`synchronize_inputs`](Self::synchronize_inputs), but only for
    /// a frame whose inputs are fully confirmed; never predicts.
    pub fn confirmed_inputs(
        &mut self,
        connect_status: &[ConnectStatus],
        frame: Frame,
        output: &mut [u8],
    ) -> VaultResult<u32> {
        self.check_io_shapes(connect_status, output)?;

        let input_size = self.config.input_size;
        let mut disconnect_flags = 0u32;
        output[..self.config.num_players * input_size].fill(0);

        for (index, status) in connect_status
            .iter()
            .enumerate()
            .take(self.config.num_players)
        {
            if status.disconnected && frame > status.last_frame {
                disconnect_flags |= 1 << index;
            } else {
                let input = self.input_queues[index].confirmed_input(frame)?;
                output[index * input_size..index * input_size + input.size()]
                    .copy_from_slice(input.bits());
            }
        }
        Ok(disconnect_flags)
    }

    /// Checks every input queue for a mispredicted frame and, if one is
    /// found, rolls back to it and replays forward.
    pub fn check_simulation(
        &mut self,
        sim: &mut dyn SimulationHandler,
        connect_status: &[ConnectStatus],
    ) -> VaultResult<()> {
        if let Some(seek_to) = self.check_simulation_consistency() {
            self.adjust_simulation(sim, connect_status, seek_to)?;
        }
        Ok(())
    }

    /// The oldest mispredicted frame across all queues, if any.
    #[must_use]
    pub fn check_simulation_consistency(&self) -> Option<Frame> {
        let mut first_incorrect = Frame::NULL;
        for (index, queue) in self.input_queues.iter().enumerate() {
            let incorrect = queue.first_incorrect_frame();
            trace!(queue = index, frame = %incorrect, "considering incorrect frame");
            if !incorrect.is_null()
                && (first_incorrect.is_null() || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        if first_incorrect.is_null() {
            trace!("prediction ok, proceeding");
            None
        } else {
            Some(first_incorrect)
        }
    }

    /// Rolls the simulation back to `seek_to` and replays up to the frame
    /// it was on, feeding each replayed tick its corrected inputs.
    ///
    /// A failed load is a logged degradation, not a fatal error: the
    /// predictions from `seek_to` onward are cleared and the simulation
    /// keeps running on its current (possibly diverged) timeline until
    /// later confirmed inputs straighten it out.
    pub fn adjust_simulation(
        &mut self,
        sim: &mut dyn SimulationHandler,
        connect_status: &[ConnectStatus],
        seek_to: Frame,
    ) -> VaultResult<()> {
        let target = self.frame_count;
        let count = self.frame_count - seek_to;

        debug!(%seek_to, %target, count, "rollback: catching up");
        self.rolling_back = true;

        let loaded = self.load_frame(sim, seek_to);
        if loaded.is_err() || self.frame_count != seek_to {
            warn!(
                %seek_to,
                have = %self.frame_count,
                error = ?loaded.err(),
                "failed to load rollback frame; clearing predictions and continuing"
            );
            self.reset_prediction(seek_to);
            self.rolling_back = false;
            return Ok(());
        }

        // Replay: the per-tick sequence the application runs, driven here.
        self.reset_prediction(self.frame_count);
        let mut inputs = vec![0u8; self.config.num_players * self.config.input_size];
        for _ in 0..count {
            let flags = self.synchronize_inputs(connect_status, &mut inputs)?;
            sim.advance_frame(&inputs, flags)
                .map_err(|_| VaultError::AdvanceFailed {
                    frame: self.frame_count,
                })?;
            self.increment_frame(sim)?;
        }

        if self.frame_count != target {
            warn!(
                have = %self.frame_count,
                want = %target,
                "rollback replay ended on an unexpected frame"
            );
        }
        self.rolling_back = false;
        debug!("rollback complete");
        Ok(())
    }

    /// Advances the engine's frame counter and snapshots the new frame.
    /// Called once per simulation tick, after the simulation advanced.
    pub fn increment_frame(&mut self, sim: &mut dyn SimulationHandler) -> VaultResult<()> {
        self.frame_count += 1;
        self.save_current_frame(sim)
    }

    /// Snapshots the current frame into the ring slot at `head`.
    pub fn save_current_frame(&mut self, sim: &mut dyn SimulationHandler) -> VaultResult<()> {
        // Merge any compressions that finished since the last tick before
        // touching the slot they may refer to.
        self.process_compression_results();

        let head = self.saved.head;
        self.release_slot(head);

        let frame = self.frame_count;
        let scratch = self.pool.acquire().unwrap_or_default();
        let SaveOutput { bytes, checksum } = sim
            .save_state(frame, scratch)
            .map_err(|_| VaultError::SaveFailed { frame })?;
        let size = bytes.len();
        if size == 0 {
            return Err(VaultError::SaveFailed { frame });
        }
        self.pool.note_size(size);

        let keyframe = frame % KEYFRAME_INTERVAL == 0;
        let can_delta = self.last_state.valid
            && self.last_state.size == size
            && self.last_state.frame == frame - 1;
        let use_delta = can_delta && !keyframe;

        let raw = Arc::new(bytes);
        let payload = if use_delta {
            let mut delta = vec![0u8; size];
            simd::xor_into(&mut delta, &raw, &self.last_state.data.as_slice()[..size]);
            self.last_state.update(&raw, frame);
            if let Ok(buffer) = Arc::try_unwrap(raw) {
                self.pool.recycle(buffer);
            }
            SnapshotPayload::Delta(Arc::new(delta))
        } else {
            self.last_state.update(&raw, frame);
            SnapshotPayload::Raw(raw)
        };

        {
            let slot = &mut self.saved.frames[head];
            slot.frame = frame;
            slot.payload = Some(payload);
            slot.uncompressed_size = size;
            slot.checksum = checksum;
            slot.compress_pending = false;
        }

        if !self.queue_compression(head) {
            self.compress_sync(head);
        }

        // Ratios reflect the stored size right now; a still-pending async
        // compression counts at its uncompressed size, exactly like the
        // queue-time bookkeeping it replaces.
        let slot = &self.saved.frames[head];
        let stored_len = slot
            .payload
            .as_ref()
            .map_or(0, SnapshotPayload::stored_len);
        if slot.payload.as_ref().is_some_and(SnapshotPayload::is_delta) {
            self.delta_stats.record_delta(stored_len, size);
        } else {
            self.delta_stats.keyframes += 1;
        }

        trace!(%frame, size, stored_len, checksum, "saved frame");
        self.saved.advance_head();
        Ok(())
    }

    /// Restores the simulation to `frame` from the ring.
    ///
    /// Loading the current frame is a no-op. On success the ring head
    /// points one past the loaded slot, as if that frame had just been
    /// saved.
    pub fn load_frame(
        &mut self,
        sim: &mut dyn SimulationHandler,
        frame: Frame,
    ) -> VaultResult<()> {
        if frame == self.frame_count {
            trace!(%frame, "load is a no-op");
            return Ok(());
        }

        let index = self
            .saved
            .find(frame)
            .ok_or(VaultError::FrameNotFound { frame })?;
        self.saved.head = index;

        let (slot_frame, size, checksum, is_delta, is_compressed, raw_payload) = {
            let slot = &self.saved.frames[index];
            let payload = slot.payload.as_ref().ok_or(VaultError::LoadRejected {
                frame,
                reason: crate::error::LoadRejectReason::EmptySlot,
            })?;
            if slot.uncompressed_size == 0 || payload.stored_len() == 0 {
                return Err(VaultError::LoadRejected {
                    frame,
                    reason: crate::error::LoadRejectReason::InvalidSize,
                });
            }
            let raw_payload = match payload {
                SnapshotPayload::Raw(arc) => Some(Arc::clone(arc)),
                _ => None,
            };
            (
                slot.frame,
                slot.uncompressed_size,
                slot.checksum,
                payload.is_delta(),
                payload.is_compressed(),
                raw_payload,
            )
        };

        trace!(frame = %slot_frame, size, checksum, "loading frame");

        if is_delta {
            self.saved
                .reconstruct(frame, &mut self.decompress_buffer, &mut self.delta_buffer)?;
            sim.load_state(&self.decompress_buffer.as_slice()[..size])
                .map_err(|_| VaultError::LoadFailed { frame })?;
            self.commit_last_state_from_scratch(size, slot_frame);
        } else if is_compressed {
            self.decompress_buffer.ensure(size);
            {
                let slot = &self.saved.frames[index];
                slot.decode_raw(self.decompress_buffer.as_mut_slice())?;
            }
            sim.load_state(&self.decompress_buffer.as_slice()[..size])
                .map_err(|_| VaultError::LoadFailed { frame })?;
            self.commit_last_state_from_scratch(size, slot_frame);
        } else {
            // raw payloads are loaded without an intermediate copy
            let Some(raw) = raw_payload else {
                return Err(VaultError::LoadRejected {
                    frame,
                    reason: crate::error::LoadRejectReason::EmptySlot,
                });
            };
            sim.load_state(&raw[..size])
                .map_err(|_| VaultError::LoadFailed { frame })?;
            self.last_state.update(&raw[..size], slot_frame);
        }

        // Reset the frame counter and point the head one past the loaded
        // slot, as if we had just finished executing that frame.
        self.frame_count = slot_frame;
        self.saved.advance_head();
        Ok(())
    }

    /// Diagnostic view of the ring slot holding `frame`.
    #[must_use]
    pub fn saved_frame_info(&self, frame: Frame) -> Option<SavedFrameInfo> {
        let index = self.saved.find(frame)?;
        self.frame_info_at(index)
    }

    /// Diagnostic view of the most recently saved frame.
    #[must_use]
    pub fn last_saved_frame_info(&self) -> Option<SavedFrameInfo> {
        self.frame_info_at(self.saved.last_saved_index())
    }

    /// Decodes the full raw snapshot bytes of `frame`, walking the delta
    /// chain if needed. Intended for verification harnesses; the engine's
    /// own load path shares the same decoding.
    pub fn snapshot_bytes(&mut self, frame: Frame) -> VaultResult<Vec<u8>> {
        let size = {
            let index = self
                .saved
                .find(frame)
                .ok_or(VaultError::FrameNotFound { frame })?;
            self.saved.frames[index].uncompressed_size
        };
        self.saved
            .reconstruct(frame, &mut self.decompress_buffer, &mut self.delta_buffer)?;
        Ok(self.decompress_buffer.as_slice()[..size].to_vec())
    }

    /// Current snapshot-store statistics.
    #[must_use]
    pub fn state_stats(&self) -> StateStats {
        let mut stats = StateStats {
            delta_frames: self.delta_stats.delta_frames,
            keyframes: self.delta_stats.keyframes,
            delta_ratio_last: self.delta_stats.delta_ratio_last,
            delta_ratio_max: self.delta_stats.delta_ratio_max,
            delta_ratio_avg: self.delta_stats.average_ratio(),
            ..StateStats::default()
        };
        if let Some(worker) = &self.worker {
            let queues = worker.queue_stats();
            stats.compress_job_queue_len = queues.jobs_len;
            stats.compress_result_queue_len = queues.results_len;
            stats.compress_job_queue_max = queues.jobs_max;
            stats.compress_result_queue_max = queues.results_max;
        }
        stats.compress_pending_count = self
            .saved
            .frames
            .iter()
            .filter(|slot| slot.compress_pending)
            .count();
        stats
    }

    /// Merges every finished background compression into its ring slot.
    /// Stale results (the slot moved on) are discarded.
    pub fn process_compression_results(&mut self) {
        let Some(worker) = &self.worker else {
            return;
        };
        let results = worker.drain_results();
        for result in results {
            self.apply_compression_result(result);
        }
    }

    // --- internals ---

    fn frame_info_at(&self, index: usize) -> Option<SavedFrameInfo> {
        let slot = &self.saved.frames[index];
        let payload = slot.payload.as_ref()?;
        Some(SavedFrameInfo {
            frame: slot.frame,
            encoding: payload.encoding(),
            stored_len: payload.stored_len(),
            uncompressed_size: slot.uncompressed_size,
            checksum: slot.checksum,
        })
    }

    fn queue_index_checked(&self, queue: usize) -> VaultResult<()> {
        if queue >= self.input_queues.len() {
            return Err(VaultError::InvalidRequest {
                info: format!(
                    "queue index {} out of range ({} players)",
                    queue,
                    self.input_queues.len()
                ),
            });
        }
        Ok(())
    }

    fn check_io_shapes(
        &self,
        connect_status: &[ConnectStatus],
        output: &[u8],
    ) -> VaultResult<()> {
        let needed = self.config.num_players * self.config.input_size;
        if output.len() < needed {
            return Err(VaultError::InvalidRequest {
                info: format!(
                    "input output buffer too small ({} bytes needed, {} given)",
                    needed,
                    output.len()
                ),
            });
        }
        if connect_status.len() < self.config.num_players {
            return Err(VaultError::InvalidRequest {
                info: format!(
                    "connect status for {} players required, {} given",
                    self.config.num_players,
                    connect_status.len()
                ),
            });
        }
        Ok(())
    }

    fn reset_prediction(&mut self, frame: Frame) {
        for queue in &mut self.input_queues {
            queue.reset_prediction(frame);
        }
    }

    fn commit_last_state_from_scratch(&mut self, size: usize, frame: Frame) {
        let Self {
            decompress_buffer,
            last_state,
            ..
        } = self;
        last_state.update(&decompress_buffer.as_slice()[..size], frame);
    }

    /// Empties the slot at `index`, waiting out any in-flight compression
    /// and recycling a raw payload back into the pool.
    fn release_slot(&mut self, index: usize) {
        if self.saved.frames[index].compress_pending {
            self.wait_for_pending(index);
        }
        let payload = {
            let slot = &mut self.saved.frames[index];
            let payload = slot.payload.take();
            slot.frame = Frame::NULL;
            slot.uncompressed_size = 0;
            slot.checksum = 0;
            slot.compress_pending = false;
            payload
        };
        if let Some(SnapshotPayload::Raw(arc)) = payload {
            if let Ok(buffer) = Arc::try_unwrap(arc) {
                self.pool.recycle(buffer);
            }
        }
        // Delta and compressed payloads are engine-owned heap buffers;
        // dropping them here is the release.
    }

    /// Blocks until the compression in flight for `index` has resolved
    /// (applied or proven stale). Entered only under memory pressure, when
    /// the slot being replaced is still compressing.
    fn wait_for_pending(&mut self, index: usize) {
        loop {
            self.process_compression_results();
            if !self.saved.frames[index].compress_pending {
                return;
            }
            let worker_alive = match &self.worker {
                Some(worker) => worker.wait_for_results(),
                None => false,
            };
            if !worker_alive {
                self.saved.frames[index].compress_pending = false;
                return;
            }
        }
    }

    fn queue_compression(&mut self, index: usize) -> bool {
        let Some(worker) = &self.worker else {
            return false;
        };
        let slot = &self.saved.frames[index];
        if slot.compress_pending {
            return false;
        }
        let input = match slot.payload.as_ref() {
            Some(SnapshotPayload::Raw(arc)) | Some(SnapshotPayload::Delta(arc)) => {
                Arc::clone(arc)
            },
            _ => return false,
        };
        if input.is_empty() {
            return false;
        }
        let accepted = worker.queue(CompressJob {
            slot: index,
            frame: slot.frame,
            input,
            accel: self.lz4_accel,
        });
        if accepted {
            self.saved.frames[index].compress_pending = true;
        }
        accepted
    }

    /// Inline fallback for the same compress-and-swap the worker performs.
    fn compress_sync(&mut self, index: usize) {
        let (compressed, is_delta) = {
            let slot = &self.saved.frames[index];
            let payload = match slot.payload.as_ref() {
                Some(payload @ (SnapshotPayload::Raw(_) | SnapshotPayload::Delta(_))) => {
                    payload
                },
                _ => return,
            };
            let Some(compressed) = codec::compress(payload.bytes(), self.lz4_accel) else {
                return;
            };
            if compressed.is_empty() || compressed.len() >= slot.uncompressed_size {
                // no win; keep the raw form
                return;
            }
            (compressed, payload.is_delta())
        };
        self.swap_in_compressed(index, compressed, is_delta);
    }

    fn apply_compression_result(&mut self, result: CompressResult) {
        let CompressResult {
            slot: index,
            frame,
            input,
            compressed,
        } = result;
        debug_assert!(index < SAVED_FRAME_SLOTS);
        self.saved.frames[index].compress_pending = false;

        let Some(compressed) = compressed else {
            return;
        };

        let is_delta = {
            let slot = &self.saved.frames[index];
            if compressed.is_empty() || compressed.len() >= slot.uncompressed_size {
                // no win; keep the raw form
                return;
            }

            // The slot may have been rewritten while the job was in
            // flight; the shared input pointer plus the frame number
            // prove the result still belongs here.
            match slot.payload.as_ref() {
                Some(SnapshotPayload::Raw(arc))
                    if Arc::ptr_eq(arc, &input) && slot.frame == frame =>
                {
                    false
                },
                Some(SnapshotPayload::Delta(arc))
                    if Arc::ptr_eq(arc, &input) && slot.frame == frame =>
                {
                    true
                },
                _ => {
                    trace!(%frame, "discarding stale compression result");
                    return;
                },
            }
        };

        // Drop the job's clone first so the raw buffer is uniquely owned
        // and can go back to the pool.
        drop(input);
        self.swap_in_compressed(index, compressed, is_delta);
    }

    fn swap_in_compressed(&mut self, index: usize, compressed: Vec<u8>, is_delta: bool) {
        let old = {
            let slot = &mut self.saved.frames[index];
            let old = slot.payload.take();
            slot.payload = Some(if is_delta {
                SnapshotPayload::DeltaCompressed(compressed)
            } else {
                SnapshotPayload::Compressed(compressed)
            });
            old
        };
        if let Some(SnapshotPayload::Raw(arc)) = old {
            if let Ok(buffer) = Arc::try_unwrap(arc) {
                self.pool.recycle(buffer);
            }
        }
    }

    fn stop_worker(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let (jobs, results) = worker.stop();
        for job in jobs {
            if let Some(slot) = self.saved.frames.get_mut(job.slot) {
                slot.compress_pending = false;
            }
        }
        for result in results {
            if let Some(slot) = self.saved.frames.get_mut(result.slot) {
                slot.compress_pending = false;
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop_worker();
        self.pool.clear();
        self.last_state.invalidate();
        self.decompress_buffer.free();
        self.delta_buffer.free();
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::fnv1a32;
    use crate::rng::Pcg32;

    /// A tiny deterministic simulation: `state` is mutated by a PCG32
    /// stream keyed on the tick inputs.
    struct TestSim {
        state: Vec<u8>,
        tick: u64,
    }

    impl TestSim {
        fn new(size: usize) -> Self {
            Self {
                state: vec![0u8; size],
                tick: 0,
            }
        }

        fn step(&mut self) {
            self.tick += 1;
            let mut rng = Pcg32::seed_from_u64(self.tick);
            for byte in self.state.iter_mut() {
                *byte = byte.wrapping_add((rng.next_u32() & 0xFF) as u8);
            }
        }
    }

    impl SimulationHandler for TestSim {
        fn save_state(
            &mut self,
            _frame: Frame,
            mut scratch: Vec<u8>,
        ) -> Result<SaveOutput, SimulationRejected> {
            scratch.clear();
            scratch.extend_from_slice(&self.state);
            scratch.extend_from_slice(&self.tick.to_le_bytes());
            let checksum = fnv1a32(&scratch);
            Ok(SaveOutput {
                bytes: scratch,
                checksum,
            })
        }

        fn load_state(&mut self, state: &[u8]) -> Result<(), SimulationRejected> {
            let split = state.len() - 8;
            self.state.clear();
            self.state.extend_from_slice(&state[..split]);
            let mut tick_bytes = [0u8; 8];
            tick_bytes.copy_from_slice(&state[split..]);
            self.tick = u64::from_le_bytes(tick_bytes);
            Ok(())
        }

        fn advance_frame(
            &mut self,
            _inputs: &[u8],
            _disconnect_flags: u32,
        ) -> Result<(), SimulationRejected> {
            self.step();
            Ok(())
        }
    }

    fn engine(async_compress: bool) -> SyncEngine {
        let mut config = SyncConfig::new(2, 4);
        config.async_compress = async_compress;
        config.lz4_accel = 1;
        SyncEngine::new(config).expect("valid config")
    }

    fn run_frames(engine: &mut SyncEngine, sim: &mut TestSim, frames: usize) {
        let status = [ConnectStatus::default(); 2];
        let mut inputs = vec![0u8; 8];
        for frame in 0..frames {
            let local = GameInput::new(Frame::NULL, &[frame as u8, 0, 0, 0]);
            engine
                .add_local_input(sim, 0, local)
                .expect("no barrier in short runs");
            let remote = GameInput::new(Frame::new(frame as i32), &[0, 0, 0, 0]);
            engine.add_remote_input(1, remote).expect("queue exists");
            engine.set_last_confirmed_frame(Frame::new(frame as i32));
            engine
                .synchronize_inputs(&status, &mut inputs)
                .expect("inputs available");
            sim.step();
            engine.increment_frame(sim).expect("save succeeds");
        }
    }

    #[test]
    fn test_keyframes_are_not_deltas() {
        let mut engine = engine(false);
        let mut sim = TestSim::new(64);
        run_frames(&mut engine, &mut sim, 8);

        for frame in 0..=8 {
            let info = engine
                .saved_frame_info(Frame::new(frame))
                .expect("frame retained");
            let is_delta = matches!(
                info.encoding,
                SnapshotEncoding::Delta | SnapshotEncoding::DeltaCompressed
            );
            let expect_delta = frame % KEYFRAME_INTERVAL != 0;
            assert_eq!(is_delta, expect_delta, "frame {frame}");
        }
    }

    #[test]
    fn test_snapshot_bytes_roundtrip() {
        let mut engine = engine(false);
        let mut sim = TestSim::new(64);
        run_frames(&mut engine, &mut sim, 6);

        // re-save the live state and compare against the stored frame 6
        let expected = {
            let mut copy = sim.state.clone();
            copy.extend_from_slice(&sim.tick.to_le_bytes());
            copy
        };
        let stored = engine
            .snapshot_bytes(Frame::new(6))
            .expect("frame retained");
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_load_frame_restores_state() {
        let mut engine = engine(false);
        let mut sim = TestSim::new(64);
        run_frames(&mut engine, &mut sim, 5);

        let snapshot_at_3 = engine.snapshot_bytes(Frame::new(3)).expect("retained");
        engine.load_frame(&mut sim, Frame::new(3)).expect("load ok");
        assert_eq!(engine.frame_count(), Frame::new(3));

        let mut live = sim.state.clone();
        live.extend_from_slice(&sim.tick.to_le_bytes());
        assert_eq!(live, snapshot_at_3);
    }

    #[test]
    fn test_load_missing_frame_fails_cleanly() {
        let mut engine = engine(false);
        let mut sim = TestSim::new(64);
        run_frames(&mut engine, &mut sim, 3);

        let err = engine.load_frame(&mut sim, Frame::new(77)).unwrap_err();
        assert!(matches!(err, VaultError::FrameNotFound { .. }));
        // the engine is still usable
        engine.increment_frame(&mut sim).expect("still works");
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut engine = engine(false);
        let mut sim = TestSim::new(32);
        run_frames(&mut engine, &mut sim, SAVED_FRAME_SLOTS + 3);

        // the first frames have been overwritten
        assert!(engine.saved_frame_info(Frame::new(0)).is_none());
        let newest = (SAVED_FRAME_SLOTS + 3) as i32;
        assert!(engine.saved_frame_info(Frame::new(newest)).is_some());
    }

    #[test]
    fn test_stats_count_keyframes_and_deltas() {
        let mut engine = engine(false);
        let mut sim = TestSim::new(64);
        run_frames(&mut engine, &mut sim, 8);

        let stats = engine.state_stats();
        // saves: frame 0 (initial), frames 1..=8 via increments
        assert_eq!(stats.keyframes + stats.delta_frames, 9);
        assert_eq!(stats.keyframes, 3); // frames 0, 4, 8
        assert_eq!(stats.delta_frames, 6);
        assert!(stats.delta_ratio_last <= 100);
        assert!(stats.delta_ratio_avg <= 100);
    }

    #[test]
    fn test_async_engine_drops_cleanly_mid_flight() {
        let mut engine = engine(true);
        let mut sim = TestSim::new(4096);
        run_frames(&mut engine, &mut sim, 6);
        drop(engine); // must join the worker without hanging or panicking
    }
}
