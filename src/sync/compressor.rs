//! Background compression worker.
//!
//! One worker thread compresses snapshot payloads off the simulation
//! thread. Jobs and results travel through two bounded deques behind a
//! single mutex with one condition variable per direction. A job carries
//! the slot index it was queued for (a weak back-reference the worker
//! never dereferences) plus an `Arc` of the input bytes; only the
//! simulation thread touches ring state, re-establishing the job's
//! identity from `(Arc pointer, frame)` when it applies the result.
//!
//! The worker always pushes its result, even during shutdown — `stop()`
//! joins the thread and hands whatever is left in both deques back to the
//! caller, so every pending flag can be cleared and every buffer dropped
//! on the engine side.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{codec, Frame, SAVED_FRAME_SLOTS};

/// A compression request for one ring slot.
#[derive(Debug, Clone)]
pub(crate) struct CompressJob {
    /// Ring slot the job belongs to. Never dereferenced by the worker.
    pub(crate) slot: usize,
    /// Frame the slot held when the job was queued.
    pub(crate) frame: Frame,
    /// The payload bytes to compress, shared with the ring slot.
    pub(crate) input: Arc<Vec<u8>>,
    /// Acceleration factor forwarded to the codec.
    pub(crate) accel: i32,
}

/// The outcome of one compression job.
#[derive(Debug)]
pub(crate) struct CompressResult {
    pub(crate) slot: usize,
    pub(crate) frame: Frame,
    /// The job's input, returned for the identity check.
    pub(crate) input: Arc<Vec<u8>>,
    /// The compressed bytes, or `None` if the encoder failed.
    pub(crate) compressed: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Queues {
    jobs: VecDeque<CompressJob>,
    results: VecDeque<CompressResult>,
    shutdown: bool,
    jobs_max: usize,
    results_max: usize,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<Queues>,
    /// Signalled when a job is queued or shutdown begins; the worker waits.
    jobs_cv: Condvar,
    /// Signalled when a result lands or shutdown begins; the producer may
    /// wait here while freeing a slot whose compression is still in flight.
    done_cv: Condvar,
}

/// Handle to the compression worker thread.
#[derive(Debug)]
pub(crate) struct CompressWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Snapshot of the queue lengths and observed maxima.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct QueueStats {
    pub(crate) jobs_len: usize,
    pub(crate) results_len: usize,
    pub(crate) jobs_max: usize,
    pub(crate) results_max: usize,
}

impl CompressWorker {
    /// Starts the worker thread.
    pub(crate) fn start() -> Self {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("framevault-compress".into())
            .spawn(move || worker_loop(&worker_shared))
            .expect("spawning the compression worker thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Queues a compression job. Refused (returns `false`) when shutdown is
    /// in progress or the two queues together already hold a full ring's
    /// worth of entries; the caller falls back to inline compression.
    pub(crate) fn queue(&self, job: CompressJob) -> bool {
        if self.thread.is_none() {
            return false;
        }
        {
            let mut queues = self.shared.queues.lock();
            if queues.shutdown {
                return false;
            }
            if queues.jobs.len() + queues.results.len() >= SAVED_FRAME_SLOTS {
                trace!(
                    jobs = queues.jobs.len(),
                    results = queues.results.len(),
                    "compression queue full, falling back to inline"
                );
                return false;
            }
            queues.jobs.push_back(job);
            if queues.jobs.len() > queues.jobs_max {
                queues.jobs_max = queues.jobs.len();
            }
        }
        self.shared.jobs_cv.notify_one();
        true
    }

    /// Moves every finished result out of the worker.
    pub(crate) fn drain_results(&self) -> Vec<CompressResult> {
        let mut queues = self.shared.queues.lock();
        queues.results.drain(..).collect()
    }

    /// Blocks until at least one result is available or shutdown begins.
    /// Returns `false` on shutdown.
    pub(crate) fn wait_for_results(&self) -> bool {
        let mut queues = self.shared.queues.lock();
        while queues.results.is_empty() && !queues.shutdown {
            self.shared.done_cv.wait(&mut queues);
        }
        !queues.shutdown
    }

    pub(crate) fn queue_stats(&self) -> QueueStats {
        let queues = self.shared.queues.lock();
        QueueStats {
            jobs_len: queues.jobs.len(),
            results_len: queues.results.len(),
            jobs_max: queues.jobs_max,
            results_max: queues.results_max,
        }
    }

    /// Signals shutdown, joins the thread, and returns everything left in
    /// both deques so the caller can clear pending flags and drop buffers.
    pub(crate) fn stop(&mut self) -> (Vec<CompressJob>, Vec<CompressResult>) {
        {
            let mut queues = self.shared.queues.lock();
            queues.shutdown = true;
        }
        self.shared.jobs_cv.notify_all();
        self.shared.done_cv.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        // Shutdown stays set: with the thread gone, a queued job would
        // leave its slot pending forever.
        let mut queues = self.shared.queues.lock();
        let jobs = queues.jobs.drain(..).collect();
        let results = queues.results.drain(..).collect();
        queues.jobs_max = 0;
        queues.results_max = 0;
        (jobs, results)
    }
}

impl Drop for CompressWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queues = shared.queues.lock();
            while queues.jobs.is_empty() && !queues.shutdown {
                shared.jobs_cv.wait(&mut queues);
            }
            if queues.shutdown && queues.jobs.is_empty() {
                return;
            }
            match queues.jobs.pop_front() {
                Some(job) => job,
                None => continue,
            }
        };

        // Compression runs outside the lock; the input stays alive through
        // the shared Arc even if the slot has been rewritten meanwhile.
        let compressed = codec::compress(&job.input, job.accel);

        {
            let mut queues = shared.queues.lock();
            queues.results.push_back(CompressResult {
                slot: job.slot,
                frame: job.frame,
                input: job.input,
                compressed,
            });
            if queues.results.len() > queues.results_max {
                queues.results_max = queues.results.len();
            }
        }
        shared.done_cv.notify_all();
    }
}

// #########
// # TESTS #
// #########
