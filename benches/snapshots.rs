//! Benchmarks for the snapshot hot paths: the per-tick save (delta +
//! compression), frame loading, and rewind arena push/pop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framevault::checksum::fnv1a32;
use framevault::rng::Pcg32;
use framevault::{
    ConnectStatus, Frame, GameInput, RewindBuffer, SaveOutput, SimulationHandler,
    SimulationRejected, SyncConfig, SyncEngine,
};

const STATE_SIZE: usize = 64 * 1024;

/// A simulation with a large, mostly-stable state: each step touches a
/// small window, the typical shape rollback snapshots are optimized for.
struct BenchSim {
    state: Vec<u8>,
    cursor: usize,
}

impl BenchSim {
    fn new() -> Self {
        let mut rng = Pcg32::seed_from_u64(11);
        let mut state = vec![0u8; STATE_SIZE];
        rng.fill_bytes(&mut state[..1024]);
        Self { state, cursor: 0 }
    }

    fn step(&mut self) {
        self.cursor = (self.cursor + 97) % (STATE_SIZE - 64);
        for byte in &mut self.state[self.cursor..self.cursor + 64] {
            *byte = byte.wrapping_add(1);
        }
    }
}

impl SimulationHandler for BenchSim {
    fn save_state(
        &mut self,
        _frame: Frame,
        mut scratch: Vec<u8>,
    ) -> Result<SaveOutput, SimulationRejected> {
        scratch.clear();
        scratch.extend_from_slice(&self.state);
        Ok(SaveOutput {
            checksum: fnv1a32(&scratch[..64]),
            bytes: scratch,
        })
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), SimulationRejected> {
        self.state.copy_from_slice(state);
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

fn bench_save_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("save");
    for &async_compress in &[false, true] {
        let label = if async_compress { "async" } else { "inline" };
        group.bench_function(label, |b| {
            let mut config = SyncConfig::new(2, 4);
            config.lz4_accel = 1;
            config.async_compress = async_compress;
            let mut engine = SyncEngine::new(config).expect("valid config");
            let mut sim = BenchSim::new();
            let status = [ConnectStatus::default(); 2];
            let mut inputs = vec![0u8; 8];
            let mut frame = 0i32;
            b.iter(|| {
                engine
                    .add_local_input(
                        &mut sim,
                        0,
                        GameInput::new(Frame::NULL, &frame.to_le_bytes()),
                    )
                    .expect("no barrier");
                engine
                    .add_remote_input(1, GameInput::new(Frame::new(frame), &[0; 4]))
                    .expect("queue exists");
                engine.set_last_confirmed_frame(Frame::new(frame));
                engine
                    .synchronize_inputs(&status, &mut inputs)
                    .expect("inputs available");
                sim.step();
                engine.increment_frame(&mut sim).expect("save succeeds");
                frame += 1;
            });
        });
    }
    group.finish();
}

fn bench_load_path(c: &mut Criterion) {
    c.bench_function("load_delta_frame", |b| {
        let mut config = SyncConfig::new(2, 4);
        config.lz4_accel = 1;
        let mut engine = SyncEngine::new(config).expect("valid config");
        let mut sim = BenchSim::new();
        let status = [ConnectStatus::default(); 2];
        let mut inputs = vec![0u8; 8];
        for frame in 0..8i32 {
            engine
                .add_local_input(&mut sim, 0, GameInput::new(Frame::NULL, &[0; 4]))
                .expect("no barrier");
            engine
                .add_remote_input(1, GameInput::new(Frame::new(frame), &[0; 4]))
                .expect("queue exists");
            engine
                .synchronize_inputs(&status, &mut inputs)
                .expect("inputs available");
            sim.step();
            engine.increment_frame(&mut sim).expect("save succeeds");
        }
        b.iter(|| {
            // frame 7 sits three deltas past the keyframe at 4
            engine
                .load_frame(&mut sim, black_box(Frame::new(7)))
                .expect("load ok");
            engine
                .load_frame(&mut sim, black_box(Frame::new(8)))
                .expect("load ok");
        });
    });
}

fn bench_rewind(c: &mut Criterion) {
    c.bench_function("rewind_push", |b| {
        let mut rewind = RewindBuffer::new(STATE_SIZE, 8 * 1024 * 1024).expect("capacity");
        let mut sim = BenchSim::new();
        b.iter(|| {
            sim.step();
            rewind.begin_push().copy_from_slice(&sim.state);
            rewind.commit_push().expect("push fits");
        });
    });

    c.bench_function("rewind_push_pop_cycle", |b| {
        let mut rewind = RewindBuffer::new(4096, 4 * 1024 * 1024).expect("capacity");
        let mut rng = Pcg32::seed_from_u64(3);
        let mut state = vec![0u8; 4096];
        b.iter(|| {
            for _ in 0..32 {
                let at = rng.gen_range(0..4096) as usize;
                state[at] = state[at].wrapping_add(1);
                rewind.push(&state).expect("push fits");
            }
            while rewind.pop().expect("decodes").is_some() {}
            black_box(rewind.current());
        });
    });
}

criterion_group!(benches, bench_save_path, bench_load_path, bench_rewind);
criterion_main!(benches);
