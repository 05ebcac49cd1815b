//! Shared test simulations.
//!
//! [`Sim`] is a deterministic toy simulation: its whole state is a byte
//! vector whose first eight bytes hold the tick counter, and each step
//! mixes the tick and the tick's inputs into the remaining bytes through
//! a PCG32 stream. Identical (state, inputs) always produce identical
//! successor states, which is exactly the determinism contract the engine
//! relies on.

use framevault::checksum::fnv1a32;
use framevault::rng::Pcg32;
use framevault::{Frame, SaveOutput, SimulationHandler, SimulationRejected};

/// Deterministic PRNG-mutating simulation.
pub struct Sim {
    data: Vec<u8>,
    /// Number of `advance_frame` calls observed.
    pub advances: u64,
    /// Number of `save_state` calls observed.
    pub saves: u64,
    /// Number of `load_state` calls observed.
    pub loads: u64,
}

impl Sim {
    pub fn new(state_size: usize) -> Self {
        assert!(state_size >= 8, "the tick counter needs eight bytes");
        Self {
            data: vec![0u8; state_size],
            advances: 0,
            saves: 0,
            loads: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        let mut tick = [0u8; 8];
        tick.copy_from_slice(&self.data[..8]);
        u64::from_le_bytes(tick)
    }

    /// Advances one tick, mixing `inputs` into the state.
    pub fn step(&mut self, inputs: &[u8]) {
        let tick = self.tick() + 1;
        self.data[..8].copy_from_slice(&tick.to_le_bytes());
        let seed = tick ^ (u64::from(fnv1a32(inputs)) << 24);
        let mut rng = Pcg32::seed_from_u64(seed);
        for byte in self.data[8..].iter_mut() {
            *byte = byte.wrapping_add((rng.next_u32() & 0xFF) as u8);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn checksum(&self) -> u32 {
        fnv1a32(&self.data)
    }
}

impl SimulationHandler for Sim {
    fn save_state(
        &mut self,
        _frame: Frame,
        mut scratch: Vec<u8>,
    ) -> Result<SaveOutput, SimulationRejected> {
        self.saves += 1;
        scratch.clear();
        scratch.extend_from_slice(&self.data);
        Ok(SaveOutput {
            checksum: fnv1a32(&scratch),
            bytes: scratch,
        })
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), SimulationRejected> {
        if state.len() != self.data.len() {
            return Err(SimulationRejected);
        }
        self.loads += 1;
        self.data.copy_from_slice(state);
        Ok(())
    }

    fn advance_frame(
        &mut self,
        inputs: &[u8],
        _disconnect_flags: u32,
    ) -> Result<(), SimulationRejected> {
        self.advances += 1;
        self.step(inputs);
        Ok(())
    }
}

/// A simulation whose state is fresh entropy every frame; nothing about
/// it is compressible and no two frames are related.
pub struct NoiseSim {
    rng: Pcg32,
    state: Vec<u8>,
}

impl NoiseSim {
    pub fn new(state_size: usize, seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut state = vec![0u8; state_size];
        rng.fill_bytes(&mut state);
        Self { rng, state }
    }

    pub fn step(&mut self) {
        self.rng.fill_bytes(&mut self.state);
    }
}

impl SimulationHandler for NoiseSim {
    fn save_state(
        &mut self,
        _frame: Frame,
        mut scratch: Vec<u8>,
    ) -> Result<SaveOutput, SimulationRejected> {
        scratch.clear();
        scratch.extend_from_slice(&self.state);
        Ok(SaveOutput {
            checksum: fnv1a32(&scratch),
            bytes: scratch,
        })
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), SimulationRejected> {
        if state.len() != self.state.len() {
            return Err(SimulationRejected);
        }
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
