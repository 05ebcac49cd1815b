//! Engine configuration.

use crate::{VaultError, VaultResult, MAX_INPUT_BYTES, MAX_PREDICTION_FRAMES};

/// Environment variable consulted for the LZ4 acceleration factor when
/// [`SyncConfig::lz4_accel`] is left non-positive.
pub const LZ4_ACCEL_ENV: &str = "FRAMEVAULT_LZ4_ACCEL";

/// Default LZ4 acceleration when neither config nor environment supply one.
pub const DEFAULT_LZ4_ACCEL: i32 = 2;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
///
/// ```
/// use framevault::SyncConfig;
///
/// let config = SyncConfig::new(2, 4);
/// assert_eq!(config.num_players, 2);
/// assert_eq!(config.num_prediction_frames, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of players contributing input. One input queue is created per
    /// player. At most 32 (disconnect flags are a `u32` bitmask).
    pub num_players: usize,
    /// Size in bytes of a single player's input for one frame.
    pub input_size: usize,
    /// How many frames the simulation may run ahead of the last confirmed
    /// remote frame. At most [`MAX_PREDICTION_FRAMES`].
    pub num_prediction_frames: usize,
    /// LZ4 acceleration factor, passed through to the codec. Values `<= 0`
    /// fall back to the [`LZ4_ACCEL_ENV`] environment variable, then to
    /// [`DEFAULT_LZ4_ACCEL`].
    pub lz4_accel: i32,
    /// Whether snapshot compression runs on a background worker thread.
    /// Off, compression happens inline during the save.
    pub async_compress: bool,
}

impl SyncConfig {
    /// Creates a configuration with the default prediction window,
    /// environment-resolved LZ4 acceleration and inline compression.
    #[must_use]
    pub fn new(num_players: usize, input_size: usize) -> Self {
        Self {
            num_players,
            input_size,
            num_prediction_frames: MAX_PREDICTION_FRAMES,
            lz4_accel: 0,
            async_compress: false,
        }
    }

    /// Validates the configuration, returning it unchanged on success.
    pub(crate) fn validated(self) -> VaultResult<Self> {
        if self.num_players == 0 || self.num_players > 32 {
            return Err(VaultError::InvalidRequest {
                info: format!("num_players must be in 1..=32, got {}", self.num_players),
            });
        }
        if self.input_size == 0 || self.input_size > MAX_INPUT_BYTES {
            return Err(VaultError::InvalidRequest {
                info: format!(
                    "input_size must be in 1..={}, got {}",
                    MAX_INPUT_BYTES, self.input_size
                ),
            });
        }
        if self.num_prediction_frames == 0 || self.num_prediction_frames > MAX_PREDICTION_FRAMES {
            return Err(VaultError::InvalidRequest {
                info: format!(
                    "num_prediction_frames must be in 1..={}, got {}",
                    MAX_PREDICTION_FRAMES, self.num_prediction_frames
                ),
            });
        }
        Ok(self)
    }

    /// Resolves the effective LZ4 acceleration: the configured value if
    /// positive, else the environment variable, else the default.
    #[must_use]
    pub fn resolved_lz4_accel(&self) -> i32 {
        if self.lz4_accel > 0 {
            return self.lz4_accel;
        }
        lz4_accel_from_env().unwrap_or(DEFAULT_LZ4_ACCEL)
    }
}

/// Reads a positive LZ4 acceleration factor from the environment, if set.
fn lz4_accel_from_env() -> Option<i32> {
    let raw = std::env::var(LZ4_ACCEL_ENV).ok()?;
    let value = raw.trim().parse::<i32>().ok()?;
    (value > 0).then_some(value)
}

// #########
// # TESTS #
// #########
