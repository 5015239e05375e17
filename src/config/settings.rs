//! Tunable settings for the GPU layer, the transfer subsystem and the
//! keypoint encoder.
//!
//! # Main Types
//!
//! - [`GpuSettings`] - Fence polling and backend limits
//! - [`ReaderSettings`] - Pixel-buffer ring size
//! - [`EncoderSettings`] - Keypoint encoder sizing and offset chain cap
//! - [`PyramidSettings`] - Pyramid constants used to decode keypoint scales
//!
//! # Fence Polling
//!
//! Asynchronous reads poll a GPU fence until it signals. [`PollingStrategy::Asap`]
//! yields to the executor between polls, [`PollingStrategy::PerFrame`] waits one
//! frame interval. Either way the number of polls is bounded by
//! [`GpuSettings::max_fence_attempts`].

use crate::codec::{INITIAL_ENCODER_LENGTH, MAX_ENCODER_LENGTH};
use crate::constants::{MAX_TEXTURE_LENGTH, PYRAMID_MAX_LEVELS, PYRAMID_MAX_SCALE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default frame interval for per-frame polling (60 Hz)
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Default bound on fence polls before a read times out
pub const DEFAULT_MAX_FENCE_ATTEMPTS: u32 = 240;

/// Default number of slots in the buffered reader ring
pub const DEFAULT_READER_BUFFERS: usize = 2;

/// Default cap on the forward offset chain
pub const DEFAULT_MAX_CHAIN_STEPS: u32 = 32;

/// How the reader waits between fence polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PollingStrategy {
    /// Yield to the executor and poll again immediately
    #[default]
    Asap,
    /// Poll once per frame interval
    PerFrame,
}

/// Settings consumed by [`crate::gpu::Gpu`] and the async reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Fence polling strategy
    pub polling: PollingStrategy,

    /// Frame interval used by [`PollingStrategy::PerFrame`], in milliseconds
    pub frame_interval_ms: u64,

    /// Maximum number of fence polls before a read fails with a timeout
    pub max_fence_attempts: u32,

    /// Largest texture side a backend accepts (capped by the driver limit on GL)
    pub max_texture_size: u32,

    /// Number of polls before a software fence signals
    pub fence_latency: u32,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            polling: PollingStrategy::default(),
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            max_fence_attempts: DEFAULT_MAX_FENCE_ATTEMPTS,
            max_texture_size: 4096.min(MAX_TEXTURE_LENGTH),
            fence_latency: 1,
        }
    }
}

impl GpuSettings {
    /// Frame interval as a [`Duration`]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Settings for the buffered pixel reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    /// Number of slots in the producer/consumer ring (at least 2)
    pub buffers: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            buffers: DEFAULT_READER_BUFFERS,
        }
    }
}

/// Settings for keypoint encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Encoder length used before the first resize
    pub initial_length: u32,

    /// Cap on the forward offset chain written by the first encoding pass
    pub max_chain_steps: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            initial_length: INITIAL_ENCODER_LENGTH,
            max_chain_steps: DEFAULT_MAX_CHAIN_STEPS,
        }
    }
}

impl EncoderSettings {
    /// Chain cap clamped to what fits in one byte
    pub fn chain_cap(&self) -> u32 {
        self.max_chain_steps.clamp(1, 255)
    }

    /// Initial length clamped to the encoder limits
    pub fn clamped_initial_length(&self) -> u32 {
        self.initial_length.clamp(1, MAX_ENCODER_LENGTH)
    }
}

/// Pyramid constants used when decoding keypoint scales
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidSettings {
    /// Maximum number of pyramid levels (`H`)
    pub max_levels: u32,

    /// Maximum pyramid scale (`M`)
    pub max_scale: f32,
}

impl Default for PyramidSettings {
    fn default() -> Self {
        Self {
            max_levels: PYRAMID_MAX_LEVELS,
            max_scale: PYRAMID_MAX_SCALE,
        }
    }
}
