//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use visionflow::config::EngineConfig;
use visionflow::gpu::Gpu;

/// Software GPU with default settings
pub fn software_gpu() -> Gpu {
    software_gpu_with(&EngineConfig::default())
}

pub fn software_gpu_with(config: &EngineConfig) -> Gpu {
    Gpu::software(config).expect("software backend initializes")
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f32, b: f32, epsilon: f32) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
