//! GPU-layer error types.

use crate::gpu::context::ContextState;
use thiserror::Error;

/// Errors raised by the backend, kernels, the shader preprocessor and the reader.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    #[error("GPU context is not ready (state: {0:?})")]
    NotReady(ContextState),

    #[error("GPU context lost")]
    ContextLost,

    #[error("GPU initialization failed: {0}")]
    InitializationFailed(String),

    /// Composite message: line-numbered source followed by the compiler log
    #[error("Can't compile shader {name}:\n{details}")]
    ShaderCompilation { name: String, details: String },

    #[error("Shader preprocessing error: {0}")]
    Preprocessor(String),

    #[error("Uniform mismatch in kernel {kernel}: {message}")]
    UniformMismatch { kernel: String, message: String },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Invalid kernel dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Invalid GPU resource: {0}")]
    InvalidResource(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Fence wait failed")]
    WaitFailed,

    #[error("Not supported: {0}")]
    NotSupported(String),
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;
