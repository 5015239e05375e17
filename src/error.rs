//! Error handling for the visionflow engine
//!
//! Each subsystem has its own error enum ([`GpuError`], [`PipelineError`]);
//! this module defines the crate-level error that wraps them together with
//! configuration and I/O failures, and a Result alias for use throughout.

use crate::gpu::GpuError;
use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for visionflow operations
#[derive(Error, Debug)]
pub enum VisionError {
    /// Errors raised by the GPU layer (kernels, transfers, context)
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Errors raised while building or running a pipeline graph
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<VisionError>,
    },
}

impl VisionError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        VisionError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for VisionError {
    fn from(err: serde_json::Error) -> Self {
        VisionError::Serialization(err.to_string())
    }
}

/// Result type alias for visionflow operations
pub type Result<T> = std::result::Result<T, VisionError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<VisionError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VisionError::Config("missing [gpu] section".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing [gpu] section");
    }

    #[test]
    fn test_error_with_context() {
        let err = VisionError::Config("test".to_string());
        let with_ctx = err.with_context("Failed to load engine config");
        assert!(with_ctx.to_string().contains("Failed to load engine config"));
    }

    #[test]
    fn test_subsystem_errors_convert() {
        let gpu: Result<()> = Err(GpuError::ContextLost).context("reading keypoints");
        let err = gpu.unwrap_err();
        assert!(err.to_string().starts_with("reading keypoints"));

        let pipeline: VisionError = PipelineError::CycleDetected(vec!["a".into()]).into();
        assert!(matches!(pipeline, VisionError::Pipeline(_)));
    }
}
