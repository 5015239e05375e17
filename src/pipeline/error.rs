//! Pipeline-specific error types.

use crate::gpu::GpuError;
use thiserror::Error;

/// Errors raised while building, validating or running a pipeline graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("A node named \"{0}\" already exists in the pipeline")]
    DuplicateNode(String),

    #[error("Unknown node \"{0}\"")]
    UnknownNode(String),

    #[error("Node \"{node}\" has no port named \"{port}\"")]
    UnknownPort { node: String, port: String },

    #[error("Invalid port \"{node}.{port}\": {message}")]
    InvalidPort {
        node: String,
        port: String,
        message: String,
    },

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Port mismatch: {0}")]
    PortMismatch(String),

    #[error("Cycle detected in pipeline graph involving {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Input port \"{node}.{port}\" is not connected")]
    UnconnectedPort { node: String, port: String },

    #[error("Invalid message at \"{node}.{port}\": {message}")]
    InvalidMessage {
        node: String,
        port: String,
        message: String,
    },

    #[error("Node \"{node}\" did not write to its output port \"{port}\". Did you forget to write data?")]
    MissingOutput { node: String, port: String },

    #[error("No input data at \"{node}.{port}\"")]
    NoInput { node: String, port: String },

    #[error("The pipeline is already running")]
    Busy,

    #[error("The pipeline has no source node")]
    NoSource,

    #[error("The pipeline has no sink node")]
    NoSink,

    #[error("The pipeline has no nodes")]
    EmptyGraph,

    #[error("The pipeline has already been initialized")]
    AlreadyInitialized,

    #[error("Node \"{0}\" does not export data")]
    NotExportable(String),

    #[error("Node \"{node}\" failed: {message}")]
    Node { node: String, message: String },

    #[error(transparent)]
    Gpu(#[from] GpuError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
