//! Node-based GPU dataflow pipeline.
//!
//! Nodes exchange [`Message`]s describing GPU resources through typed ports.
//! The graph orders nodes topologically, runs them one after the other and
//! collects the results exported by sink nodes.
//!
//! # Architecture
//!
//! ```text
//! [ImageSource] ──► [Greyscale] ──► [CornerDetector] ──► [KeypointSink]
//!                              └──► [ImageBuffer] ──► [ImageSink]
//! ```
//!
//! # Design
//!
//! - **Static ports**: each node declares a `&'static [PortSpec]`; edges are
//!   checked when declared, messages when they are pulled.
//! - **Tombstones**: removed nodes leave an empty slot so `NodeId`s stay stable.
//! - **Cached plan**: the execution sequence is recomputed only after the
//!   graph changes.
//! - **Single-threaded**: nodes are `?Send` futures awaited in order; the only
//!   suspension points are pixel transfers.

pub mod compiled_plan;
mod compiler;
pub mod error;
pub mod graph;
pub mod id;
pub mod message;
pub mod node;
pub mod nodes;
pub mod output;
pub mod port;

pub use compiled_plan::{CompiledPlan, PlanStats};
pub use error::{PipelineError, PipelineResult};
pub use graph::{Edge, GraphState, PipelineGraph};
pub use id::{EdgeId, NodeId, PortRef};
pub use message::{ImageFormat, Message, MessageKind};
pub use node::{Node, NodeContext};
pub use nodes::{
    CornerDetectorNode, GreyscaleNode, ImageBufferNode, ImageFeed, ImageSinkNode, ImageSourceNode,
    KeypointSinkNode, Vector2SinkNode,
};
pub use output::{PipelineOutput, SinkOutput};
pub use port::{MessagePredicate, PortDirection, PortSpec, DEFAULT_INPUT, DEFAULT_OUTPUT};
