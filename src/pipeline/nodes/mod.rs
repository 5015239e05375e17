//! Built-in pipeline node implementations.

pub mod corner_detector;
pub mod greyscale;
pub mod image_buffer;
pub mod image_sink;
pub mod image_source;
pub mod keypoint_sink;
pub mod vector2_sink;

pub use corner_detector::CornerDetectorNode;
pub use greyscale::GreyscaleNode;
pub use image_buffer::ImageBufferNode;
pub use image_sink::ImageSinkNode;
pub use image_source::{ImageFeed, ImageSourceNode};
pub use keypoint_sink::KeypointSinkNode;
pub use vector2_sink::Vector2SinkNode;

use crate::gpu::{GpuError, KernelOutput, TextureHandle};
use crate::pipeline::error::PipelineError;

/// Error for a node whose GPU resources were never acquired.
fn not_initialized(node: &str) -> PipelineError {
    PipelineError::Node {
        node: node.to_string(),
        message: "node was run before init".to_string(),
    }
}

/// Texture of a kernel invocation that renders to a texture.
fn output_texture(output: KernelOutput) -> Result<TextureHandle, GpuError> {
    output
        .texture()
        .ok_or_else(|| GpuError::InvalidResource("kernel rendered to the display surface".to_string()))
}
