//! # visionflow: GPU dataflow engine for computer vision
//!
//! A pipeline of typed nodes runs compute kernels on a GPU backend and brings
//! the results back to the CPU through fenced, optionally double-buffered,
//! pixel transfers. Sparse results such as keypoints are packed on the GPU
//! into a compact record texture before they cross that boundary.
//!
//! ## Architecture
//!
//! - **GPU** ([`gpu`]): backend seam, explicit context with loss/restore
//!   notifications, shader preprocessing, compiled [`gpu::Kernel`]s and the
//!   [`gpu::AsyncReader`].
//! - **Codec** ([`codec`]): keypoint record layout, the two-pass GPU encoder
//!   and the CPU decoder.
//! - **Pipeline** ([`pipeline`]): node graph, topological scheduler and the
//!   built-in nodes.
//! - **Configuration** ([`config`]): TOML-backed [`config::EngineConfig`].
//!
//! ## Example
//!
//! ```ignore
//! use visionflow::{
//!     config::EngineConfig,
//!     gpu::Gpu,
//!     pipeline::{CornerDetectorNode, GreyscaleNode, ImageSourceNode, KeypointSinkNode, PipelineGraph},
//!     types::ImageData,
//! };
//!
//! fn main() -> visionflow::Result<()> {
//!     let config = EngineConfig::default();
//!     let gpu = Gpu::software(&config)?;
//!
//!     let (source, feed) = ImageSourceNode::new("image");
//!     let mut graph = PipelineGraph::new(&gpu);
//!     graph.init([
//!         Box::new(source) as Box<dyn visionflow::pipeline::Node>,
//!         Box::new(GreyscaleNode::new("greyscale")),
//!         Box::new(CornerDetectorNode::new("corners").with_threshold(0.2)),
//!         Box::new(KeypointSinkNode::new("keypoints").with_config(&config)),
//!     ])?;
//!     graph.link("image", "greyscale")?;
//!     graph.link("greyscale", "corners")?;
//!     graph.link("corners", "keypoints")?;
//!
//!     feed.set(ImageData::from_rgba(640, 480, vec![0; 640 * 480 * 4]).unwrap());
//!     let output = graph.run_blocking()?;
//!     println!("{}", output.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod pipeline;
pub mod types;

pub use error::{Result, ResultExt, VisionError};
