//! End-to-end pipeline tests on the software backend

mod common;

use async_trait::async_trait;
use common::builders::{CheckerboardBuilder, DetectionPipelineBuilder};
use common::{assert_float_eq, software_gpu, software_gpu_with};
use visionflow::codec::{encode_vector, VECTOR_END_SENTINEL};
use visionflow::config::EngineConfig;
use visionflow::gpu::{Gpu, OwnedTexture};
use visionflow::pipeline::{
    GraphState, ImageBufferNode, ImageSinkNode, ImageSourceNode, Message, MessageKind, Node,
    NodeContext, PipelineError, PipelineGraph, PipelineResult, PortSpec, Vector2SinkNode,
};
use visionflow::types::{ImageData, Vector2};

fn positions(keypoints: &[visionflow::codec::Keypoint]) -> Vec<(u32, u32)> {
    keypoints
        .iter()
        .map(|k| (k.x.round() as u32, k.y.round() as u32))
        .collect()
}

#[test]
fn test_detects_checkerboard_corners() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);
    let board = CheckerboardBuilder::new(8, 8);
    let expected = board.corners();
    pipeline.feed.set(board.build());

    assert_eq!(
        pipeline.graph.sequence().unwrap(),
        vec!["image", "greyscale", "corners", "keypoints"]
    );

    let output = pipeline.graph.run_blocking().unwrap();
    let keypoints = output.keypoints("keypoints").unwrap();

    assert_eq!(positions(keypoints), expected);
    for keypoint in keypoints {
        assert_float_eq(keypoint.lod, 0.0, 1e-6);
        assert_float_eq(keypoint.scale, 1.0, 1e-6);
        assert_float_eq(keypoint.score, 1.0, 1e-6);
        assert!(keypoint.descriptor.is_empty());
    }
    assert_eq!(pipeline.graph.state(), GraphState::Built);
}

#[test]
fn test_threshold_filters_weak_corners() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().threshold(0.9).build(&gpu);
    // light cells at 50% grey give a response well under the threshold
    pipeline
        .feed
        .set(CheckerboardBuilder::new(8, 8).light([128, 128, 128]).build());

    let output = pipeline.graph.run_blocking().unwrap();
    assert!(output.keypoints("keypoints").unwrap().is_empty());
}

#[test]
fn test_missing_frame_fails_the_run() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);

    let err = pipeline.graph.run_blocking().unwrap_err();
    assert!(err.to_string().contains("no image to upload"));
    assert_eq!(pipeline.graph.state(), GraphState::Built);
}

#[test]
fn test_context_loss_returns_stale_results() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());

    let before = pipeline.graph.run_blocking().unwrap();
    assert_eq!(before.keypoints("keypoints").unwrap().len(), 4);

    gpu.lose_context().unwrap();
    // a different frame must not reach the GPU while the context is gone
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).cell(2).build());
    let during = pipeline.graph.run_blocking().unwrap();
    assert_eq!(during, before);

    gpu.restore_context().unwrap();
    assert_eq!(gpu.generation(), 1);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());
    let after = pipeline.graph.run_blocking().unwrap();
    assert_eq!(after, before);
}

#[test]
fn test_resources_follow_restored_context() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());
    pipeline.graph.run_blocking().unwrap();

    gpu.lose_context().unwrap();
    gpu.restore_context().unwrap();

    let board = CheckerboardBuilder::new(12, 12).cell(4);
    let expected = board.corners();
    pipeline.feed.set(board.build());
    let output = pipeline.graph.run_blocking().unwrap();
    assert_eq!(positions(output.keypoints("keypoints").unwrap()), expected);
}

static PASS_THROUGH_PORTS: &[PortSpec] = &[
    PortSpec::input("in").expects(MessageKind::Image),
    PortSpec::output("out").expects(MessageKind::Image),
];

/// Forwards its input and drops the GPU context on the chosen runs.
struct ContextDropper {
    runs: Vec<usize>,
    count: usize,
}

impl ContextDropper {
    fn on_runs(runs: &[usize]) -> Self {
        Self {
            runs: runs.to_vec(),
            count: 0,
        }
    }
}

#[async_trait(?Send)]
impl Node for ContextDropper {
    fn name(&self) -> &str {
        "dropper"
    }

    fn ports(&self) -> &'static [PortSpec] {
        PASS_THROUGH_PORTS
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let message = ctx.input()?;
        if self.runs.contains(&self.count) {
            ctx.gpu().lose_context()?;
        }
        self.count += 1;
        ctx.write_output(message)
    }
}

fn keypoint_count(output: &visionflow::pipeline::PipelineOutput) -> usize {
    output.keypoints("keypoints").map_or(0, <[_]>::len)
}

#[test]
fn test_context_lost_during_first_run() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new()
        .splice(ContextDropper::on_runs(&[0]))
        .build(&gpu);
    let board = CheckerboardBuilder::new(8, 8);
    let expected = board.corners();
    pipeline.feed.set(board.build());
    assert_eq!(
        pipeline.graph.sequence().unwrap(),
        vec!["image", "greyscale", "dropper", "corners", "keypoints"]
    );

    // nothing was read back yet, so the stale result is empty
    let during = pipeline.graph.run_blocking().unwrap();
    assert!(gpu.is_lost());
    assert_eq!(keypoint_count(&during), 0);

    gpu.restore_context().unwrap();
    let after = pipeline.graph.run_blocking().unwrap();
    assert_eq!(positions(after.keypoints("keypoints").unwrap()), expected);
}

#[test]
fn test_context_lost_during_later_run() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new()
        .splice(ContextDropper::on_runs(&[1]))
        .build(&gpu);
    let board = CheckerboardBuilder::new(8, 8);
    let expected = board.corners();
    pipeline.feed.set(board.build());

    let before = pipeline.graph.run_blocking().unwrap();
    assert_eq!(keypoint_count(&before), 4);

    let during = pipeline.graph.run_blocking().unwrap();
    assert!(gpu.is_lost());
    assert_eq!(during, before);

    gpu.restore_context().unwrap();
    let after = pipeline.graph.run_blocking().unwrap();
    assert_eq!(positions(after.keypoints("keypoints").unwrap()), expected);
}

#[test]
fn test_context_lost_during_turbo_run() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new()
        .turbo(true)
        .splice(ContextDropper::on_runs(&[2]))
        .build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());

    let counts: Vec<usize> = (0..3)
        .map(|_| keypoint_count(&pipeline.graph.run_blocking().unwrap()))
        .collect();
    // one frame of lag, then the loss repeats the last completed transfer
    assert_eq!(counts, vec![0, 4, 4]);
    assert!(gpu.is_lost());

    gpu.restore_context().unwrap();
    // the transfer in flight at the loss never completed
    let restored = pipeline.graph.run_blocking().unwrap();
    assert_eq!(keypoint_count(&restored), 0);
    let caught_up = pipeline.graph.run_blocking().unwrap();
    assert_eq!(keypoint_count(&caught_up), 4);
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());

    let mut run = Box::pin(pipeline.graph.run());
    assert!(futures::poll!(run.as_mut()).is_pending());
    // abandon the run without dropping it: the graph stays busy
    std::mem::forget(run);

    assert_eq!(pipeline.graph.state(), GraphState::Running);
    let err = pipeline.graph.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Busy));
}

#[tokio::test]
async fn test_dropped_run_frees_the_graph() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());

    {
        let mut run = Box::pin(pipeline.graph.run());
        assert!(futures::poll!(run.as_mut()).is_pending());
    }

    assert_eq!(pipeline.graph.state(), GraphState::Built);
    let output = pipeline.graph.run().await.unwrap();
    assert_eq!(output.keypoints("keypoints").unwrap().len(), 4);
}

#[test]
fn test_turbo_sink_lags_one_frame() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().turbo(true).build(&gpu);
    let board = CheckerboardBuilder::new(8, 8);
    let expected = board.corners();
    pipeline.feed.set(board.build());

    let first = pipeline.graph.run_blocking().unwrap();
    assert!(first.keypoints("keypoints").unwrap().is_empty());

    let second = pipeline.graph.run_blocking().unwrap();
    assert_eq!(positions(second.keypoints("keypoints").unwrap()), expected);
}

#[test]
fn test_polling_once_per_frame() {
    let mut config = EngineConfig::default();
    config.gpu.polling = visionflow::config::PollingStrategy::PerFrame;
    config.gpu.fence_latency = 2;
    let gpu = software_gpu_with(&config);
    let mut pipeline = DetectionPipelineBuilder::new().config(config).build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());

    let output = pipeline.graph.run_blocking().unwrap();
    assert_eq!(output.keypoints("keypoints").unwrap().len(), 4);
}

fn solid(width: u32, height: u32, value: u8) -> ImageData {
    ImageData::from_rgba(width, height, vec![value; (width * height * 4) as usize]).unwrap()
}

#[test]
fn test_image_buffer_delays_by_one_frame() {
    let gpu = software_gpu();
    let (source, feed) = ImageSourceNode::new("camera");
    let mut graph = PipelineGraph::new(&gpu);
    graph
        .init([
            Box::new(source) as Box<dyn Node>,
            Box::new(ImageBufferNode::new("buffer")),
            Box::new(ImageSinkNode::new("previous")),
        ])
        .unwrap();
    graph.link("camera", "buffer").unwrap();
    graph.link("buffer", "previous").unwrap();

    let frames = [solid(4, 4, 10), solid(4, 4, 20), solid(4, 4, 30)];
    let mut seen = Vec::new();
    for frame in &frames {
        feed.set(frame.clone());
        let output = graph.run_blocking().unwrap();
        seen.push(output.image("previous").unwrap().clone());
    }

    assert_eq!(seen, vec![frames[0].clone(), frames[0].clone(), frames[1].clone()]);
}

#[test]
fn test_image_buffer_resets_on_resize() {
    let gpu = software_gpu();
    let (source, feed) = ImageSourceNode::new("camera");
    let mut graph = PipelineGraph::new(&gpu);
    graph.add(source).unwrap();
    graph.add(ImageBufferNode::new("buffer")).unwrap();
    graph.add(ImageSinkNode::new("previous")).unwrap();
    graph.link("camera", "buffer").unwrap();
    graph.link("buffer", "previous").unwrap();

    feed.set(solid(4, 4, 10));
    graph.run_blocking().unwrap();

    let resized = solid(6, 2, 40);
    feed.set(resized.clone());
    let output = graph.run_blocking().unwrap();
    assert_eq!(output.image("previous"), Some(&resized));
}

static VECTOR_PORTS: &[PortSpec] = &[PortSpec::output("out").expects(MessageKind::Vector2)];

/// Uploads a fixed vector list as a packed 2×2 texture.
struct VectorSource {
    vectors: Vec<Vector2>,
    /// Count announced in the message, if different from the list length
    announced: Option<usize>,
    texture: Option<OwnedTexture>,
}

#[async_trait(?Send)]
impl Node for VectorSource {
    fn name(&self) -> &str {
        "flow"
    }

    fn ports(&self) -> &'static [PortSpec] {
        VECTOR_PORTS
    }

    fn init(&mut self, gpu: &Gpu) -> PipelineResult<()> {
        self.texture = Some(gpu.create_owned_texture(2, 2)?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let mut pixels: Vec<u8> = self.vectors.iter().flat_map(|v| encode_vector(*v)).collect();
        pixels.resize(16, 0xFF);
        assert_eq!(&pixels[12..], &VECTOR_END_SENTINEL.to_le_bytes());

        let texture = self.texture.as_ref().unwrap().handle();
        let texture = ctx.gpu().upload(&texture, 2, 2, &pixels)?;
        ctx.write_output(Message::Vector2 {
            texture,
            count: self.announced.unwrap_or(self.vectors.len()),
        })
    }

    fn release(&mut self) {
        self.texture = None;
    }
}

#[test]
fn test_vector_sink_reads_packed_list() {
    let gpu = software_gpu();
    let vectors = vec![
        Vector2::new(1.5, -2.0),
        Vector2::new(0.25, 8.0),
        Vector2::new(-0.5, 0.0),
    ];
    let mut graph = PipelineGraph::new(&gpu);
    graph
        .add(VectorSource {
            vectors: vectors.clone(),
            announced: None,
            texture: None,
        })
        .unwrap();
    graph.add(Vector2SinkNode::new("vectors")).unwrap();
    graph.link("flow", "vectors").unwrap();

    let output = graph.run_blocking().unwrap();
    assert_eq!(output.vectors("vectors").unwrap(), vectors.as_slice());
}

#[test]
fn test_vector_sink_stops_at_announced_count() {
    let gpu = software_gpu();
    let vectors = vec![
        Vector2::new(1.5, -2.0),
        Vector2::new(0.25, 8.0),
        Vector2::new(-0.5, 0.0),
    ];
    let mut graph = PipelineGraph::new(&gpu);
    graph
        .add(VectorSource {
            vectors: vectors.clone(),
            announced: Some(2),
            texture: None,
        })
        .unwrap();
    graph.add(Vector2SinkNode::new("vectors")).unwrap();
    graph.link("flow", "vectors").unwrap();

    let output = graph.run_blocking().unwrap();
    assert_eq!(output.vectors("vectors").unwrap(), &vectors[..2]);
}

#[test]
fn test_vector_sink_rejects_images() {
    let gpu = software_gpu();
    let (source, _feed) = ImageSourceNode::new("camera");
    let mut graph = PipelineGraph::new(&gpu);
    graph.add(source).unwrap();
    graph.add(Vector2SinkNode::new("vectors")).unwrap();

    let err = graph.link("camera", "vectors").unwrap_err();
    assert!(matches!(err, PipelineError::PortMismatch(_)));
}

#[test]
fn test_output_serializes_to_json() {
    let gpu = software_gpu();
    let mut pipeline = DetectionPipelineBuilder::new().build(&gpu);
    pipeline.feed.set(CheckerboardBuilder::new(8, 8).build());

    let output = pipeline.graph.run_blocking().unwrap();
    let json = output.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["keypoints"]["type"], "keypoints");
    assert_eq!(value["keypoints"]["data"].as_array().unwrap().len(), 4);
    assert_eq!(value["keypoints"]["data"][0]["x"], 3.0);
}
