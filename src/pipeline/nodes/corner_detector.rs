//! CornerDetectorNode: detects corners in a greyscale image and encodes them
//! as a keypoint list.
//!
//! The response of each pixel is half the absolute 2×2 cross difference
//! `|a - b - c + d|` of its upper-left neighbourhood; pixels whose response
//! reaches the threshold become keypoints. The cornerness texture is then
//! packed by a [`KeypointEncoder`] sized for the node's capacity.

use super::{not_initialized, output_texture};
use crate::codec::{encoder_capacity, KeypointEncoder, RecordLayout, MAX_ENCODER_LENGTH};
use crate::config::EncoderSettings;
use crate::gpu::{Gpu, Kernel, KernelArg, KernelId, KernelOptions};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::port::PortSpec;
use async_trait::async_trait;
use tracing::trace;

static PORTS: &[PortSpec] = &[
    PortSpec::input("in")
        .expects(MessageKind::Image)
        .satisfying(Message::is_greyscale),
    PortSpec::output("out").expects(MessageKind::Keypoints),
];

/// Keypoints the encoder is sized for unless configured otherwise
pub const DEFAULT_CAPACITY: usize = 2048;

/// Response threshold unless configured otherwise
pub const DEFAULT_THRESHOLD: f32 = 0.1;

pub struct CornerDetectorNode {
    name: String,
    threshold: f32,
    capacity: usize,
    settings: EncoderSettings,
    layout: RecordLayout,
    kernel: Option<Kernel>,
    encoder: Option<KeypointEncoder>,
}

impl CornerDetectorNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threshold: DEFAULT_THRESHOLD,
            capacity: DEFAULT_CAPACITY,
            settings: EncoderSettings::default(),
            layout: RecordLayout::default(),
            kernel: None,
            encoder: None,
        }
    }

    /// Response threshold in `[0, 1]`
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.set_threshold(threshold);
        self
    }

    /// Maximum number of keypoints reported per run
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.set_capacity(capacity);
        self
    }

    pub fn with_encoder_settings(mut self, settings: EncoderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = if threshold.is_finite() {
            threshold.clamp(0.0, 1.0)
        } else {
            DEFAULT_THRESHOLD
        };
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clamped to what the largest encoder can hold.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.min(encoder_capacity(MAX_ENCODER_LENGTH, self.layout));
    }
}

#[async_trait(?Send)]
impl Node for CornerDetectorNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &'static [PortSpec] {
        PORTS
    }

    fn init(&mut self, gpu: &Gpu) -> PipelineResult<()> {
        self.kernel = Some(Kernel::compile(
            gpu,
            KernelId::CornerResponse.descriptor(),
            KernelOptions::new(),
        )?);
        self.encoder = Some(KeypointEncoder::new(gpu, &self.settings)?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let image = ctx.input()?.texture();
        let (Some(kernel), Some(encoder)) = (self.kernel.as_mut(), self.encoder.as_mut()) else {
            return Err(not_initialized(&self.name));
        };

        kernel.resize(image.width(), image.height())?;
        let corners = output_texture(kernel.invoke(&[KernelArg::from(image), KernelArg::from(self.threshold)])?)?;

        let encoder_length = encoder.optimize(self.capacity, self.layout);
        let encoded = encoder.encode_default(&corners, self.layout)?;
        trace!(
            "Detector {} encoded corners of a {}x{} image (encoder length {})",
            self.name,
            image.width(),
            image.height(),
            encoder_length
        );

        ctx.write_output(Message::keypoints(encoded, self.layout, encoder_length))
    }

    fn release(&mut self) {
        self.kernel = None;
        self.encoder = None;
    }
}
