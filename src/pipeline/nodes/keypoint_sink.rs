//! KeypointSinkNode: reads an encoded keypoint texture back to the CPU and
//! decodes it.
//!
//! In turbo mode the node uses the buffered reader: no run waits on its own
//! transfer, at the price of results that lag one run behind.

use super::not_initialized;
use crate::codec::{self, Keypoint, RecordLayout};
use crate::config::{EngineConfig, PyramidSettings, ReaderSettings};
use crate::gpu::{AsyncReader, Gpu, GpuError};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::output::SinkOutput;
use crate::pipeline::port::PortSpec;
use async_trait::async_trait;
use tracing::warn;

static PORTS: &[PortSpec] = &[PortSpec::input("in").expects(MessageKind::Keypoints)];

pub struct KeypointSinkNode {
    name: String,
    turbo: bool,
    reader_settings: ReaderSettings,
    pyramid: PyramidSettings,
    reader: Option<AsyncReader>,
    keypoints: Vec<Keypoint>,
}

impl KeypointSinkNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            turbo: false,
            reader_settings: ReaderSettings::default(),
            pyramid: PyramidSettings::default(),
            reader: None,
            keypoints: Vec::new(),
        }
    }

    /// Use the buffered reader
    pub fn turbo(mut self, enabled: bool) -> Self {
        self.turbo = enabled;
        self
    }

    /// Take reader and pyramid settings from an engine configuration.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.reader_settings = config.reader.clone();
        self.pyramid = config.pyramid;
        self
    }

    pub fn is_turbo(&self) -> bool {
        self.turbo
    }
}

#[async_trait(?Send)]
impl Node for KeypointSinkNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &'static [PortSpec] {
        PORTS
    }

    fn init(&mut self, gpu: &Gpu) -> PipelineResult<()> {
        self.reader = Some(AsyncReader::new(gpu, &self.reader_settings)?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let Message::Keypoints {
            texture,
            descriptor_size,
            extra_size,
            encoder_length,
        } = ctx.input()?
        else {
            return Err(PipelineError::InvalidMessage {
                node: self.name.clone(),
                port: "in".to_string(),
                message: "expected keypoints".to_string(),
            });
        };
        let layout = RecordLayout::new(descriptor_size, extra_size);
        let reader = self.reader.as_mut().ok_or_else(|| not_initialized(&self.name))?;

        match reader.read_async(&texture, None, self.turbo).await {
            Ok(bytes) => {
                self.keypoints = codec::decode(bytes, layout, encoder_length, encoder_length, &self.pyramid);
            }
            Err(GpuError::Timeout(details)) => {
                warn!("Keypoint sink {} timed out ({}), keeping stale keypoints", self.name, details);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn release(&mut self) {
        self.reader = None;
    }

    async fn export(&mut self) -> PipelineResult<SinkOutput> {
        Ok(SinkOutput::Keypoints(self.keypoints.clone()))
    }
}
