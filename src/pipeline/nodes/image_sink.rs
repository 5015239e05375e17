//! ImageSinkNode: reads the RGBA pixels of an image back to the CPU.

use super::not_initialized;
use crate::config::ReaderSettings;
use crate::gpu::{AsyncReader, Gpu, GpuError};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::MessageKind;
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::output::SinkOutput;
use crate::pipeline::port::PortSpec;
use crate::types::ImageData;
use async_trait::async_trait;
use tracing::warn;

static PORTS: &[PortSpec] = &[PortSpec::input("in").expects(MessageKind::Image)];

pub struct ImageSinkNode {
    name: String,
    reader: Option<AsyncReader>,
    image: Option<ImageData>,
}

impl ImageSinkNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reader: None,
            image: None,
        }
    }
}

#[async_trait(?Send)]
impl Node for ImageSinkNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &'static [PortSpec] {
        PORTS
    }

    fn init(&mut self, gpu: &Gpu) -> PipelineResult<()> {
        self.reader = Some(AsyncReader::new(gpu, &ReaderSettings::default())?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let texture = ctx.input()?.texture();
        let reader = self.reader.as_mut().ok_or_else(|| not_initialized(&self.name))?;

        match reader.read_async(&texture, None, false).await {
            Ok(bytes) => {
                self.image = ImageData::from_rgba(texture.width(), texture.height(), bytes.to_vec());
            }
            Err(GpuError::Timeout(details)) if self.image.is_some() => {
                warn!("Image sink {} timed out ({}), keeping the stale image", self.name, details);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn release(&mut self) {
        self.reader = None;
    }

    async fn export(&mut self) -> PipelineResult<SinkOutput> {
        self.image
            .clone()
            .map(SinkOutput::Image)
            .ok_or_else(|| PipelineError::Node {
                node: self.name.clone(),
                message: "no image has been read".to_string(),
            })
    }
}
