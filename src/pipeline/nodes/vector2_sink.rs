//! Vector2SinkNode: reads a packed vector list back to the CPU.
//!
//! Decoding stops at the end sentinel or after the number of vectors the
//! message announces, whichever comes first.

use super::not_initialized;
use crate::codec;
use crate::config::ReaderSettings;
use crate::gpu::{AsyncReader, Gpu, GpuError};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{Message, MessageKind};
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::output::SinkOutput;
use crate::pipeline::port::PortSpec;
use crate::types::Vector2;
use async_trait::async_trait;
use tracing::warn;

static PORTS: &[PortSpec] = &[PortSpec::input("in").expects(MessageKind::Vector2)];

pub struct Vector2SinkNode {
    name: String,
    reader: Option<AsyncReader>,
    vectors: Vec<Vector2>,
}

impl Vector2SinkNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reader: None,
            vectors: Vec::new(),
        }
    }
}

#[async_trait(?Send)]
impl Node for Vector2SinkNode {
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
        let Message::Vector2 { texture, count } = ctx.input()? else {
            return Err(PipelineError::InvalidMessage {
                node: self.name.clone(),
                port: "in".to_string(),
                message: "expected a vector list".to_string(),
            });
        };
        let reader = self.reader.as_mut().ok_or_else(|| not_initialized(&self.name))?;

        match reader.read_async(&texture, None, false).await {
            Ok(bytes) => {
                let mut vectors = codec::decode_vectors(bytes, texture.width());
                vectors.truncate(count);
                self.vectors = vectors;
            }
            Err(GpuError::Timeout(details)) => {
                warn!("Vector sink {} timed out ({}), keeping stale vectors", self.name, details);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn release(&mut self) {
        self.reader = None;
    }

    async fn export(&mut self) -> PipelineResult<SinkOutput> {
        Ok(SinkOutput::Vectors(self.vectors.clone()))
    }
}
