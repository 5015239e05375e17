//! GreyscaleNode: converts an RGBA image to greyscale.

use super::{not_initialized, output_texture};
use crate::gpu::{Gpu, Kernel, KernelArg, KernelId, KernelOptions};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{ImageFormat, Message, MessageKind};
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::port::PortSpec;
use async_trait::async_trait;

static PORTS: &[PortSpec] = &[
    PortSpec::input("in").expects(MessageKind::Image),
    PortSpec::output("out").expects(MessageKind::Image),
];

pub struct GreyscaleNode {
    name: String,
    kernel: Option<Kernel>,
}

impl GreyscaleNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernel: None,
        }
    }
}

#[async_trait(?Send)]
impl Node for GreyscaleNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &'static [PortSpec] {
        PORTS
    }

    fn init(&mut self, gpu: &Gpu) -> PipelineResult<()> {
        self.kernel = Some(Kernel::compile(gpu, KernelId::Greyscale.descriptor(), KernelOptions::new())?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let image = ctx.input()?.texture();
        let kernel = self.kernel.as_mut().ok_or_else(|| not_initialized(&self.name))?;

        kernel.resize(image.width(), image.height())?;
        let output = output_texture(kernel.invoke(&[KernelArg::from(image)])?)?;

        ctx.write_output(Message::image(output, ImageFormat::Greyscale))
    }

    fn release(&mut self) {
        self.kernel = None;
    }
}
