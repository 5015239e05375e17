//! ImageBufferNode: delays an image stream by one run.
//!
//! Each run copies the input into one page of a page-flipped texture pair and
//! outputs the other page, which holds the frame of the previous run. The very
//! first run (and the first run after a resize or a context restore) outputs
//! the current frame.

use super::{not_initialized, output_texture};
use crate::gpu::{Gpu, Kernel, KernelArg, KernelId, KernelOptions, TextureHandle};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::message::{ImageFormat, Message, MessageKind};
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::port::PortSpec;
use async_trait::async_trait;

static PORTS: &[PortSpec] = &[
    PortSpec::input("in").expects(MessageKind::Image),
    PortSpec::output("out").expects(MessageKind::Image),
];

pub struct ImageBufferNode {
    name: String,
    kernel: Option<Kernel>,
    /// Page written by the previous run and its format
    previous: Option<(TextureHandle, ImageFormat)>,
}

impl ImageBufferNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernel: None,
            previous: None,
        }
    }
}

#[async_trait(?Send)]
impl Node for ImageBufferNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &'static [PortSpec] {
        PORTS
    }

    fn init(&mut self, gpu: &Gpu) -> PipelineResult<()> {
        let options = KernelOptions::new().pingpong(true);
        self.kernel = Some(Kernel::compile(gpu, KernelId::Identity.descriptor(), options)?);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let input = ctx.input()?;
        let texture = input.texture();
        let format = if input.is_greyscale() {
            ImageFormat::Greyscale
        } else {
            ImageFormat::Rgba
        };
        let generation = ctx.gpu().generation();
        let kernel = self.kernel.as_mut().ok_or_else(|| not_initialized(&self.name))?;

        // a resize or a restore reallocates both pages
        if kernel.size() != texture.size() || self.previous.is_some_and(|(t, _)| t.generation() != generation) {
            self.previous = None;
        }
        kernel.resize(texture.width(), texture.height())?;
        let stored = output_texture(kernel.invoke(&[KernelArg::from(texture)])?)?;

        let (output, output_format) = self.previous.replace((stored, format)).unwrap_or((stored, format));
        ctx.write_output(Message::image(output, output_format))
    }

    fn release(&mut self) {
        self.kernel = None;
        self.previous = None;
    }
}
