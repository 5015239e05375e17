//! ImageSourceNode: uploads CPU pixels into the pipeline.
//!
//! The host keeps an [`ImageFeed`] and sets the frame to process; every run
//! uploads the current frame into a texture owned by the node.

use crate::gpu::{OwnedTexture, TextureHandle};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{ImageFormat, Message, MessageKind};
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::port::PortSpec;
use crate::types::ImageData;
use async_trait::async_trait;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

static PORTS: &[PortSpec] = &[PortSpec::output("out").expects(MessageKind::Image)];

/// Host-side handle for the frame uploaded by an [`ImageSourceNode`].
#[derive(Debug, Clone, Default)]
pub struct ImageFeed(Rc<RefCell<Option<ImageData>>>);

impl ImageFeed {
    /// Replace the frame uploaded by the next run.
    pub fn set(&self, image: ImageData) {
        *self.0.borrow_mut() = Some(image);
    }

    pub fn clear(&self) {
        self.0.borrow_mut().take();
    }

    pub fn has_frame(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Source node: uploads the frame of its [`ImageFeed`] on every run.
pub struct ImageSourceNode {
    name: String,
    feed: ImageFeed,
    texture: Option<OwnedTexture>,
    /// `texture` with the size of the last upload
    current: Option<TextureHandle>,
}

impl ImageSourceNode {
    pub fn new(name: impl Into<String>) -> (Self, ImageFeed) {
        let feed = ImageFeed::default();
        let node = Self {
            name: name.into(),
            feed: feed.clone(),
            texture: None,
            current: None,
        };
        (node, feed)
    }
}

#[async_trait(?Send)]
impl Node for ImageSourceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &'static [PortSpec] {
        PORTS
    }

    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
        let gpu = ctx.gpu().clone();

        if gpu.is_lost() {
            let stale = self.current.ok_or_else(|| PipelineError::Node {
                node: self.name.clone(),
                message: "GPU context lost before the first upload".to_string(),
            })?;
            trace!("Source {} skipped upload: context lost", self.name);
            return ctx.write_output(Message::image(stale, ImageFormat::Rgba));
        }

        let feed = self.feed.0.borrow();
        let image = feed.as_ref().ok_or_else(|| PipelineError::Node {
            node: self.name.clone(),
            message: "no image to upload".to_string(),
        })?;

        // textures of an older context generation are gone
        let texture = match self.texture.take() {
            Some(texture) if texture.handle().generation() == gpu.generation() => texture,
            _ => gpu.create_owned_texture(image.width(), image.height())?,
        };
        let uploaded = gpu.upload(&texture.handle(), image.width(), image.height(), image.pixels())?;
        self.texture = Some(texture);
        self.current = Some(uploaded);

        ctx.write_output(Message::image(uploaded, ImageFormat::Rgba))
    }

    fn release(&mut self) {
        self.texture = None;
        self.current = None;
    }
}
