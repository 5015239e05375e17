//! Messages carried by pipeline ports.
//!
//! A message describes a GPU resource owned by the node that wrote it. It is
//! valid until that node runs again; a node that needs a result across runs
//! must copy it into its own texture.

use crate::codec::RecordLayout;
use crate::gpu::TextureHandle;
use std::fmt;

/// Discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Image,
    Keypoints,
    Vector2,
    Matrix,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Image => "image",
            MessageKind::Keypoints => "keypoints",
            MessageKind::Vector2 => "vector2",
            MessageKind::Matrix => "matrix",
        };
        f.write_str(name)
    }
}

/// Pixel layout of an image message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba,
    Greyscale,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    Image {
        texture: TextureHandle,
        format: ImageFormat,
    },
    Keypoints {
        texture: TextureHandle,
        descriptor_size: usize,
        extra_size: usize,
        encoder_length: u32,
    },
    /// Packed list of 2D vectors
    Vector2 { texture: TextureHandle, count: usize },
    Matrix {
        texture: TextureHandle,
        rows: usize,
        columns: usize,
    },
}

impl Message {
    pub fn image(texture: TextureHandle, format: ImageFormat) -> Self {
        Message::Image { texture, format }
    }

    pub fn keypoints(texture: TextureHandle, layout: RecordLayout, encoder_length: u32) -> Self {
        Message::Keypoints {
            texture,
            descriptor_size: layout.descriptor_size,
            extra_size: layout.extra_size,
            encoder_length,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Image { .. } => MessageKind::Image,
            Message::Keypoints { .. } => MessageKind::Keypoints,
            Message::Vector2 { .. } => MessageKind::Vector2,
            Message::Matrix { .. } => MessageKind::Matrix,
        }
    }

    pub fn texture(&self) -> TextureHandle {
        match self {
            Message::Image { texture, .. }
            | Message::Keypoints { texture, .. }
            | Message::Vector2 { texture, .. }
            | Message::Matrix { texture, .. } => *texture,
        }
    }

    /// Record layout of a keypoint message
    pub fn layout(&self) -> Option<RecordLayout> {
        match self {
            Message::Keypoints {
                descriptor_size,
                extra_size,
                ..
            } => Some(RecordLayout::new(*descriptor_size, *extra_size)),
            _ => None,
        }
    }

    pub fn is_greyscale(&self) -> bool {
        matches!(
            self,
            Message::Image {
                format: ImageFormat::Greyscale,
                ..
            }
        )
    }
}
