//! CPU-side data types exchanged with the pipeline.
//!
//! # Main Types
//!
//! - [`ImageData`] - RGBA8 pixels fed into an image source or read by an image sink
//! - [`Vector2`] - A 2D vector decoded from a vector texture

use serde::{Deserialize, Serialize};
use std::fmt;

/// An RGBA8 image, rows top to bottom.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ImageData {
    /// Wrap RGBA bytes. Returns `None` if the length is not `width·height·4`
    /// or a dimension is zero.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Expand one byte per pixel into opaque grey RGBA.
    pub fn from_grey(width: u32, height: u32, grey: &[u8]) -> Option<Self> {
        if grey.len() != width as usize * height as usize {
            return None;
        }
        let pixels = grey.iter().flat_map(|&g| [g, g, g, 255]).collect();
        Self::from_rgba(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGBA value at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let texel: &[u8; 4] = bytemuck::from_bytes(&self.pixels[i..i + 4]);
        Some(*texel)
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        self.x.hypot(self.y)
    }
}
