//! Sparse keypoint encoding protocol.
//!
//! A detector produces a "cornerness" texture where most pixels are zero.
//! [`KeypointEncoder`] packs the non-zero pixels into a small square texture of
//! fixed-stride records, which is the only thing that crosses the GPU→CPU
//! boundary; [`decode`] turns the bytes read back into [`Keypoint`]s.
//!
//! # Record layout
//!
//! Each record is `2 + ceil((descriptorSize + extraSize) / 4)` RGBA pixels:
//!
//! ```text
//! pixel 0   x (u16 LE) | y (u16 LE)      fixed point, FIX_BITS fractional bits
//! pixel 1   lod byte | rotation byte | score byte | 0
//! pixel 2.. extra bytes, then descriptor bytes, zero padded
//! ```
//!
//! A record whose first pixel is `0xFFFFFFFF` terminates the list. A record
//! whose 8-byte header is all zero has been discarded: it is skipped, and the
//! records after it are still decoded.

mod encoder;
mod vectors;

pub use encoder::KeypointEncoder;
pub use vectors::{decode_vectors, encode_vector, VECTOR_DISCARD_SENTINEL, VECTOR_END_SENTINEL};

use crate::config::PyramidSettings;
use crate::constants::FIX_RESOLUTION;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Size of the record header in bytes (position + properties)
pub const MIN_KEYPOINT_SIZE: usize = 8;

/// Largest descriptor the encoder can carry, in bytes
pub const MAX_DESCRIPTOR_SIZE: usize = 64;

/// Smallest encoder length
pub const MIN_ENCODER_LENGTH: u32 = 1;

/// Largest encoder length
pub const MAX_ENCODER_LENGTH: u32 = 300;

/// Encoder length used before the first resize
pub const INITIAL_ENCODER_LENGTH: u32 = 16;

/// End-of-list pixel value
pub const END_SENTINEL: u32 = 0xFFFF_FFFF;

/// Header of a discarded record
pub const DISCARD_HEADER: [u8; MIN_KEYPOINT_SIZE] = [0; MIN_KEYPOINT_SIZE];

/// Fixed slack added to the expected keypoint count when sizing the encoder
const ENCODER_SLACK: usize = 4;

/// Per-record sizes of an encoded keypoint stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordLayout {
    pub descriptor_size: usize,
    pub extra_size: usize,
}

impl RecordLayout {
    pub const fn new(descriptor_size: usize, extra_size: usize) -> Self {
        Self {
            descriptor_size,
            extra_size,
        }
    }

    /// `2 + ceil((descriptor + extra) / 4)`
    pub const fn pixels_per_record(&self) -> usize {
        2 + (self.descriptor_size + self.extra_size).div_ceil(4)
    }

    pub const fn bytes_per_record(&self) -> usize {
        4 * self.pixels_per_record()
    }
}

/// A decoded keypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level of detail
    pub lod: f32,
    /// `2^lod`
    pub scale: f32,
    /// Orientation in radians, in `[0, 2π]`
    pub rotation: f32,
    /// Score in `[0, 1]`
    pub score: f32,
    pub extra: Vec<u8>,
    pub descriptor: Vec<u8>,
}

/// Encode a position as the first pixel of a record.
pub fn encode_position(x: f32, y: f32) -> [u8; 4] {
    let fx = (x * FIX_RESOLUTION as f32).round().clamp(0.0, 65534.0) as u16;
    let fy = (y * FIX_RESOLUTION as f32).round().clamp(0.0, 65534.0) as u16;
    let [x0, x1] = fx.to_le_bytes();
    let [y0, y1] = fy.to_le_bytes();
    [x0, x1, y0, y1]
}

/// Quantize a level of detail into a byte.
pub fn encode_lod(lod: f32, pyramid: &PyramidSettings) -> u8 {
    let log2_m = pyramid.max_scale.log2();
    let range = log2_m + pyramid.max_levels as f32;
    (255.0 * (lod + log2_m) / range).round().clamp(0.0, 255.0) as u8
}

/// Inverse of [`encode_lod`]: `-log2(M) + (log2(M) + H) · byte / 255`.
pub fn decode_lod(byte: u8, pyramid: &PyramidSettings) -> f32 {
    let log2_m = pyramid.max_scale.log2();
    -log2_m + (log2_m + pyramid.max_levels as f32) * byte as f32 / 255.0
}

/// Quantize an angle (radians, any range) into a byte.
pub fn encode_rotation(radians: f32) -> u8 {
    let turn = radians.rem_euclid(2.0 * PI) / (2.0 * PI);
    (turn * 255.0).round() as u8
}

/// `byte · 2π / 255`
pub fn decode_rotation(byte: u8) -> f32 {
    byte as f32 * 2.0 * PI / 255.0
}

/// Decode the records of an encoder texture.
///
/// Scans at most `encoder_width × encoder_height` pixels of `bytes`.
pub fn decode(
    bytes: &[u8],
    layout: RecordLayout,
    encoder_width: u32,
    encoder_height: u32,
    pyramid: &PyramidSettings,
) -> Vec<Keypoint> {
    let stride = layout.bytes_per_record();
    let size = bytes
        .len()
        .min(encoder_width as usize * encoder_height as usize * 4);
    let mut keypoints = Vec::new();

    for record in bytes[..size].chunks(stride) {
        if record.len() >= 4 && u32::from_le_bytes([record[0], record[1], record[2], record[3]]) == END_SENTINEL {
            break;
        }
        if record.len() < stride {
            break;
        }
        if record[..MIN_KEYPOINT_SIZE] == DISCARD_HEADER {
            continue;
        }

        let x = u16::from_le_bytes([record[0], record[1]]) as f32 / FIX_RESOLUTION as f32;
        let y = u16::from_le_bytes([record[2], record[3]]) as f32 / FIX_RESOLUTION as f32;
        let lod = decode_lod(record[4], pyramid);
        let body = &record[MIN_KEYPOINT_SIZE..];
        let extra = body[..layout.extra_size].to_vec();
        let descriptor = body[layout.extra_size..layout.extra_size + layout.descriptor_size].to_vec();

        keypoints.push(Keypoint {
            x,
            y,
            lod,
            scale: lod.exp2(),
            rotation: decode_rotation(record[5]),
            score: record[6] as f32 / 255.0,
            extra,
            descriptor,
        });
    }

    keypoints
}

/// Number of records an encoder of the given length can hold.
pub fn encoder_capacity(encoder_length: u32, layout: RecordLayout) -> usize {
    let pixels = encoder_length as usize * encoder_length as usize;
    pixels / layout.pixels_per_record()
}

/// Smallest encoder length that fits `expected_count` keypoints plus slack.
///
/// `ceil(sqrt((count + slack) · pixelsPerRecord))` clamped to
/// `[MIN_ENCODER_LENGTH, MAX_ENCODER_LENGTH]`, with a slack of 4 keypoints plus
/// 5% of the count. Non-decreasing in `expected_count`.
pub fn optimize_encoder_size(expected_count: usize, layout: RecordLayout) -> u32 {
    let max_count = encoder_capacity(MAX_ENCODER_LENGTH, layout);
    let count = expected_count.min(max_count);
    let slack = ENCODER_SLACK + count.div_ceil(20);
    let pixels = ((count + slack) * layout.pixels_per_record()) as f64;
    let length = pixels.sqrt().ceil() as u32;
    length.clamp(MIN_ENCODER_LENGTH, MAX_ENCODER_LENGTH)
}

/// Overwrite the header of record `index` with the discard pattern.
///
/// Returns `false` if the record lies outside `bytes`.
pub fn mark_discarded(bytes: &mut [u8], index: usize, layout: RecordLayout) -> bool {
    let start = index * layout.bytes_per_record();
    match bytes.get_mut(start..start + MIN_KEYPOINT_SIZE) {
        Some(header) => {
            header.copy_from_slice(&DISCARD_HEADER);
            true
        }
        None => false,
    }
}
