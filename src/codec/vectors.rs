//! Packed 2D vector lists.
//!
//! One RGBA pixel per vector: `x` and `y` as little-endian float16 words.

use crate::types::Vector2;
use half::f16;

/// End-of-list pixel value
pub const VECTOR_END_SENTINEL: u32 = 0xFFFF_FFFF;

/// Pixel value of a discarded vector
pub const VECTOR_DISCARD_SENTINEL: u32 = 0xFF00_FF00;

/// Pack a vector into one pixel.
pub fn encode_vector(vector: Vector2) -> [u8; 4] {
    let [x0, x1] = f16::from_f32(vector.x).to_bits().to_le_bytes();
    let [y0, y1] = f16::from_f32(vector.y).to_bits().to_le_bytes();
    [x0, x1, y0, y1]
}

/// Decode the vectors of an `encoder_length`-wide square texture.
pub fn decode_vectors(bytes: &[u8], encoder_length: u32) -> Vec<Vector2> {
    let size = bytes
        .len()
        .min(encoder_length as usize * encoder_length as usize * 4);

    let mut vectors = Vec::new();
    for pixel in bytes[..size].chunks_exact(4) {
        match u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]]) {
            VECTOR_END_SENTINEL => break,
            VECTOR_DISCARD_SENTINEL => continue,
            _ => {}
        }
        let x = f16::from_bits(u16::from_le_bytes([pixel[0], pixel[1]]));
        let y = f16::from_bits(u16::from_le_bytes([pixel[2], pixel[3]]));
        vectors.push(Vector2::new(x.to_f32(), y.to_f32()));
    }
    vectors
}
