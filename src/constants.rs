//! Engine-wide constants shared by the shader preprocessor, the keypoint codec
//! and the pyramid scale encoding.

/// Largest texture side the engine will address (fits a 16-bit fixed-point coordinate).
pub const MAX_TEXTURE_LENGTH: u32 = (1 << 13) - 2;

/// Maximum number of levels in an image pyramid.
pub const PYRAMID_MAX_LEVELS: u32 = 4;

/// Maximum number of octaves in a pyramid.
pub const PYRAMID_MAX_OCTAVES: u32 = 2 * PYRAMID_MAX_LEVELS - 1;

/// Maximum scale factor of a pyramid.
pub const PYRAMID_MAX_SCALE: f32 = 2.0;

/// `log2(PYRAMID_MAX_SCALE)`
pub const LOG2_PYRAMID_MAX_SCALE: f32 = 1.0;

/// Fractional bits of the fixed-point keypoint coordinates.
pub const FIX_BITS: u32 = 3;

/// `1 << FIX_BITS`
pub const FIX_RESOLUTION: u32 = 1 << FIX_BITS;

/// Default number of texture units when the backend does not say otherwise.
pub const DEFAULT_MAX_TEXTURE_UNITS: u32 = 16;

/// Constants that shader templates may reference as `@NAME@`.
pub fn shader_constant(name: &str) -> Option<String> {
    let value = match name {
        "MAX_TEXTURE_LENGTH" => MAX_TEXTURE_LENGTH.to_string(),
        "PYRAMID_MAX_LEVELS" => PYRAMID_MAX_LEVELS.to_string(),
        "PYRAMID_MAX_OCTAVES" => PYRAMID_MAX_OCTAVES.to_string(),
        "PYRAMID_MAX_SCALE" => format!("{:.1}", PYRAMID_MAX_SCALE),
        "LOG2_PYRAMID_MAX_SCALE" => format!("{:.1}", LOG2_PYRAMID_MAX_SCALE),
        "FIX_BITS" => FIX_BITS.to_string(),
        "FIX_RESOLUTION" => format!("{:.1}", FIX_RESOLUTION as f32),
        _ => return None,
    };
    Some(value)
}
