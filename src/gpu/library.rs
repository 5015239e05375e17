//! Built-in kernels and shader include files.
//!
//! Kernels are registered eagerly in a static table keyed by [`KernelId`].
//! Each descriptor carries the GLSL template compiled by hardware backends;
//! [`software_fragments`] maps the same kernel names to the fragment
//! functions the software backend runs in their place.

use crate::codec::{self, RecordLayout};
use crate::config::PyramidSettings;
use crate::gpu::backend::UniformType;
use crate::gpu::shader::{KernelDescriptor, KernelParam};
use crate::gpu::software::{FragmentFn, FragmentInput};

const GLOBAL_GLSL: &str = r#"
in highp vec2 texCoord;

#define threadLocation() ivec2(texCoord * texSize)
#define outputSize() ivec2(texSize)
#define threadPixel(img) textureLod((img), texCoord, 0.0f)
#define pixelAt(img, pos) texelFetch((img), (pos), 0)
#define pixelAtShortOffset(img, offset) textureLodOffset((img), texCoord, 0.0f, (offset))
"#;

const KEYPOINTS_GLSL: &str = r#"
/*
 * Cornerness textures: r = score, g = lod, b = chain length, a = rotation
 * Keypoint records: [ x | y ] [ lod, rotation, score, 0 ] [ extra ] [ descriptor ]
 */
#define isKeypoint(pixel) ((pixel).r > 0.0f)
#define encodeChainLength(n) (float(n) / 255.0f)
#define encodeLod(lod) ((@LOG2_PYRAMID_MAX_SCALE@ + (lod)) / (@LOG2_PYRAMID_MAX_SCALE@ + float(@PYRAMID_MAX_LEVELS@)))

vec4 encodeKeypointPosition(vec2 position)
{
    uvec2 fixedPoint = uvec2(position * @FIX_RESOLUTION@);
    uvec4 bytes = uvec4(fixedPoint.x & 255u, fixedPoint.x >> 8u, fixedPoint.y & 255u, fixedPoint.y >> 8u);
    return vec4(bytes) / 255.0f;
}
"#;

/// Look up a bundled include file.
pub fn include_file(name: &str) -> Option<&'static str> {
    match name {
        "global.glsl" => Some(GLOBAL_GLSL),
        "keypoints.glsl" => Some(KEYPOINTS_GLSL),
        _ => None,
    }
}

/// Built-in kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Copy the input image
    Identity,
    /// Convert RGBA to greyscale
    Greyscale,
    /// 2×2 cross-difference corner response
    CornerResponse,
    /// First keypoint encoding pass: forward offset chain
    EncodeOffsets,
    /// Second keypoint encoding pass: dense record packing
    EncodeKeypoints,
}

impl KernelId {
    pub const ALL: [KernelId; 5] = [
        KernelId::Identity,
        KernelId::Greyscale,
        KernelId::CornerResponse,
        KernelId::EncodeOffsets,
        KernelId::EncodeKeypoints,
    ];

    pub fn descriptor(self) -> &'static KernelDescriptor {
        match self {
            KernelId::Identity => &IDENTITY,
            KernelId::Greyscale => &GREYSCALE,
            KernelId::CornerResponse => &CORNER_RESPONSE,
            KernelId::EncodeOffsets => &ENCODE_OFFSETS,
            KernelId::EncodeKeypoints => &ENCODE_KEYPOINTS,
        }
    }
}

/// Fragment functions of the built-in kernels, keyed by kernel name.
pub fn software_fragments() -> &'static [(&'static str, FragmentFn)] {
    &[
        ("identity", identity),
        ("greyscale", greyscale),
        ("corner_response", corner_response),
        ("encode_offsets", encode_offsets),
        ("encode_keypoints", encode_keypoints),
    ]
}

// ==================== Identity ====================

static IDENTITY: KernelDescriptor = KernelDescriptor {
    name: "identity",
    source: r#"
uniform sampler2D image;

void main()
{
    color = threadPixel(image);
}
"#,
    params: &[KernelParam::new("image", UniformType::Sampler2D)],
    defines: &[],
};

fn identity(input: &FragmentInput<'_>) -> [u8; 4] {
    input.pixel("image")
}

// ==================== Greyscale ====================

static GREYSCALE: KernelDescriptor = KernelDescriptor {
    name: "greyscale",
    source: r#"
uniform sampler2D image;

const vec4 grey = vec4(0.299f, 0.587f, 0.114f, 0.0f);

void main()
{
    vec4 pixel = threadPixel(image);
    float g = dot(pixel, grey);
    color = vec4(g, g, g, pixel.a);
}
"#,
    params: &[KernelParam::new("image", UniformType::Sampler2D)],
    defines: &[],
};

fn greyscale(input: &FragmentInput<'_>) -> [u8; 4] {
    let [r, g, b, a] = input.pixel("image");
    let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    let luma = luma.round().clamp(0.0, 255.0) as u8;
    [luma, luma, luma, a]
}

// ==================== Corner response ====================

static CORNER_RESPONSE: KernelDescriptor = KernelDescriptor {
    name: "corner_response",
    source: r#"
@include "keypoints.glsl"

uniform sampler2D image;
uniform float threshold;

void main()
{
    ivec2 thread = threadLocation();
    color = vec4(0.0f, encodeLod(0.0f), 0.0f, 0.0f);
    if(thread.x == 0 || thread.y == 0)
        return;

    float a = pixelAtShortOffset(image, ivec2(-1, -1)).r;
    float b = pixelAtShortOffset(image, ivec2(0, -1)).r;
    float c = pixelAtShortOffset(image, ivec2(-1, 0)).r;
    float d = threadPixel(image).r;
    float response = abs(a - b - c + d) * 0.5f;

    color.r = response >= max(threshold, 1.0f / 255.0f) ? response : 0.0f;
}
"#,
    params: &[
        KernelParam::new("image", UniformType::Sampler2D),
        KernelParam::new("threshold", UniformType::Float),
    ],
    defines: &[],
};

fn corner_response(input: &FragmentInput<'_>) -> [u8; 4] {
    let lod = codec::encode_lod(0.0, &PyramidSettings::default());
    let (x, y) = input.position();
    if x == 0 || y == 0 {
        return [0, lod, 0, 0];
    }

    let (x, y) = (x as i32, y as i32);
    let a = input.texel("image", x - 1, y - 1)[0] as i32;
    let b = input.texel("image", x, y - 1)[0] as i32;
    let c = input.texel("image", x - 1, y)[0] as i32;
    let d = input.texel("image", x, y)[0] as i32;
    let response = (a - b - c + d).abs() / 2;

    let threshold = (input.float("threshold").clamp(0.0, 1.0) * 255.0).round() as i32;
    let score = if response >= threshold.max(1) {
        response as u8
    } else {
        0
    };
    [score, lod, 0, 0]
}

// ==================== Keypoint encoding ====================

static ENCODE_OFFSETS: KernelDescriptor = KernelDescriptor {
    name: "encode_offsets",
    source: r#"
@include "keypoints.glsl"

uniform sampler2D corners;
uniform int maxIterations;

void main()
{
    ivec2 thread = threadLocation();
    ivec2 size = outputSize();
    int index = thread.y * size.x + thread.x;
    int last = size.x * size.y;
    int cap = clamp(maxIterations, 1, 255);
    int jump = 1;

    for(; jump < cap; jump++) {
        int next = index + jump;
        if(next >= last || isKeypoint(pixelAt(corners, ivec2(next % size.x, next / size.x))))
            break;
    }

    color = threadPixel(corners);
    color.b = encodeChainLength(jump);
}
"#,
    params: &[
        KernelParam::new("corners", UniformType::Sampler2D),
        KernelParam::new("maxIterations", UniformType::Int),
    ],
    defines: &[],
};

fn encode_offsets(input: &FragmentInput<'_>) -> [u8; 4] {
    let (width, height) = input.texture_size("corners");
    let (x, y) = input.position();
    let index = y * width + x;
    let last = width * height;
    let cap = input.int("maxIterations").clamp(1, 255) as u32;

    let mut jump = 1;
    while jump < cap {
        let next = index + jump;
        if next >= last || is_keypoint(input.texel("corners", (next % width) as i32, (next / width) as i32)) {
            break;
        }
        jump += 1;
    }

    let mut pixel = input.pixel("corners");
    pixel[2] = jump as u8;
    pixel
}

static ENCODE_KEYPOINTS: KernelDescriptor = KernelDescriptor {
    name: "encode_keypoints",
    source: r#"
@include "keypoints.glsl"

uniform sampler2D encodedCorners;
uniform ivec2 imageSize;
uniform int descriptorSize;
uniform int extraSize;
uniform int encoderLength;

void main()
{
    ivec2 thread = threadLocation();
    int pixelsPerKeypoint = 2 + (descriptorSize + extraSize + 3) / 4;
    int p = thread.y * encoderLength + thread.x;
    int q = p / pixelsPerKeypoint;
    int r = p % pixelsPerKeypoint;
    int last = imageSize.x * imageSize.y;

    int index = 0, seen = 0;
    vec4 pixel = vec4(0.0f);
    for(; index < last; index += max(1, int(pixel.b * 255.0f))) {
        pixel = pixelAt(encodedCorners, ivec2(index % imageSize.x, index / imageSize.x));
        if(isKeypoint(pixel) && seen++ == q)
            break;
    }

    if(index >= last) {
        color = vec4(1.0f);
        return;
    }

    vec2 position = vec2(index % imageSize.x, index / imageSize.x);
    color = r == 0 ? encodeKeypointPosition(position) :
            r == 1 ? vec4(pixel.g, pixel.a, pixel.r, 0.0f) :
            vec4(0.0f);
}
"#,
    params: &[
        KernelParam::new("encodedCorners", UniformType::Sampler2D),
        KernelParam::new("imageSize", UniformType::IVec2),
        KernelParam::new("descriptorSize", UniformType::Int),
        KernelParam::new("extraSize", UniformType::Int),
        KernelParam::new("encoderLength", UniformType::Int),
    ],
    defines: &[],
};

fn is_keypoint(pixel: [u8; 4]) -> bool {
    pixel[0] > 0
}

fn encode_keypoints(input: &FragmentInput<'_>) -> [u8; 4] {
    let (x, y) = input.position();
    let encoder_length = input.int("encoderLength").max(1) as u32;
    let [width, height] = input.ivec2("imageSize").map(|v| v.max(0) as u32);
    let layout = RecordLayout::new(
        input.int("descriptorSize").max(0) as usize,
        input.int("extraSize").max(0) as usize,
    );

    let pixels_per_record = layout.pixels_per_record() as u32;
    let p = y * encoder_length + x;
    let q = p / pixels_per_record;
    let r = p % pixels_per_record;

    let Some((index, pixel)) = find_keypoint(input, width, width * height, q) else {
        return [0xFF; 4];
    };

    match r {
        0 => codec::encode_position((index % width) as f32, (index / width) as f32),
        1 => [pixel[1], pixel[3], pixel[0], 0],
        _ => [0; 4],
    }
}

/// Follow the offset chain from the origin to the `q`-th keypoint.
fn find_keypoint(input: &FragmentInput<'_>, width: u32, last: u32, q: u32) -> Option<(u32, [u8; 4])> {
    let mut index = 0;
    let mut seen = 0;

    while index < last {
        let pixel = input.texel("encodedCorners", (index % width) as i32, (index / width) as i32);
        if is_keypoint(pixel) {
            if seen == q {
                return Some((index, pixel));
            }
            seen += 1;
        }
        index += u32::from(pixel[2]).max(1);
    }

    None
}
