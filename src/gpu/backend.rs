//! Backend trait: the GL-shaped resource API the engine drives.
//!
//! Everything above this seam (kernels, the reader, the pipeline) is written
//! against [`GpuBackend`]. Object ids are opaque and never reused by a backend,
//! so a handle that outlives a context loss is detected instead of aliasing a
//! new object.

use crate::gpu::error::GpuResult;
use std::fmt;

macro_rules! gpu_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

gpu_id!(
    /// Texture object.
    TextureId
);
gpu_id!(
    /// Framebuffer object.
    FramebufferId
);
gpu_id!(
    /// Linked shader program.
    ProgramId
);
gpu_id!(
    /// Pixel-buffer object used for non-blocking readback.
    BufferId
);
gpu_id!(
    /// Sync object inserted into the command stream.
    FenceId
);

/// Location of a uniform inside a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation {
    pub program: ProgramId,
    pub index: u32,
}

/// Preprocessed GLSL ES 3.00 text of one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource {
    /// Kernel name, also used in diagnostics
    pub name: String,
    pub vertex: String,
    pub fragment: String,
}

/// GLSL uniform types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Sampler2D,
    Float,
    Int,
    Uint,
    Bool,
    Vec2,
    Vec3,
    Vec4,
    IVec2,
    IVec3,
    IVec4,
    UVec2,
    UVec3,
    UVec4,
    BVec2,
    BVec3,
    BVec4,
}

/// Scalar component type of a uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Float,
    Int,
    Uint,
    Bool,
}

impl UniformType {
    pub fn from_glsl(name: &str) -> Option<Self> {
        let ty = match name {
            "sampler2D" => Self::Sampler2D,
            "float" => Self::Float,
            "int" => Self::Int,
            "uint" => Self::Uint,
            "bool" => Self::Bool,
            "vec2" => Self::Vec2,
            "vec3" => Self::Vec3,
            "vec4" => Self::Vec4,
            "ivec2" => Self::IVec2,
            "ivec3" => Self::IVec3,
            "ivec4" => Self::IVec4,
            "uvec2" => Self::UVec2,
            "uvec3" => Self::UVec3,
            "uvec4" => Self::UVec4,
            "bvec2" => Self::BVec2,
            "bvec3" => Self::BVec3,
            "bvec4" => Self::BVec4,
            _ => return None,
        };
        Some(ty)
    }

    pub fn glsl_name(self) -> &'static str {
        match self {
            Self::Sampler2D => "sampler2D",
            Self::Float => "float",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Bool => "bool",
            Self::Vec2 => "vec2",
            Self::Vec3 => "vec3",
            Self::Vec4 => "vec4",
            Self::IVec2 => "ivec2",
            Self::IVec3 => "ivec3",
            Self::IVec4 => "ivec4",
            Self::UVec2 => "uvec2",
            Self::UVec3 => "uvec3",
            Self::UVec4 => "uvec4",
            Self::BVec2 => "bvec2",
            Self::BVec3 => "bvec3",
            Self::BVec4 => "bvec4",
        }
    }

    pub fn is_sampler(self) -> bool {
        self == Self::Sampler2D
    }

    /// Number of components (1 for scalars and samplers).
    pub fn components(self) -> usize {
        match self {
            Self::Vec2 | Self::IVec2 | Self::UVec2 | Self::BVec2 => 2,
            Self::Vec3 | Self::IVec3 | Self::UVec3 | Self::BVec3 => 3,
            Self::Vec4 | Self::IVec4 | Self::UVec4 | Self::BVec4 => 4,
            _ => 1,
        }
    }

    pub fn scalar(self) -> ScalarKind {
        match self {
            Self::Float | Self::Vec2 | Self::Vec3 | Self::Vec4 => ScalarKind::Float,
            Self::Sampler2D | Self::Int | Self::IVec2 | Self::IVec3 | Self::IVec4 => ScalarKind::Int,
            Self::Uint | Self::UVec2 | Self::UVec3 | Self::UVec4 => ScalarKind::Uint,
            Self::Bool | Self::BVec2 | Self::BVec3 | Self::BVec4 => ScalarKind::Bool,
        }
    }
}

impl fmt::Display for UniformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.glsl_name())
    }
}

/// A uniform value, shaped like the `glUniform{1,2,3,4}{f,i,ui}v` family.
///
/// The number of elements is the component count. Samplers are set as `Int`
/// holding the texture unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Float(Vec<f32>),
    Int(Vec<i32>),
    Uint(Vec<u32>),
    Bool(Vec<bool>),
}

impl UniformValue {
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Uint(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Component `i` converted to `f32`.
    pub fn get_f32(&self, i: usize) -> f32 {
        match self {
            Self::Float(v) => v.get(i).copied().unwrap_or(0.0),
            Self::Int(v) => v.get(i).map_or(0.0, |&x| x as f32),
            Self::Uint(v) => v.get(i).map_or(0.0, |&x| x as f32),
            Self::Bool(v) => v.get(i).map_or(0.0, |&x| if x { 1.0 } else { 0.0 }),
        }
    }

    /// Component `i` converted to `i32`.
    pub fn get_i32(&self, i: usize) -> i32 {
        match self {
            Self::Float(v) => v.get(i).map_or(0, |&x| x as i32),
            Self::Int(v) => v.get(i).copied().unwrap_or(0),
            Self::Uint(v) => v.get(i).map_or(0, |&x| x as i32),
            Self::Bool(v) => v.get(i).map_or(0, |&x| x as i32),
        }
    }
}

/// Result of a non-blocking fence poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimeoutExpired,
    WaitFailed,
}

/// A pixel rectangle, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of RGBA8 bytes covered by the rectangle.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Fit the rectangle inside a `width × height` surface.
    ///
    /// The size is clamped to the surface first, then the origin is moved back
    /// so the whole rectangle lies inside; the size is kept where possible.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let w = self.width.min(width);
        let h = self.height.min(height);
        Self {
            x: self.x.min(width - w),
            y: self.y.min(height - h),
            width: w,
            height: h,
        }
    }
}

/// Static facts about a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub renderer: String,
    pub max_texture_size: u32,
    pub max_texture_units: u32,
}

/// Command counters, used to prove whether work reached the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub draw_calls: u64,
    pub uniform_sets: u64,
    pub texture_binds: u64,
    pub uploads: u64,
    pub pixel_reads: u64,
    pub fences: u64,
    pub copies: u64,
    pub clears: u64,
}

impl BackendStats {
    /// Total number of commands that touch the GPU command stream.
    pub fn commands(&self) -> u64 {
        self.draw_calls
            + self.uniform_sets
            + self.texture_binds
            + self.uploads
            + self.pixel_reads
            + self.fences
            + self.copies
            + self.clears
    }
}

/// GL-shaped GPU backend.
///
/// Drawing targets whatever framebuffer was last bound (`None` is the display
/// surface); reads come from the same binding.
#[cfg_attr(test, mockall::automock)]
pub trait GpuBackend {
    fn info(&self) -> BackendInfo;

    fn is_context_lost(&self) -> bool;

    /// Simulate a context loss. Every object is invalidated.
    fn lose_context(&mut self) -> GpuResult<()>;

    fn restore_context(&mut self) -> GpuResult<()>;

    fn create_texture(&mut self, width: u32, height: u32) -> GpuResult<TextureId>;

    fn upload_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> GpuResult<()>;

    fn delete_texture(&mut self, texture: TextureId);

    fn create_framebuffer(&mut self, texture: TextureId) -> GpuResult<FramebufferId>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()>;

    fn resize_surface(&mut self, width: u32, height: u32) -> GpuResult<()>;

    fn viewport(&mut self, width: u32, height: u32);

    fn clear(&mut self, color: [f32; 4]) -> GpuResult<()>;

    fn compile_program(&mut self, source: &ProgramSource) -> GpuResult<ProgramId>;

    fn delete_program(&mut self, program: ProgramId);

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation>;

    fn use_program(&mut self, program: ProgramId) -> GpuResult<()>;

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) -> GpuResult<()>;

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> GpuResult<()>;

    /// Draw a 4-vertex triangle strip covering the viewport.
    fn draw_full_screen_quad(&mut self) -> GpuResult<()>;

    /// Copy the bound framebuffer into `texture` (`copyTexSubImage2D`).
    fn copy_to_texture(&mut self, texture: TextureId, width: u32, height: u32) -> GpuResult<()>;

    /// Blocking read from the bound framebuffer.
    fn read_pixels(&mut self, rect: PixelRect, dst: &mut [u8]) -> GpuResult<()>;

    fn create_pixel_buffer(&mut self, size: usize) -> GpuResult<BufferId>;

    fn delete_pixel_buffer(&mut self, buffer: BufferId);

    /// Non-blocking read from the bound framebuffer into a pixel buffer.
    fn read_pixels_to_buffer(&mut self, rect: PixelRect, buffer: BufferId) -> GpuResult<()>;

    fn get_buffer_data(&mut self, buffer: BufferId, dst: &mut [u8]) -> GpuResult<()>;

    fn fence(&mut self) -> GpuResult<FenceId>;

    /// Poll a fence without blocking.
    fn client_wait(&mut self, fence: FenceId) -> FenceStatus;

    fn delete_fence(&mut self, fence: FenceId);

    fn flush(&mut self);

    fn stats(&self) -> BackendStats;
}
