//! OpenGL ES 3.0 / WebGL2 backend on top of `glow`.
//!
//! Programs are compiled from the preprocessed GLSL text of
//! [`ProgramSource`]. Asynchronous reads go through `PIXEL_PACK_BUFFER`
//! objects and fences are GL sync objects. GL object names are mapped to
//! engine ids that are never reused, so a stale id can't alias a new object
//! after a context loss.
//!
//! Rows are addressed in GL window coordinates throughout: row 0 of an upload
//! is `y = 0` for `threadLocation()` and for every read, which keeps the
//! layout identical to the software backend.

use crate::config::GpuSettings;
use crate::gpu::backend::{
    BackendInfo, BackendStats, BufferId, FenceId, FenceStatus, FramebufferId, GpuBackend,
    PixelRect, ProgramId, ProgramSource, TextureId, UniformLocation, UniformType, UniformValue,
};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::shader;
use glow::HasContext;
use std::collections::HashMap;
use tracing::{debug, info, warn};

type GlTexture = <glow::Context as HasContext>::Texture;
type GlFramebuffer = <glow::Context as HasContext>::Framebuffer;
type GlProgram = <glow::Context as HasContext>::Program;
type GlShader = <glow::Context as HasContext>::Shader;
type GlBuffer = <glow::Context as HasContext>::Buffer;
type GlFence = <glow::Context as HasContext>::Fence;
type GlVertexArray = <glow::Context as HasContext>::VertexArray;
type GlUniform = <glow::Context as HasContext>::UniformLocation;

/// `GL_CONTEXT_LOST` as reported by `glGetError`
const CONTEXT_LOST: u32 = 0x0507;

/// Interleaved `a_position` / `a_texCoord` of the full-screen strip.
#[rustfmt::skip]
const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 0.0,
     1.0, -1.0, 1.0, 0.0,
    -1.0,  1.0, 0.0, 1.0,
     1.0,  1.0, 1.0, 1.0,
];

/// Objects of one kind, keyed by ids that are never handed out twice.
#[derive(Debug)]
struct ObjectTable<V> {
    next: u32,
    objects: HashMap<u32, V>,
}

impl<V> ObjectTable<V> {
    fn new() -> Self {
        Self {
            next: 1,
            objects: HashMap::new(),
        }
    }

    fn insert(&mut self, object: V) -> u32 {
        let id = self.next;
        self.next += 1;
        self.objects.insert(id, object);
        id
    }

    fn get(&self, id: u32) -> Option<&V> {
        self.objects.get(&id)
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut V> {
        self.objects.get_mut(&id)
    }

    fn remove(&mut self, id: u32) -> Option<V> {
        self.objects.remove(&id)
    }

    fn contains(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    /// Remove every object. The id counter keeps running.
    fn drain(&mut self) -> Vec<V> {
        self.objects.drain().map(|(_, object)| object).collect()
    }
}

struct TextureEntry {
    texture: GlTexture,
    width: u32,
    height: u32,
}

struct FramebufferEntry {
    framebuffer: GlFramebuffer,
    texture: TextureId,
}

struct ProgramEntry {
    program: GlProgram,
    names: HashMap<String, usize>,
    types: Vec<UniformType>,
    locations: Vec<Option<GlUniform>>,
}

struct PixelBuffer {
    buffer: GlBuffer,
    size: usize,
}

struct Quad {
    vertex_array: GlVertexArray,
    buffer: GlBuffer,
}

/// [`GpuBackend`] driving a real GL context.
///
/// The context must stay current on the thread that owns the backend.
pub struct GlBackend {
    gl: glow::Context,
    renderer: String,
    max_texture_size: u32,
    max_texture_units: u32,
    lost: bool,
    quad: Option<Quad>,
    textures: ObjectTable<TextureEntry>,
    framebuffers: ObjectTable<FramebufferEntry>,
    programs: ObjectTable<ProgramEntry>,
    buffers: ObjectTable<PixelBuffer>,
    fences: ObjectTable<GlFence>,
    bound_framebuffer: Option<FramebufferId>,
    current_program: Option<ProgramId>,
    surface: (u32, u32),
    stats: BackendStats,
}

impl GlBackend {
    /// Take ownership of `gl` and create the shared full-screen quad.
    pub fn new(gl: glow::Context, settings: &GpuSettings) -> GpuResult<Self> {
        let (renderer, max_size, max_units) = unsafe {
            (
                gl.get_parameter_string(glow::RENDERER),
                gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE),
                gl.get_parameter_i32(glow::MAX_TEXTURE_IMAGE_UNITS),
            )
        };

        let mut backend = Self {
            gl,
            renderer,
            max_texture_size: settings.max_texture_size.min(max_size.max(0) as u32),
            max_texture_units: max_units.max(0) as u32,
            lost: false,
            quad: None,
            textures: ObjectTable::new(),
            framebuffers: ObjectTable::new(),
            programs: ObjectTable::new(),
            buffers: ObjectTable::new(),
            fences: ObjectTable::new(),
            bound_framebuffer: None,
            current_program: None,
            surface: (1, 1),
            stats: BackendStats::default(),
        };
        backend.create_quad()?;
        info!(
            "GL backend on {} (max texture {}, {} units)",
            backend.renderer, backend.max_texture_size, backend.max_texture_units
        );
        Ok(backend)
    }

    fn alive(&self) -> GpuResult<()> {
        if self.lost {
            Err(GpuError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn check_size(&self, width: u32, height: u32) -> GpuResult<()> {
        if width == 0 || height == 0 || width > self.max_texture_size || height > self.max_texture_size
        {
            return Err(GpuError::InvalidDimensions { width, height });
        }
        Ok(())
    }

    fn create_quad(&mut self) -> GpuResult<()> {
        let gl = &self.gl;
        let quad = unsafe {
            let vertex_array = gl
                .create_vertex_array()
                .map_err(GpuError::InitializationFailed)?;
            let buffer = gl.create_buffer().map_err(GpuError::InitializationFailed)?;

            gl.bind_vertex_array(Some(vertex_array));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&QUAD),
                glow::STATIC_DRAW,
            );
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 16, 0);
            gl.enable_vertex_attrib_array(1);
            gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, 16, 8);
            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);

            Quad {
                vertex_array,
                buffer,
            }
        };
        self.quad = Some(quad);
        Ok(())
    }

    /// Delete every GL object this backend created.
    fn release_all(&mut self) {
        let gl = &self.gl;
        unsafe {
            for fence in self.fences.drain() {
                gl.delete_sync(fence);
            }
            for entry in self.buffers.drain() {
                gl.delete_buffer(entry.buffer);
            }
            for entry in self.framebuffers.drain() {
                gl.delete_framebuffer(entry.framebuffer);
            }
            for entry in self.textures.drain() {
                gl.delete_texture(entry.texture);
            }
            for entry in self.programs.drain() {
                gl.delete_program(entry.program);
            }
            if let Some(quad) = self.quad.take() {
                gl.delete_vertex_array(quad.vertex_array);
                gl.delete_buffer(quad.buffer);
            }
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.use_program(None);
        }
        self.bound_framebuffer = None;
        self.current_program = None;
    }

    fn texture(&self, texture: TextureId) -> GpuResult<&TextureEntry> {
        self.textures
            .get(texture.0)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", texture)))
    }

    fn gl_framebuffer(&self, framebuffer: Option<FramebufferId>) -> Option<GlFramebuffer> {
        framebuffer
            .and_then(|fb| self.framebuffers.get(fb.0))
            .map(|entry| entry.framebuffer)
    }

    /// Size of whatever is bound for drawing and reading.
    fn target_size(&self) -> GpuResult<(u32, u32)> {
        match self.bound_framebuffer {
            None => Ok(self.surface),
            Some(fb) => {
                let entry = self
                    .framebuffers
                    .get(fb.0)
                    .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", fb)))?;
                let texture = self.texture(entry.texture)?;
                Ok((texture.width, texture.height))
            }
        }
    }

    fn check_read(&self, rect: PixelRect, available: usize) -> GpuResult<()> {
        let (width, height) = self.target_size()?;
        if rect.x + rect.width > width || rect.y + rect.height > height {
            return Err(GpuError::IllegalArgument(format!(
                "read of {:?} outside a {}x{} framebuffer",
                rect, width, height
            )));
        }
        if available < rect.byte_len() {
            return Err(GpuError::IllegalArgument(format!(
                "destination holds {} bytes, {} needed",
                available,
                rect.byte_len()
            )));
        }
        Ok(())
    }

    fn compile_shader(&self, stage: u32, source: &ProgramSource, text: &str) -> GpuResult<GlShader> {
        let gl = &self.gl;
        unsafe {
            let shader = gl
                .create_shader(stage)
                .map_err(GpuError::InvalidResource)?;
            gl.shader_source(shader, text);
            gl.compile_shader(shader);
            if gl.get_shader_compile_status(shader) {
                return Ok(shader);
            }
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            Err(GpuError::ShaderCompilation {
                name: source.name.clone(),
                details: shader::compile_diagnostics(text, &log),
            })
        }
    }

    fn link(&self, source: &ProgramSource) -> GpuResult<GlProgram> {
        let vertex = self.compile_shader(glow::VERTEX_SHADER, source, &source.vertex)?;
        let fragment = match self.compile_shader(glow::FRAGMENT_SHADER, source, &source.fragment) {
            Ok(fragment) => fragment,
            Err(e) => {
                unsafe { self.gl.delete_shader(vertex) };
                return Err(e);
            }
        };

        let gl = &self.gl;
        unsafe {
            let linked = gl.create_program().map_err(GpuError::InvalidResource).map(|program| {
                gl.attach_shader(program, vertex);
                gl.attach_shader(program, fragment);
                gl.link_program(program);
                gl.detach_shader(program, vertex);
                gl.detach_shader(program, fragment);
                program
            });
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);

            let program = linked?;
            if gl.get_program_link_status(program) {
                return Ok(program);
            }
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            Err(GpuError::ShaderCompilation {
                name: source.name.clone(),
                details: shader::compile_diagnostics(&source.fragment, &log),
            })
        }
    }
}

impl Drop for GlBackend {
    fn drop(&mut self) {
        if !self.lost {
            self.release_all();
        }
    }
}

/// Translate a `glClientWaitSync` result.
fn fence_status(code: u32) -> FenceStatus {
    match code {
        glow::ALREADY_SIGNALED | glow::CONDITION_SATISFIED => FenceStatus::Signaled,
        glow::TIMEOUT_EXPIRED => FenceStatus::TimeoutExpired,
        _ => FenceStatus::WaitFailed,
    }
}

/// Issue the `glUniform*v` call matching the shape of `value`.
unsafe fn write_uniform(gl: &glow::Context, location: Option<&GlUniform>, value: &UniformValue) {
    match value {
        UniformValue::Float(v) => match v.len() {
            1 => gl.uniform_1_f32_slice(location, v),
            2 => gl.uniform_2_f32_slice(location, v),
            3 => gl.uniform_3_f32_slice(location, v),
            _ => gl.uniform_4_f32_slice(location, v),
        },
        UniformValue::Int(v) => write_int_uniform(gl, location, v),
        UniformValue::Uint(v) => match v.len() {
            1 => gl.uniform_1_u32_slice(location, v),
            2 => gl.uniform_2_u32_slice(location, v),
            3 => gl.uniform_3_u32_slice(location, v),
            _ => gl.uniform_4_u32_slice(location, v),
        },
        UniformValue::Bool(v) => {
            let ints: Vec<i32> = v.iter().map(|&b| i32::from(b)).collect();
            write_int_uniform(gl, location, &ints);
        }
    }
}

unsafe fn write_int_uniform(gl: &glow::Context, location: Option<&GlUniform>, v: &[i32]) {
    match v.len() {
        1 => gl.uniform_1_i32_slice(location, v),
        2 => gl.uniform_2_i32_slice(location, v),
        3 => gl.uniform_3_i32_slice(location, v),
        _ => gl.uniform_4_i32_slice(location, v),
    }
}

impl GpuBackend for GlBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            renderer: self.renderer.clone(),
            max_texture_size: self.max_texture_size,
            max_texture_units: self.max_texture_units,
        }
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn lose_context(&mut self) -> GpuResult<()> {
        if !self.lost {
            self.release_all();
            self.lost = true;
            warn!("GL objects released, context marked lost");
        }
        Ok(())
    }

    fn restore_context(&mut self) -> GpuResult<()> {
        if self.lost {
            self.lost = false;
            self.create_quad()?;
        }
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> GpuResult<TextureId> {
        self.alive()?;
        self.check_size(width, height)?;
        let gl = &self.gl;
        let texture = unsafe {
            let texture = gl.create_texture().map_err(GpuError::InvalidResource)?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                width as i32,
                height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(None),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
            texture
        };
        let id = TextureId(self.textures.insert(TextureEntry {
            texture,
            width,
            height,
        }));
        debug!("GL texture {:?} ({}x{})", id, width, height);
        Ok(id)
    }

    fn upload_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> GpuResult<()> {
        self.alive()?;
        self.check_size(width, height)?;
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(GpuError::IllegalArgument(format!(
                "upload of {} bytes into a {}x{} texture ({} expected)",
                pixels.len(),
                width,
                height,
                expected
            )));
        }

        let entry = self
            .textures
            .get_mut(texture.0)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", texture)))?;
        let gl = &self.gl;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(entry.texture));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 4);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                width as i32,
                height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        entry.width = width;
        entry.height = height;
        self.stats.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if let Some(entry) = self.textures.remove(texture.0) {
            unsafe { self.gl.delete_texture(entry.texture) };
        }
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> GpuResult<FramebufferId> {
        self.alive()?;
        let attachment = self.texture(texture)?.texture;
        let restore = self.gl_framebuffer(self.bound_framebuffer);
        let gl = &self.gl;
        let framebuffer = unsafe {
            let framebuffer = gl.create_framebuffer().map_err(GpuError::InvalidResource)?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(attachment),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, restore);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(framebuffer);
                return Err(GpuError::InvalidResource(format!(
                    "framebuffer for {:?} is incomplete (status 0x{:X})",
                    texture, status
                )));
            }
            framebuffer
        };
        Ok(FramebufferId(self.framebuffers.insert(FramebufferEntry {
            framebuffer,
            texture,
        })))
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if let Some(entry) = self.framebuffers.remove(framebuffer.0) {
            unsafe { self.gl.delete_framebuffer(entry.framebuffer) };
        }
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
            unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()> {
        self.alive()?;
        if let Some(fb) = framebuffer {
            if !self.framebuffers.contains(fb.0) {
                return Err(GpuError::InvalidResource(format!("{:?}", fb)));
            }
        }
        let target = self.gl_framebuffer(framebuffer);
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, target) };
        self.bound_framebuffer = framebuffer;
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> GpuResult<()> {
        self.alive()?;
        self.check_size(width, height)?;
        // the default framebuffer belongs to the windowing system
        self.surface = (width, height);
        Ok(())
    }

    fn viewport(&mut self, width: u32, height: u32) {
        unsafe { self.gl.viewport(0, 0, width as i32, height as i32) };
    }

    fn clear(&mut self, color: [f32; 4]) -> GpuResult<()> {
        self.alive()?;
        let [r, g, b, a] = color;
        unsafe {
            self.gl.clear_color(r, g, b, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
        self.stats.clears += 1;
        Ok(())
    }

    fn compile_program(&mut self, source: &ProgramSource) -> GpuResult<ProgramId> {
        self.alive()?;
        let declarations = shader::parse_uniforms(&source.fragment).map_err(|e| {
            GpuError::ShaderCompilation {
                name: source.name.clone(),
                details: shader::compile_diagnostics(&source.fragment, &e.to_string()),
            }
        })?;
        let program = self.link(source)?;

        let mut names = HashMap::new();
        let mut types = Vec::new();
        let mut locations = Vec::new();
        for (name, ty) in shader::expand_uniforms(&declarations) {
            locations.push(unsafe { self.gl.get_uniform_location(program, &name) });
            names.insert(name, types.len());
            types.push(ty);
        }

        let id = ProgramId(self.programs.insert(ProgramEntry {
            program,
            names,
            types,
            locations,
        }));
        debug!("Linked GL program {} as {:?}", source.name, id);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if let Some(entry) = self.programs.remove(program.0) {
            unsafe { self.gl.delete_program(entry.program) };
        }
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        let entry = self.programs.get(program.0)?;
        let index = *entry.names.get(name)?;
        // uniforms optimized out by the driver have no location
        entry.locations.get(index)?.as_ref()?;
        Some(UniformLocation {
            program,
            index: index as u32,
        })
    }

    fn use_program(&mut self, program: ProgramId) -> GpuResult<()> {
        self.alive()?;
        let entry = self
            .programs
            .get(program.0)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", program)))?;
        unsafe { self.gl.use_program(Some(entry.program)) };
        self.current_program = Some(program);
        Ok(())
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) -> GpuResult<()> {
        self.alive()?;
        if self.current_program != Some(location.program) {
            return Err(GpuError::InvalidResource(format!(
                "uniform location {:?} does not belong to the current program",
                location
            )));
        }
        let entry = self
            .programs
            .get(location.program.0)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", location.program)))?;
        let index = location.index as usize;
        let ty = *entry
            .types
            .get(index)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", location)))?;
        if value.len() != ty.components() {
            return Err(GpuError::IllegalArgument(format!(
                "{} components given to a {} uniform",
                value.len(),
                ty
            )));
        }

        let gl_location = entry.locations.get(index).and_then(Option::as_ref);
        unsafe { write_uniform(&self.gl, gl_location, value) };
        self.stats.uniform_sets += 1;
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> GpuResult<()> {
        self.alive()?;
        if unit >= self.max_texture_units {
            return Err(GpuError::IllegalArgument(format!(
                "texture unit {} exceeds the limit of {}",
                unit, self.max_texture_units
            )));
        }
        let gl_texture = self.texture(texture)?.texture;
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit);
            self.gl.bind_texture(glow::TEXTURE_2D, Some(gl_texture));
        }
        self.stats.texture_binds += 1;
        Ok(())
    }

    fn draw_full_screen_quad(&mut self) -> GpuResult<()> {
        self.alive()?;
        if self.current_program.is_none() {
            return Err(GpuError::InvalidResource("no program in use".to_string()));
        }
        let quad = self
            .quad
            .as_ref()
            .ok_or_else(|| GpuError::InvalidResource("full-screen quad is missing".to_string()))?;
        unsafe {
            self.gl.bind_vertex_array(Some(quad.vertex_array));
            self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            self.gl.bind_vertex_array(None);
        }
        self.stats.draw_calls += 1;
        Ok(())
    }

    fn copy_to_texture(&mut self, texture: TextureId, width: u32, height: u32) -> GpuResult<()> {
        self.alive()?;
        let (source_width, source_height) = self.target_size()?;
        let entry = self.texture(texture)?;
        let width = width.min(source_width).min(entry.width);
        let height = height.min(source_height).min(entry.height);
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(entry.texture));
            self.gl.copy_tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                0,
                0,
                width as i32,
                height as i32,
            );
            self.gl.bind_texture(glow::TEXTURE_2D, None);
        }
        self.stats.copies += 1;
        Ok(())
    }

    fn read_pixels(&mut self, rect: PixelRect, dst: &mut [u8]) -> GpuResult<()> {
        self.alive()?;
        self.check_read(rect, dst.len())?;
        let len = rect.byte_len();
        unsafe {
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 4);
            self.gl.read_pixels(
                rect.x as i32,
                rect.y as i32,
                rect.width as i32,
                rect.height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(&mut dst[..len])),
            );
        }
        self.stats.pixel_reads += 1;
        Ok(())
    }

    fn create_pixel_buffer(&mut self, size: usize) -> GpuResult<BufferId> {
        self.alive()?;
        let gl = &self.gl;
        let buffer = unsafe {
            let buffer = gl.create_buffer().map_err(GpuError::InvalidResource)?;
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(buffer));
            gl.buffer_data_size(glow::PIXEL_PACK_BUFFER, size as i32, glow::STREAM_READ);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            buffer
        };
        Ok(BufferId(self.buffers.insert(PixelBuffer { buffer, size })))
    }

    fn delete_pixel_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(buffer.0) {
            unsafe { self.gl.delete_buffer(entry.buffer) };
        }
    }

    fn read_pixels_to_buffer(&mut self, rect: PixelRect, buffer: BufferId) -> GpuResult<()> {
        self.alive()?;
        let entry = self
            .buffers
            .get(buffer.0)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", buffer)))?;
        self.check_read(rect, entry.size)?;
        unsafe {
            self.gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(entry.buffer));
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 4);
            self.gl.read_pixels(
                rect.x as i32,
                rect.y as i32,
                rect.width as i32,
                rect.height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::BufferOffset(0),
            );
            self.gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
        }
        self.stats.pixel_reads += 1;
        Ok(())
    }

    fn get_buffer_data(&mut self, buffer: BufferId, dst: &mut [u8]) -> GpuResult<()> {
        self.alive()?;
        let entry = self
            .buffers
            .get(buffer.0)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", buffer)))?;
        let len = dst.len().min(entry.size);
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(entry.buffer));
            #[cfg(target_arch = "wasm32")]
            gl.get_buffer_sub_data(glow::PIXEL_PACK_BUFFER, 0, &mut dst[..len]);
            #[cfg(not(target_arch = "wasm32"))]
            {
                // GLES has no glGetBufferSubData
                let mapped = gl.map_buffer_range(
                    glow::PIXEL_PACK_BUFFER,
                    0,
                    len as i32,
                    glow::MAP_READ_BIT,
                );
                if mapped.is_null() {
                    gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
                    return Err(GpuError::InvalidResource(format!(
                        "could not map {:?}",
                        buffer
                    )));
                }
                std::ptr::copy_nonoverlapping(mapped, dst.as_mut_ptr(), len);
                gl.unmap_buffer(glow::PIXEL_PACK_BUFFER);
            }
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
        }
        Ok(())
    }

    fn fence(&mut self) -> GpuResult<FenceId> {
        self.alive()?;
        let fence = unsafe { self.gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) }
            .map_err(GpuError::InvalidResource)?;
        self.stats.fences += 1;
        Ok(FenceId(self.fences.insert(fence)))
    }

    fn client_wait(&mut self, fence: FenceId) -> FenceStatus {
        if self.lost {
            return FenceStatus::WaitFailed;
        }
        match self.fences.get(fence.0) {
            None => FenceStatus::WaitFailed,
            Some(&sync) => fence_status(unsafe { self.gl.client_wait_sync(sync, 0, 0) }),
        }
    }

    fn delete_fence(&mut self, fence: FenceId) {
        if let Some(sync) = self.fences.remove(fence.0) {
            unsafe { self.gl.delete_sync(sync) };
        }
    }

    fn flush(&mut self) {
        if self.lost {
            return;
        }
        let error = unsafe {
            self.gl.flush();
            self.gl.get_error()
        };
        if error == CONTEXT_LOST {
            warn!("GL reported a lost context");
            // the driver already dropped every object
            self.textures.drain();
            self.framebuffers.drain();
            self.programs.drain();
            self.buffers.drain();
            self.fences.drain();
            self.quad = None;
            self.bound_framebuffer = None;
            self.current_program = None;
            self.lost = true;
        }
    }

    fn stats(&self) -> BackendStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_are_never_reused() {
        let mut table = ObjectTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_ne!(a, b);

        assert_eq!(table.remove(a), Some("a"));
        let c = table.insert("c");
        assert!(c > b);

        assert_eq!(table.drain().len(), 2);
        assert!(!table.contains(b));
        assert!(table.insert("d") > c);
    }

    #[test]
    fn test_fence_status_codes() {
        assert_eq!(fence_status(glow::ALREADY_SIGNALED), FenceStatus::Signaled);
        assert_eq!(fence_status(glow::CONDITION_SATISFIED), FenceStatus::Signaled);
        assert_eq!(fence_status(glow::TIMEOUT_EXPIRED), FenceStatus::TimeoutExpired);
        assert_eq!(fence_status(glow::WAIT_FAILED), FenceStatus::WaitFailed);
    }

    #[test]
    fn test_quad_covers_clip_space() {
        let corners: Vec<(f32, f32)> = QUAD.chunks_exact(4).map(|v| (v[0], v[1])).collect();
        assert_eq!(corners, vec![(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)]);
        for vertex in QUAD.chunks_exact(4) {
            assert_eq!(vertex[2], (vertex[0] + 1.0) / 2.0);
            assert_eq!(vertex[3], (vertex[1] + 1.0) / 2.0);
        }
    }
}
