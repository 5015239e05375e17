//! Deterministic CPU reference backend.
//!
//! `SoftwareGpu` rasterizes a full-screen quad by running a [`FragmentFn`] once
//! per viewport pixel, so every kernel can be validated on a machine without a
//! GPU. The GLSL text is still preprocessed and its uniforms introspected; the
//! per-pixel work comes from a fragment function registered under the
//! program's name. Fences signal after a configurable number of polls to
//! emulate asynchronous execution. Texture rows are stored top to bottom.

use crate::config::GpuSettings;
use crate::constants::DEFAULT_MAX_TEXTURE_UNITS;
use crate::gpu::backend::{
    BackendInfo, BackendStats, BufferId, FenceId, FenceStatus, FramebufferId, GpuBackend, PixelRect, ProgramId, ProgramSource, TextureId, UniformLocation, UniformType,
    UniformValue,
};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::{library, shader};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct SoftTexture {
    width: u32,
    height: u32,
    pixels: Vec<[u8; 4]>,
}

impl SoftTexture {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0; 4]; width as usize * height as usize],
        }
    }

    fn texel(&self, x: i32, y: i32) -> [u8; 4] {
        if self.pixels.is_empty() {
            return [0; 4];
        }
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.pixels[y * self.width as usize + x]
    }
}

/// CPU rendition of a fragment shader, run once per output pixel.
pub type FragmentFn = fn(&FragmentInput<'_>) -> [u8; 4];

struct SoftProgram {
    entry: FragmentFn,
    names: HashMap<String, usize>,
    types: Vec<UniformType>,
    values: Vec<Option<UniformValue>>,
}

/// Per-pixel view handed to a [`FragmentFn`].
pub struct FragmentInput<'a> {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    program: &'a SoftProgram,
    samplers: &'a HashMap<usize, &'a SoftTexture>,
}

impl<'a> FragmentInput<'a> {
    /// Pixel coordinates of the fragment being shaded.
    pub fn position(&self) -> (u32, u32) {
        (self.x, self.y)
    }

    /// Size of the render target (viewport).
    pub fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        let index = *self.program.names.get(name)?;
        self.program.values[index].as_ref()
    }

    pub fn float(&self, name: &str) -> f32 {
        self.uniform(name).map_or(0.0, |v| v.get_f32(0))
    }

    pub fn int(&self, name: &str) -> i32 {
        self.uniform(name).map_or(0, |v| v.get_i32(0))
    }

    pub fn ivec2(&self, name: &str) -> [i32; 2] {
        self.uniform(name)
            .map_or([0, 0], |v| [v.get_i32(0), v.get_i32(1)])
    }

    fn sampler(&self, name: &str) -> Option<&SoftTexture> {
        let index = *self.program.names.get(name)?;
        self.samplers.get(&index).copied()
    }

    /// Texel of `sampler` at integer coordinates, clamped to the edge.
    pub fn texel(&self, sampler: &str, x: i32, y: i32) -> [u8; 4] {
        self.sampler(sampler).map_or([0; 4], |t| t.texel(x, y))
    }

    /// Texel of `sampler` at this fragment's own position.
    pub fn pixel(&self, sampler: &str) -> [u8; 4] {
        self.texel(sampler, self.x as i32, self.y as i32)
    }

    pub fn texture_size(&self, sampler: &str) -> (u32, u32) {
        self.sampler(sampler).map_or((0, 0), |t| (t.width, t.height))
    }
}

/// CPU rasterizer implementing [`GpuBackend`].
pub struct SoftwareGpu {
    max_texture_size: u32,
    max_texture_units: u32,
    fence_latency: u32,
    lost: bool,
    next_id: u32,
    textures: HashMap<TextureId, SoftTexture>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    programs: HashMap<ProgramId, SoftProgram>,
    buffers: HashMap<BufferId, Vec<u8>>,
    fences: HashMap<FenceId, u32>,
    surface: SoftTexture,
    bound_framebuffer: Option<FramebufferId>,
    viewport: (u32, u32),
    current_program: Option<ProgramId>,
    units: HashMap<u32, TextureId>,
    fragments: HashMap<String, FragmentFn>,
    stats: BackendStats,
}

impl SoftwareGpu {
    pub fn new(settings: &GpuSettings) -> Self {
        Self {
            max_texture_size: settings.max_texture_size,
            max_texture_units: DEFAULT_MAX_TEXTURE_UNITS,
            fence_latency: settings.fence_latency,
            lost: false,
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            fences: HashMap::new(),
            surface: SoftTexture::new(1, 1),
            bound_framebuffer: None,
            viewport: (1, 1),
            current_program: None,
            units: HashMap::new(),
            fragments: library::software_fragments()
                .iter()
                .map(|&(name, entry)| (name.to_string(), entry))
                .collect(),
            stats: BackendStats::default(),
        }
    }

    /// Run `entry` for programs named `name`. Built-in kernels are registered
    /// already.
    pub fn with_fragment(mut self, name: &str, entry: FragmentFn) -> Self {
        self.fragments.insert(name.to_string(), entry);
        self
    }

    /// Number of polls before a fence reports `Signaled`.
    pub fn with_fence_latency(mut self, polls: u32) -> Self {
        self.fence_latency = polls;
        self
    }

    pub fn with_max_texture_units(mut self, units: u32) -> Self {
        self.max_texture_units = units;
        self
    }

    /// Number of live textures, for leak checks.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn alive(&self) -> GpuResult<()> {
        if self.lost {
            Err(GpuError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_size(&self, width: u32, height: u32) -> GpuResult<()> {
        if width == 0 || height == 0 || width > self.max_texture_size || height > self.max_texture_size
        {
            return Err(GpuError::InvalidDimensions { width, height });
        }
        Ok(())
    }

    fn target_texture_id(&self) -> GpuResult<Option<TextureId>> {
        match self.bound_framebuffer {
            None => Ok(None),
            Some(fb) => self
                .framebuffers
                .get(&fb)
                .copied()
                .map(Some)
                .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", fb))),
        }
    }

    fn target(&self) -> GpuResult<&SoftTexture> {
        match self.target_texture_id()? {
            None => Ok(&self.surface),
            Some(id) => self
                .textures
                .get(&id)
                .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", id))),
        }
    }

    fn target_mut(&mut self) -> GpuResult<&mut SoftTexture> {
        match self.target_texture_id()? {
            None => Ok(&mut self.surface),
            Some(id) => self
                .textures
                .get_mut(&id)
                .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", id))),
        }
    }

    fn read_rect(&self, rect: PixelRect, dst: &mut [u8]) -> GpuResult<()> {
        let source = self.target()?;
        if rect.x + rect.width > source.width || rect.y + rect.height > source.height {
            return Err(GpuError::IllegalArgument(format!(
                "read of {:?} outside a {}x{} framebuffer",
                rect, source.width, source.height
            )));
        }
        if dst.len() < rect.byte_len() {
            return Err(GpuError::IllegalArgument(format!(
                "destination holds {} bytes, {} needed",
                dst.len(),
                rect.byte_len()
            )));
        }

        let row_bytes = rect.width as usize * 4;
        for row in 0..rect.height as usize {
            let start = (rect.y as usize + row) * source.width as usize + rect.x as usize;
            let texels = &source.pixels[start..start + rect.width as usize];
            dst[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(bytemuck::cast_slice(texels));
        }
        Ok(())
    }
}

impl Default for SoftwareGpu {
    fn default() -> Self {
        Self::new(&GpuSettings::default())
    }
}

impl GpuBackend for SoftwareGpu {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            renderer: "visionflow software rasterizer".to_string(),
            max_texture_size: self.max_texture_size,
            max_texture_units: self.max_texture_units,
        }
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn lose_context(&mut self) -> GpuResult<()> {
        self.lost = true;
        self.textures.clear();
        self.framebuffers.clear();
        self.programs.clear();
        self.buffers.clear();
        self.fences.clear();
        self.units.clear();
        self.bound_framebuffer = None;
        self.current_program = None;
        Ok(())
    }

    fn restore_context(&mut self) -> GpuResult<()> {
        if self.lost {
            self.lost = false;
            self.surface = SoftTexture::new(1, 1);
            self.viewport = (1, 1);
        }
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> GpuResult<TextureId> {
        self.alive()?;
        self.check_size(width, height)?;
        let id = TextureId(self.allocate_id());
        self.textures.insert(id, SoftTexture::new(width, height));
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
        let target = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", texture)))?;
        target.width = width;
        target.height = height;
        target.pixels = bytemuck::cast_slice::<u8, [u8; 4]>(pixels).to_vec();
        self.stats.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.units.retain(|_, bound| *bound != texture);
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> GpuResult<FramebufferId> {
        self.alive()?;
        if !self.textures.contains_key(&texture) {
            return Err(GpuError::InvalidResource(format!("{:?}", texture)));
        }
        let id = FramebufferId(self.allocate_id());
        self.framebuffers.insert(id, texture);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()> {
        self.alive()?;
        if let Some(fb) = framebuffer {
            if !self.framebuffers.contains_key(&fb) {
                return Err(GpuError::InvalidResource(format!("{:?}", fb)));
            }
        }
        self.bound_framebuffer = framebuffer;
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> GpuResult<()> {
        self.alive()?;
        self.check_size(width, height)?;
        if (self.surface.width, self.surface.height) != (width, height) {
            self.surface = SoftTexture::new(width, height);
        }
        Ok(())
    }

    fn viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    fn clear(&mut self, color: [f32; 4]) -> GpuResult<()> {
        self.alive()?;
        let texel = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        self.target_mut()?.pixels.fill(texel);
        self.stats.clears += 1;
        Ok(())
    }

    fn compile_program(&mut self, source: &ProgramSource) -> GpuResult<ProgramId> {
        self.alive()?;

        let fail = |log: String| GpuError::ShaderCompilation {
            name: source.name.clone(),
            details: shader::compile_diagnostics(&source.fragment, &log),
        };

        if let Some(line) = source
            .fragment
            .lines()
            .find(|line| line.trim_start().starts_with("#error"))
        {
            return Err(fail(format!("ERROR: 0:0: '{}'", line.trim())));
        }
        if !source.fragment.contains("void main") {
            return Err(fail("ERROR: 0:0: 'main' : function not defined".to_string()));
        }
        let entry = *self.fragments.get(&source.name).ok_or_else(|| {
            fail(format!(
                "ERROR: 0:0: no software fragment registered for '{}'",
                source.name
            ))
        })?;

        let declarations = shader::parse_uniforms(&source.fragment).map_err(|e| fail(e.to_string()))?;

        let mut names = HashMap::new();
        let mut types = Vec::new();
        for (name, ty) in shader::expand_uniforms(&declarations) {
            names.insert(name, types.len());
            types.push(ty);
        }

        let id = ProgramId(self.allocate_id());
        let values = vec![None; types.len()];
        self.programs.insert(
            id,
            SoftProgram {
                entry,
                names,
                types,
                values,
            },
        );
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        let index = *self.programs.get(&program)?.names.get(name)?;
        Some(UniformLocation {
            program,
            index: index as u32,
        })
    }

    fn use_program(&mut self, program: ProgramId) -> GpuResult<()> {
        self.alive()?;
        if !self.programs.contains_key(&program) {
            return Err(GpuError::InvalidResource(format!("{:?}", program)));
        }
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
        let program = self
            .programs
            .get_mut(&location.program)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", location.program)))?;
        let index = location.index as usize;
        let ty = *program
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
        program.values[index] = Some(value.clone());
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
        if !self.textures.contains_key(&texture) {
            return Err(GpuError::InvalidResource(format!("{:?}", texture)));
        }
        self.units.insert(unit, texture);
        self.stats.texture_binds += 1;
        Ok(())
    }

    fn draw_full_screen_quad(&mut self) -> GpuResult<()> {
        self.alive()?;
        let program_id = self
            .current_program
            .ok_or_else(|| GpuError::InvalidResource("no program in use".to_string()))?;
        let target_id = self.target_texture_id()?;
        let (width, height) = self.viewport;

        let rendered = {
            let program = self
                .programs
                .get(&program_id)
                .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", program_id)))?;

            let mut samplers = HashMap::new();
            for (index, ty) in program.types.iter().enumerate() {
                if !ty.is_sampler() {
                    continue;
                }
                let Some(value) = &program.values[index] else {
                    continue;
                };
                let unit = value.get_i32(0) as u32;
                let Some(texture_id) = self.units.get(&unit) else {
                    continue;
                };
                if Some(*texture_id) == target_id {
                    return Err(GpuError::InvalidResource(
                        "feedback loop between sampler and framebuffer".to_string(),
                    ));
                }
                if let Some(texture) = self.textures.get(texture_id) {
                    samplers.insert(index, texture);
                }
            }

            let mut rendered = Vec::with_capacity(width as usize * height as usize);
            for y in 0..height {
                for x in 0..width {
                    let input = FragmentInput {
                        x,
                        y,
                        width,
                        height,
                        program,
                        samplers: &samplers,
                    };
                    rendered.push((program.entry)(&input));
                }
            }
            rendered
        };

        let target = self.target_mut()?;
        let rows = height.min(target.height) as usize;
        let cols = width.min(target.width) as usize;
        for row in 0..rows {
            let dst = row * target.width as usize;
            let src = row * width as usize;
            target.pixels[dst..dst + cols].copy_from_slice(&rendered[src..src + cols]);
        }
        self.stats.draw_calls += 1;
        Ok(())
    }

    fn copy_to_texture(&mut self, texture: TextureId, width: u32, height: u32) -> GpuResult<()> {
        self.alive()?;
        let source = self.target()?.clone();
        let target = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", texture)))?;

        let rows = height.min(source.height).min(target.height) as usize;
        let cols = width.min(source.width).min(target.width) as usize;
        for row in 0..rows {
            let dst = row * target.width as usize;
            let src = row * source.width as usize;
            target.pixels[dst..dst + cols].copy_from_slice(&source.pixels[src..src + cols]);
        }
        self.stats.copies += 1;
        Ok(())
    }

    fn read_pixels(&mut self, rect: PixelRect, dst: &mut [u8]) -> GpuResult<()> {
        self.alive()?;
        self.read_rect(rect, dst)?;
        self.stats.pixel_reads += 1;
        Ok(())
    }

    fn create_pixel_buffer(&mut self, size: usize) -> GpuResult<BufferId> {
        self.alive()?;
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, vec![0; size]);
        Ok(id)
    }

    fn delete_pixel_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn read_pixels_to_buffer(&mut self, rect: PixelRect, buffer: BufferId) -> GpuResult<()> {
        self.alive()?;
        let mut data = self
            .buffers
            .remove(&buffer)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", buffer)))?;
        let result = self.read_rect(rect, &mut data);
        self.buffers.insert(buffer, data);
        result?;
        self.stats.pixel_reads += 1;
        Ok(())
    }

    fn get_buffer_data(&mut self, buffer: BufferId, dst: &mut [u8]) -> GpuResult<()> {
        self.alive()?;
        let data = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::InvalidResource(format!("{:?}", buffer)))?;
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn fence(&mut self) -> GpuResult<FenceId> {
        self.alive()?;
        let id = FenceId(self.allocate_id());
        self.fences.insert(id, self.fence_latency);
        self.stats.fences += 1;
        Ok(id)
    }

    fn client_wait(&mut self, fence: FenceId) -> FenceStatus {
        if self.lost {
            return FenceStatus::WaitFailed;
        }
        match self.fences.get_mut(&fence) {
            None => FenceStatus::WaitFailed,
            Some(0) => FenceStatus::Signaled,
            Some(remaining) => {
                *remaining -= 1;
                FenceStatus::TimeoutExpired
            }
        }
    }

    fn delete_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn flush(&mut self) {}

    fn stats(&self) -> BackendStats {
        self.stats
    }
}
