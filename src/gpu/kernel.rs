//! Compiled compute kernels.
//!
//! A [`Kernel`] wraps one shader program, its uniform table and the output
//! framebuffer(s) it renders into. Compilation checks the generated source
//! against the descriptor's parameter list, so a wrong uniform name is a
//! compile-time error. Invocation takes positional [`KernelArg`]s, validates
//! all of them before touching the backend, then renders a full-screen quad.
//!
//! # Output ownership
//!
//! With `recycle` (the default) every invocation renders into the same
//! texture, so the [`TextureHandle`] returned by one call is overwritten by
//! the next call of the same kernel. With `recycle(false)` the result is copied
//! into an [`OwnedTexture`] the caller keeps. With `pingpong(true)` two
//! textures alternate, which lets a kernel read its own previous output.

use crate::gpu::backend::{FramebufferId, ProgramId, ProgramSource, ScalarKind, UniformLocation, UniformType, UniformValue};
use crate::gpu::context::{ContextObserver, Gpu, OwnedTexture, TextureHandle};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::shader::{KernelDescriptor, TEX_SIZE_UNIFORM, VERTEX_SHADER};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Compile-time options of a kernel
#[derive(Debug, Clone)]
pub struct KernelOptions {
    output_size: Option<(u32, u32)>,
    uniforms: Vec<(String, KernelArg)>,
    render_to_texture: bool,
    recycle: bool,
    pingpong: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            output_size: None,
            uniforms: Vec::new(),
            render_to_texture: true,
            recycle: true,
            pingpong: false,
        }
    }
}

impl KernelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial output size (defaults to 1×1)
    pub fn output_size(mut self, width: u32, height: u32) -> Self {
        self.output_size = Some((width, height));
        self
    }

    /// Value set once after compilation
    pub fn uniform(mut self, name: impl Into<String>, value: impl Into<KernelArg>) -> Self {
        self.uniforms.push((name.into(), value.into()));
        self
    }

    /// Render into the display surface instead of a texture when `false`
    pub fn render_to_texture(mut self, enabled: bool) -> Self {
        self.render_to_texture = enabled;
        self
    }

    pub fn recycle(mut self, enabled: bool) -> Self {
        self.recycle = enabled;
        self
    }

    pub fn pingpong(mut self, enabled: bool) -> Self {
        self.pingpong = enabled;
        self
    }
}

/// A positional kernel argument.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Texture(TextureHandle),
    Number(f64),
    Bool(bool),
    Vector(Vec<f64>),
    Array(Vec<KernelArg>),
}

impl KernelArg {
    pub fn array<T: Into<KernelArg>>(items: impl IntoIterator<Item = T>) -> Self {
        KernelArg::Array(items.into_iter().map(Into::into).collect())
    }

    fn describe(&self) -> &'static str {
        match self {
            KernelArg::Texture(_) => "texture",
            KernelArg::Number(_) => "number",
            KernelArg::Bool(_) => "bool",
            KernelArg::Vector(_) => "vector",
            KernelArg::Array(_) => "array",
        }
    }

    /// Convert to the component list of a non-sampler uniform.
    fn to_uniform(&self, ty: UniformType) -> Result<UniformValue, String> {
        let components: Vec<f64> = match self {
            KernelArg::Number(n) => vec![*n],
            KernelArg::Bool(b) => vec![if *b { 1.0 } else { 0.0 }],
            KernelArg::Vector(v) => v.clone(),
            other => return Err(format!("a {} can't be passed as {}", other.describe(), ty)),
        };

        if components.len() != ty.components() {
            return Err(format!(
                "{} expects {} components, got {}",
                ty,
                ty.components(),
                components.len()
            ));
        }
        if components.iter().any(|c| !c.is_finite()) {
            return Err(format!("non-finite value passed as {}", ty));
        }

        Ok(match ty.scalar() {
            ScalarKind::Float => UniformValue::Float(components.iter().map(|&c| c as f32).collect()),
            ScalarKind::Int => UniformValue::Int(components.iter().map(|&c| c as i32).collect()),
            ScalarKind::Uint => {
                if components.iter().any(|&c| c < 0.0) {
                    return Err(format!("negative value passed as {}", ty));
                }
                UniformValue::Uint(components.iter().map(|&c| c as u32).collect())
            }
            ScalarKind::Bool => UniformValue::Bool(components.iter().map(|&c| c != 0.0).collect()),
        })
    }
}

impl From<TextureHandle> for KernelArg {
    fn from(texture: TextureHandle) -> Self {
        KernelArg::Texture(texture)
    }
}

impl From<&TextureHandle> for KernelArg {
    fn from(texture: &TextureHandle) -> Self {
        KernelArg::Texture(*texture)
    }
}

impl From<&OwnedTexture> for KernelArg {
    fn from(texture: &OwnedTexture) -> Self {
        KernelArg::Texture(texture.handle())
    }
}

impl From<bool> for KernelArg {
    fn from(value: bool) -> Self {
        KernelArg::Bool(value)
    }
}

macro_rules! number_arg {
    ($($t:ty),*) => {
        $(
            impl From<$t> for KernelArg {
                fn from(value: $t) -> Self {
                    KernelArg::Number(value as f64)
                }
            }

            impl<const N: usize> From<[$t; N]> for KernelArg {
                fn from(values: [$t; N]) -> Self {
                    KernelArg::Vector(values.iter().map(|&v| v as f64).collect())
                }
            }
        )*
    };
}

number_arg!(f32, f64, i32, u32, usize);

impl From<Vec<f64>> for KernelArg {
    fn from(values: Vec<f64>) -> Self {
        KernelArg::Vector(values)
    }
}

/// Result of an invocation
#[derive(Debug)]
pub enum KernelOutput {
    /// The kernel's own texture, overwritten by its next invocation
    Recycled(TextureHandle),
    /// Independent copy owned by the caller
    Owned(OwnedTexture),
    /// Rendered to the display surface
    Surface { width: u32, height: u32 },
}

impl KernelOutput {
    pub fn texture(&self) -> Option<TextureHandle> {
        match self {
            KernelOutput::Recycled(texture) => Some(*texture),
            KernelOutput::Owned(owned) => Some(owned.handle()),
            KernelOutput::Surface { .. } => None,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            KernelOutput::Recycled(texture) => texture.size(),
            KernelOutput::Owned(owned) => owned.handle().size(),
            KernelOutput::Surface { width, height } => (*width, *height),
        }
    }
}

#[derive(Debug, Clone)]
struct UniformEntry {
    ty: UniformType,
    location: Option<UniformLocation>,
}

#[derive(Debug, Clone, Copy)]
struct RenderTarget {
    texture: TextureHandle,
    framebuffer: FramebufferId,
}

enum Binding {
    Sampler {
        location: Option<UniformLocation>,
        unit: u32,
        texture: TextureHandle,
    },
    Value {
        location: Option<UniformLocation>,
        value: UniformValue,
    },
}

/// A compiled kernel and its output resources.
pub struct Kernel {
    gpu: Gpu,
    descriptor: &'static KernelDescriptor,
    fragment: String,
    table: Vec<(String, UniformType)>,
    program: Option<ProgramId>,
    uniforms: HashMap<String, UniformEntry>,
    defaults: Vec<(String, UniformValue)>,
    targets: Vec<RenderTarget>,
    current: usize,
    width: u32,
    height: u32,
    max_texture_size: u32,
    max_texture_units: u32,
    render_to_texture: bool,
    recycle: bool,
    pingpong: bool,
    size_dirty: bool,
    last_output: Option<TextureHandle>,
    generation: u64,
    observer: ContextObserver,
}

impl Kernel {
    /// Generate, check and compile the program, then allocate the output.
    pub fn compile(
        gpu: &Gpu,
        descriptor: &'static KernelDescriptor,
        options: KernelOptions,
    ) -> GpuResult<Self> {
        let info = gpu.info();
        let (width, height) = options.output_size.unwrap_or((1, 1));
        check_dimensions(width, height, info.max_texture_size)?;

        let fragment = descriptor.fragment_source()?;
        let table = descriptor.uniform_table(&fragment)?;

        let samplers = descriptor.params.iter().filter(|p| p.ty.is_sampler()).count();
        if samplers > info.max_texture_units as usize {
            return Err(GpuError::IllegalArgument(format!(
                "kernel {} needs {} texture units, the backend has {}",
                descriptor.name, samplers, info.max_texture_units
            )));
        }

        let mut defaults = Vec::with_capacity(options.uniforms.len());
        for (name, arg) in &options.uniforms {
            let ty = table
                .iter()
                .find(|(n, _)| n == name && n != TEX_SIZE_UNIFORM)
                .map(|(_, ty)| *ty)
                .ok_or_else(|| GpuError::UniformMismatch {
                    kernel: descriptor.name.to_string(),
                    message: format!("default given for unknown uniform {}", name),
                })?;
            if ty.is_sampler() {
                return Err(GpuError::IllegalArgument(format!(
                    "sampler {} can't have a default value",
                    name
                )));
            }
            let value = arg
                .to_uniform(ty)
                .map_err(|e| GpuError::IllegalArgument(format!("{}: {}", name, e)))?;
            defaults.push((name.clone(), value));
        }

        let mut kernel = Self {
            gpu: gpu.clone(),
            descriptor,
            fragment,
            table,
            program: None,
            uniforms: HashMap::new(),
            defaults,
            targets: Vec::new(),
            current: 0,
            width,
            height,
            max_texture_size: info.max_texture_size,
            max_texture_units: info.max_texture_units,
            render_to_texture: options.render_to_texture,
            recycle: options.recycle,
            pingpong: options.pingpong && options.render_to_texture,
            size_dirty: true,
            last_output: None,
            generation: gpu.generation(),
            observer: gpu.subscribe(),
        };
        kernel.acquire()?;
        debug!(
            "Compiled kernel {} ({}x{}, {} uniforms)",
            descriptor.name,
            width,
            height,
            kernel.table.len()
        );
        Ok(kernel)
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Texture written by the most recent invocation
    pub fn output(&self) -> Option<TextureHandle> {
        self.last_output
    }

    /// Run the kernel with positional arguments.
    ///
    /// Arguments are validated before any GPU command is issued. While the
    /// context is lost this is a no-op returning the last known output.
    pub fn invoke(&mut self, args: &[KernelArg]) -> GpuResult<KernelOutput> {
        let mut bindings = self.prepare(args)?;

        if self.gpu.is_lost() {
            trace!("Kernel {} skipped: context lost", self.name());
            return Ok(self.stale_output());
        }
        if self.sync_context()? {
            // uniform locations belong to the new program
            bindings = self.prepare(args)?;
        }

        let target = self.targets.get(self.current).copied();
        for binding in &bindings {
            if let (Binding::Sampler { texture, .. }, Some(target)) = (binding, target) {
                if texture.id() == target.texture.id() {
                    return Err(GpuError::IllegalArgument(format!(
                        "kernel {} can't read from its own output texture",
                        self.name()
                    )));
                }
            }
            if let Binding::Sampler { texture, .. } = binding {
                self.gpu.ensure_current(texture)?;
            }
        }

        let (width, height) = (self.width, self.height);
        {
            let program = self.program.ok_or_else(|| {
                GpuError::InvalidResource(format!("kernel {} has been released", self.descriptor.name))
            })?;
            let mut backend = self.gpu.backend()?;
            backend.use_program(program)?;

            if self.size_dirty {
                if let Some(location) = self.uniforms.get(TEX_SIZE_UNIFORM).and_then(|u| u.location) {
                    backend.set_uniform(location, &UniformValue::Float(vec![width as f32, height as f32]))?;
                }
                self.size_dirty = false;
            }

            for binding in &bindings {
                match binding {
                    Binding::Sampler {
                        location,
                        unit,
                        texture,
                    } => {
                        backend.bind_texture(*unit, texture.id())?;
                        if let Some(location) = location {
                            backend.set_uniform(*location, &UniformValue::Int(vec![*unit as i32]))?;
                        }
                    }
                    Binding::Value {
                        location: Some(location),
                        value,
                    } => backend.set_uniform(*location, value)?,
                    Binding::Value { location: None, .. } => {}
                }
            }

            match target {
                Some(target) => backend.bind_framebuffer(Some(target.framebuffer))?,
                None => {
                    backend.resize_surface(width, height)?;
                    backend.bind_framebuffer(None)?;
                }
            }
            backend.viewport(width, height);
            backend.draw_full_screen_quad()?;
        }

        let Some(target) = target else {
            self.last_output = None;
            return Ok(KernelOutput::Surface { width, height });
        };

        self.last_output = Some(target.texture);
        if self.pingpong {
            self.current = (self.current + 1) % self.targets.len();
        }

        if self.recycle {
            return Ok(KernelOutput::Recycled(target.texture));
        }

        // the source framebuffer is still bound
        let copy = self.gpu.create_owned_texture(width, height)?;
        self.gpu
            .backend()?
            .copy_to_texture(copy.handle().id(), width, height)?;
        Ok(KernelOutput::Owned(copy))
    }

    /// Reallocate the output at a new size.
    pub fn resize(&mut self, width: u32, height: u32) -> GpuResult<()> {
        check_dimensions(width, height, self.max_texture_size)?;
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }

        self.width = width;
        self.height = height;
        self.size_dirty = true;
        if self.gpu.is_lost() || self.generation != self.gpu.generation() {
            // reallocated on restore
            return Ok(());
        }

        self.release_targets();
        self.create_targets()?;
        trace!("Resized kernel {} to {}x{}", self.name(), width, height);
        Ok(())
    }

    /// Clear the current output texture to a colour.
    pub fn clear(&mut self, color: [f32; 4]) -> GpuResult<Option<TextureHandle>> {
        if self.gpu.is_lost() {
            return Ok(self.last_output);
        }
        self.sync_context()?;

        let target = self.targets.get(self.current).copied();
        let mut backend = self.gpu.backend()?;
        backend.bind_framebuffer(target.map(|t| t.framebuffer))?;
        backend.viewport(self.width, self.height);
        backend.clear(color)?;
        Ok(target.map(|t| t.texture))
    }

    /// Delete the program and output resources.
    pub fn release(&mut self) {
        self.release_targets();
        if let Some(program) = self.program.take() {
            if self.generation == self.gpu.generation() {
                if let Ok(mut backend) = self.gpu.backend() {
                    backend.delete_program(program);
                }
            }
        }
        self.last_output = None;
    }

    /// Validate `args` against the uniform table without touching the GPU.
    fn prepare(&self, args: &[KernelArg]) -> GpuResult<Vec<Binding>> {
        let params = self.descriptor.params;
        if args.len() != params.len() {
            return Err(GpuError::IllegalArgument(format!(
                "incorrect number of arguments for kernel {}: expected {}, got {}",
                self.name(),
                params.len(),
                args.len()
            )));
        }

        let mut bindings = Vec::with_capacity(args.len());
        let mut next_unit = 0u32;

        for (param, arg) in params.iter().zip(args) {
            let bad = |message: String| {
                GpuError::IllegalArgument(format!("kernel {}, argument {}: {}", self.name(), param.name, message))
            };

            if let Some(len) = param.len {
                let elements: Vec<KernelArg> = match arg {
                    KernelArg::Array(items) => items.clone(),
                    KernelArg::Vector(items) => items.iter().map(|&v| KernelArg::Number(v)).collect(),
                    other => return Err(bad(format!("expected an array, got a {}", other.describe()))),
                };
                if elements.len() < len {
                    return Err(bad(format!("too few elements ({} < {})", elements.len(), len)));
                }
                for (i, element) in elements.iter().take(len).enumerate() {
                    let name = format!("{}[{}]", param.name, i);
                    bindings.push(self.bind_one(&name, param.ty, element, &mut next_unit).map_err(bad)?);
                }
            } else {
                bindings.push(self.bind_one(param.name, param.ty, arg, &mut next_unit).map_err(bad)?);
            }
        }

        Ok(bindings)
    }

    fn bind_one(&self, name: &str, ty: UniformType, arg: &KernelArg, next_unit: &mut u32) -> Result<Binding, String> {
        let entry = self
            .uniforms
            .get(name)
            .ok_or_else(|| format!("no uniform named {}", name))?;
        debug_assert_eq!(entry.ty, ty);

        if ty.is_sampler() {
            let KernelArg::Texture(texture) = arg else {
                return Err(format!("expected a texture, got a {}", arg.describe()));
            };
            let unit = *next_unit;
            if unit >= self.max_texture_units {
                return Err(format!("out of texture units ({})", self.max_texture_units));
            }
            *next_unit += 1;
            return Ok(Binding::Sampler {
                location: entry.location,
                unit,
                texture: *texture,
            });
        }

        Ok(Binding::Value {
            location: entry.location,
            value: arg.to_uniform(ty)?,
        })
    }

    fn stale_output(&self) -> KernelOutput {
        match self.last_output.or_else(|| self.targets.get(self.current).map(|t| t.texture)) {
            Some(texture) => KernelOutput::Recycled(texture),
            None => KernelOutput::Surface {
                width: self.width,
                height: self.height,
            },
        }
    }

    /// Reacquire GPU objects if the context was restored since last use.
    ///
    /// Returns `true` if the program was recompiled.
    fn sync_context(&mut self) -> GpuResult<bool> {
        let restored = self.observer.poll_restored();
        if !restored && self.generation == self.gpu.generation() {
            return Ok(false);
        }
        debug!("Reacquiring resources of kernel {}", self.name());
        self.targets.clear();
        self.program = None;
        self.last_output = None;
        self.current = 0;
        self.generation = self.gpu.generation();
        self.acquire()?;
        Ok(true)
    }

    fn acquire(&mut self) -> GpuResult<()> {
        let program = self.gpu.backend()?.compile_program(&ProgramSource {
            name: self.descriptor.name.to_string(),
            vertex: VERTEX_SHADER.to_string(),
            fragment: self.fragment.clone(),
        })?;
        self.program = Some(program);

        {
            let backend = self.gpu.backend()?;
            self.uniforms = self
                .table
                .iter()
                .map(|(name, ty)| {
                    let location = backend.uniform_location(program, name);
                    (name.clone(), UniformEntry { ty: *ty, location })
                })
                .collect();
        }

        if !self.defaults.is_empty() {
            let mut backend = self.gpu.backend()?;
            backend.use_program(program)?;
            for (name, value) in &self.defaults {
                if let Some(location) = self.uniforms.get(name).and_then(|u| u.location) {
                    backend.set_uniform(location, value)?;
                }
            }
        }

        self.size_dirty = true;
        self.create_targets()
    }

    fn create_targets(&mut self) -> GpuResult<()> {
        if !self.render_to_texture {
            return Ok(());
        }
        let count = if self.pingpong { 2 } else { 1 };
        for _ in 0..count {
            let texture = self.gpu.create_texture(self.width, self.height)?;
            let framebuffer = self.gpu.backend()?.create_framebuffer(texture.id())?;
            self.targets.push(RenderTarget {
                texture,
                framebuffer,
            });
        }
        self.current = 0;
        self.last_output = None;
        Ok(())
    }

    fn release_targets(&mut self) {
        let stale = self.generation != self.gpu.generation();
        for target in self.targets.drain(..) {
            if stale {
                continue;
            }
            if let Ok(mut backend) = self.gpu.backend() {
                backend.delete_framebuffer(target.framebuffer);
            }
            self.gpu.delete_texture(&target.texture);
        }
        self.current = 0;
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_dimensions(width: u32, height: u32, max: u32) -> GpuResult<()> {
    if width == 0 || height == 0 || width > max || height > max {
        return Err(GpuError::InvalidDimensions { width, height });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, GpuSettings};
    use crate::gpu::backend::{BackendInfo, MockGpuBackend, PixelRect, ProgramId, TextureId};
    use crate::gpu::library::KernelId;
    use crate::gpu::shader::KernelParam;
    use crate::gpu::software::{FragmentInput, SoftwareGpu};

    fn software() -> Gpu {
        let backend = SoftwareGpu::default()
            .with_fragment("weights", weights)
            .with_fragment("counter", counter);
        Gpu::with_backend(Box::new(backend), EngineConfig::default().gpu).unwrap()
    }

    fn read(gpu: &Gpu, texture: TextureHandle) -> Vec<u8> {
        let mut backend = gpu.backend().unwrap();
        let fb = backend.create_framebuffer(texture.id()).unwrap();
        backend.bind_framebuffer(Some(fb)).unwrap();
        let mut bytes = vec![0; texture.width() as usize * texture.height() as usize * 4];
        backend
            .read_pixels(PixelRect::new(0, 0, texture.width(), texture.height()), &mut bytes)
            .unwrap();
        backend.delete_framebuffer(fb);
        bytes
    }

    fn upload(gpu: &Gpu, width: u32, height: u32, pixels: &[u8]) -> TextureHandle {
        let texture = gpu.create_texture(width, height).unwrap();
        gpu.upload(&texture, width, height, pixels).unwrap()
    }

    fn weights(input: &FragmentInput<'_>) -> [u8; 4] {
        let w = |i: usize| input.float(&format!("weights[{}]", i)) as u8;
        [w(0), w(1), w(2), 255]
    }

    static WEIGHTS: KernelDescriptor = KernelDescriptor {
        name: "weights",
        source: "uniform float weights[3];\nvoid main() { color = vec4(weights[0], weights[1], weights[2], 1.0f); }\n",
        params: &[KernelParam::array("weights", UniformType::Float, 3)],
        defines: &[],
    };

    fn counter(input: &FragmentInput<'_>) -> [u8; 4] {
        let [r, g, b, a] = input.pixel("image");
        [r.saturating_add(1), g, b, a]
    }

    static COUNTER: KernelDescriptor = KernelDescriptor {
        name: "counter",
        source: "uniform sampler2D image;\nvoid main() { color = threadPixel(image) + vec4(1.0f / 255.0f, 0.0f, 0.0f, 0.0f); }\n",
        params: &[KernelParam::new("image", UniformType::Sampler2D)],
        defines: &[],
    };

    fn mock_gpu() -> MockGpuBackend {
        let mut mock = MockGpuBackend::new();
        mock.expect_info().returning(|| BackendInfo {
            renderer: "mock".to_string(),
            max_texture_size: 1024,
            max_texture_units: 8,
        });
        mock.expect_is_context_lost().return_const(false);
        mock.expect_compile_program().returning(|_| Ok(ProgramId(1)));
        mock.expect_uniform_location().returning(|program, _| {
            Some(UniformLocation { program, index: 0 })
        });
        mock.expect_create_texture().returning(|_, _| Ok(TextureId(2)));
        mock.expect_create_framebuffer().returning(|_| Ok(FramebufferId(3)));
        mock.expect_delete_framebuffer().return_const(());
        mock.expect_delete_texture().return_const(());
        mock.expect_delete_program().return_const(());
        mock
    }

    #[test]
    fn test_argument_errors_issue_no_commands() {
        let mut mock = mock_gpu();
        mock.expect_use_program().never();
        mock.expect_set_uniform().never();
        mock.expect_bind_texture().never();
        mock.expect_draw_full_screen_quad().never();

        let gpu = Gpu::new(Box::new(mock), GpuSettings::default());
        gpu.initialize().unwrap();
        let mut kernel = Kernel::compile(
            &gpu,
            KernelId::CornerResponse.descriptor(),
            KernelOptions::new().output_size(4, 4),
        )
        .unwrap();

        let err = kernel.invoke(&[KernelArg::Number(0.5)]).unwrap_err();
        assert!(err.to_string().contains("incorrect number of arguments"));

        let err = kernel
            .invoke(&[KernelArg::Number(1.0), KernelArg::Number(0.5)])
            .unwrap_err();
        assert!(err.to_string().contains("expected a texture"));
    }

    #[test]
    fn test_unknown_default_is_a_compile_error() {
        let gpu = software();
        let result = Kernel::compile(
            &gpu,
            KernelId::CornerResponse.descriptor(),
            KernelOptions::new().uniform("sharpness", 1.0),
        );
        assert!(matches!(result, Err(GpuError::UniformMismatch { .. })));
    }

    #[test]
    fn test_invalid_dimensions() {
        let gpu = software();
        let descriptor = KernelId::Identity.descriptor();
        assert!(matches!(
            Kernel::compile(&gpu, descriptor, KernelOptions::new().output_size(0, 4)),
            Err(GpuError::InvalidDimensions { width: 0, height: 4 })
        ));

        let mut kernel = Kernel::compile(&gpu, descriptor, KernelOptions::new()).unwrap();
        assert!(kernel.resize(1 << 20, 1).is_err());
    }

    #[test]
    fn test_greyscale_invocation() {
        let gpu = software();
        let image = upload(&gpu, 2, 1, &[255, 0, 0, 255, 0, 0, 255, 128]);
        let mut kernel = Kernel::compile(
            &gpu,
            KernelId::Greyscale.descriptor(),
            KernelOptions::new().output_size(2, 1),
        )
        .unwrap();

        let output = kernel.invoke(&[image.into()]).unwrap();
        let bytes = read(&gpu, output.texture().unwrap());
        assert_eq!(bytes, vec![76, 76, 76, 255, 29, 29, 29, 128]);
    }

    #[test]
    fn test_self_feedback_is_rejected() {
        let gpu = software();
        let image = upload(&gpu, 1, 1, &[0, 0, 0, 255]);
        let mut kernel = Kernel::compile(&gpu, &COUNTER, KernelOptions::new()).unwrap();

        let first = kernel.invoke(&[image.into()]).unwrap().texture().unwrap();
        let draws = gpu.stats().draw_calls;
        let err = kernel.invoke(&[first.into()]).unwrap_err();
        assert!(err.to_string().contains("own output"));
        assert_eq!(gpu.stats().draw_calls, draws);
    }

    #[test]
    fn test_pingpong_reads_previous_output() {
        let gpu = software();
        let image = upload(&gpu, 1, 1, &[0, 0, 0, 255]);
        let mut kernel = Kernel::compile(&gpu, &COUNTER, KernelOptions::new().pingpong(true)).unwrap();

        let mut last = kernel.invoke(&[image.into()]).unwrap().texture().unwrap();
        for _ in 0..3 {
            last = kernel.invoke(&[last.into()]).unwrap().texture().unwrap();
        }
        assert_eq!(read(&gpu, last)[0], 4);
    }

    #[test]
    fn test_recycle_false_returns_independent_copy() {
        let gpu = software();
        let image = upload(&gpu, 1, 1, &[10, 0, 0, 255]);
        let mut kernel = Kernel::compile(&gpu, &COUNTER, KernelOptions::new().recycle(false)).unwrap();

        let first = kernel.invoke(&[image.into()]).unwrap();
        let KernelOutput::Owned(owned) = first else {
            panic!("expected an owned texture");
        };
        let other = upload(&gpu, 1, 1, &[100, 0, 0, 255]);
        kernel.invoke(&[other.into()]).unwrap();

        assert_eq!(read(&gpu, owned.handle())[0], 11);
        assert_eq!(read(&gpu, kernel.output().unwrap())[0], 101);
    }

    #[test]
    fn test_array_arguments() {
        let gpu = software();
        let mut kernel = Kernel::compile(&gpu, &WEIGHTS, KernelOptions::new()).unwrap();

        let err = kernel.invoke(&[KernelArg::array([1.0f32, 2.0])]).unwrap_err();
        assert!(err.to_string().contains("too few elements"));

        let output = kernel.invoke(&[KernelArg::array([1.0f32, 2.0, 3.0, 4.0])]).unwrap();
        assert_eq!(read(&gpu, output.texture().unwrap()), vec![1, 2, 3, 255]);
    }

    #[test]
    fn test_display_kernel_renders_to_surface() {
        let gpu = software();
        let image = upload(&gpu, 2, 2, &[9; 16]);
        let mut kernel = Kernel::compile(
            &gpu,
            KernelId::Identity.descriptor(),
            KernelOptions::new().output_size(2, 2).render_to_texture(false),
        )
        .unwrap();

        let output = kernel.invoke(&[image.into()]).unwrap();
        assert!(matches!(output, KernelOutput::Surface { width: 2, height: 2 }));
        assert!(kernel.output().is_none());
    }

    #[test]
    fn test_context_loss_is_a_no_op_until_restore() {
        let gpu = software();
        let mut kernel = Kernel::compile(&gpu, &COUNTER, KernelOptions::new()).unwrap();
        let image = upload(&gpu, 1, 1, &[0, 0, 0, 255]);
        let before = kernel.invoke(&[image.into()]).unwrap().texture().unwrap();

        gpu.lose_context().unwrap();
        let during = kernel.invoke(&[image.into()]).unwrap().texture().unwrap();
        assert_eq!(during, before);
        kernel.resize(2, 2).unwrap();

        gpu.restore_context().unwrap();
        let image = upload(&gpu, 2, 2, &[5; 16]);
        let after = kernel.invoke(&[image.into()]).unwrap().texture().unwrap();
        assert_eq!(after.generation(), 1);
        assert_eq!(after.size(), (2, 2));
        assert_eq!(read(&gpu, after)[0], 6);
    }

    #[test]
    fn test_clear() {
        let gpu = software();
        let mut kernel = Kernel::compile(
            &gpu,
            KernelId::Identity.descriptor(),
            KernelOptions::new().output_size(1, 1),
        )
        .unwrap();
        let texture = kernel.clear([1.0, 0.0, 0.0, 1.0]).unwrap().unwrap();
        assert_eq!(read(&gpu, texture), vec![255, 0, 0, 255]);
    }
}
