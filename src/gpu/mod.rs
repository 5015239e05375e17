//! GPU layer: backend seam, context, shaders, kernels and pixel transfers.
//!
//! # Architecture
//!
//! ```text
//! Kernel ──► Gpu (context, observer) ──► dyn GpuBackend (GlBackend, SoftwareGpu)
//!   │                                        ▲
//!   └── KernelDescriptor (library) ──► shader preprocessor
//! AsyncReader ──► Gpu ──► pixel buffers + fences
//! ```
//!
//! Everything runs on one thread. [`Gpu`] hands out short-lived mutable
//! borrows of the backend; none of them may live across an `.await`.

pub mod backend;
pub mod context;
pub mod error;
#[cfg(feature = "glow")]
pub mod gl;
pub mod kernel;
pub mod library;
pub mod reader;
pub mod shader;
pub mod software;

pub use backend::{BackendInfo, BackendStats, GpuBackend, PixelRect, TextureId, UniformType};
pub use context::{ContextEvent, ContextObserver, ContextState, Gpu, OwnedTexture, TextureHandle};
pub use error::{GpuError, GpuResult};
pub use kernel::{Kernel, KernelArg, KernelOptions, KernelOutput};
pub use library::KernelId;
pub use reader::AsyncReader;
pub use shader::{KernelDescriptor, KernelParam};
pub use software::{FragmentFn, FragmentInput, SoftwareGpu};

#[cfg(feature = "glow")]
pub use gl::GlBackend;
