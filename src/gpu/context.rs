//! Explicit GPU context object.
//!
//! A [`Gpu`] is a cheaply cloneable, single-threaded handle to one backend.
//! Every kernel, reader and node holds a clone; nothing reaches the backend
//! through a global.
//!
//! # Context loss
//!
//! Loss is recoverable. [`Gpu::lose_context`] and [`Gpu::restore_context`]
//! drive the transition explicitly, and a backend that loses its context on
//! its own is noticed on the next [`Gpu::backend`] call. Subscribers receive
//! [`ContextEvent`]s through a [`ContextObserver`] and reacquire their GPU
//! objects after a restore; each restore bumps the context generation so stale
//! [`TextureHandle`]s can be told apart from fresh ones.

use crate::config::{EngineConfig, GpuSettings};
use crate::gpu::backend::{BackendInfo, BackendStats, GpuBackend, TextureId};
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::software::SoftwareGpu;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Readiness of the GPU context. Only `Ready` permits GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
    Lost,
}

/// Notification sent to context subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    Lost,
    Restored { generation: u64 },
}

/// Receiving end of the context event channel.
#[derive(Debug)]
pub struct ContextObserver {
    rx: Receiver<ContextEvent>,
}

impl ContextObserver {
    /// Next pending event, if any.
    pub fn try_next(&self) -> Option<ContextEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain pending events and report whether the context was restored.
    pub fn poll_restored(&self) -> bool {
        let mut restored = false;
        while let Some(event) = self.try_next() {
            if let ContextEvent::Restored { .. } = event {
                restored = true;
            }
        }
        restored
    }
}

/// Reference to a texture owned by a kernel or node.
///
/// Plain value; it does not keep the texture alive. A handle from an older
/// context generation refers to an object that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    id: TextureId,
    width: u32,
    height: u32,
    generation: u64,
}

impl TextureHandle {
    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn resized(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self
        }
    }
}

/// Texture deleted when dropped.
pub struct OwnedTexture {
    gpu: Gpu,
    handle: TextureHandle,
}

impl OwnedTexture {
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }
}

impl fmt::Debug for OwnedTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedTexture").field(&self.handle).finish()
    }
}

impl Drop for OwnedTexture {
    fn drop(&mut self) {
        self.gpu.delete_texture(&self.handle);
    }
}

struct GpuInner {
    backend: RefCell<Box<dyn GpuBackend>>,
    state: Cell<ContextState>,
    generation: Cell<u64>,
    subscribers: RefCell<Vec<Sender<ContextEvent>>>,
    settings: GpuSettings,
}

/// Shared handle to the GPU context.
#[derive(Clone)]
pub struct Gpu {
    inner: Rc<GpuInner>,
}

impl fmt::Debug for Gpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpu")
            .field("state", &self.inner.state.get())
            .field("generation", &self.inner.generation.get())
            .finish()
    }
}

impl Gpu {
    /// Wrap a backend. The context starts `Uninitialized`.
    pub fn new(backend: Box<dyn GpuBackend>, settings: GpuSettings) -> Self {
        Self {
            inner: Rc::new(GpuInner {
                backend: RefCell::new(backend),
                state: Cell::new(ContextState::Uninitialized),
                generation: Cell::new(0),
                subscribers: RefCell::new(Vec::new()),
                settings,
            }),
        }
    }

    /// Wrap a backend and bring the context to `Ready`.
    pub fn with_backend(backend: Box<dyn GpuBackend>, settings: GpuSettings) -> GpuResult<Self> {
        let gpu = Self::new(backend, settings);
        gpu.initialize()?;
        Ok(gpu)
    }

    /// Initialized context on the bundled software rasterizer.
    pub fn software(config: &EngineConfig) -> GpuResult<Self> {
        let backend = SoftwareGpu::new(&config.gpu);
        Self::with_backend(Box::new(backend), config.gpu.clone())
    }

    /// Initialized context on an OpenGL ES 3.0 / WebGL2 context.
    ///
    /// The context must be current on the calling thread for the lifetime of
    /// the returned handle.
    #[cfg(feature = "glow")]
    pub fn gl(context: glow::Context, config: &EngineConfig) -> GpuResult<Self> {
        let backend = crate::gpu::gl::GlBackend::new(context, &config.gpu)?;
        Self::with_backend(Box::new(backend), config.gpu.clone())
    }

    /// `Uninitialized → Loading → Ready | Failed`
    pub fn initialize(&self) -> GpuResult<()> {
        match self.state() {
            ContextState::Ready => return Ok(()),
            ContextState::Loading => return Err(GpuError::NotReady(ContextState::Loading)),
            _ => {}
        }

        self.inner.state.set(ContextState::Loading);
        let backend = self.inner.backend.borrow();
        let info = backend.info();

        if backend.is_context_lost() {
            self.inner.state.set(ContextState::Failed);
            return Err(GpuError::InitializationFailed(
                "context lost during initialization".to_string(),
            ));
        }
        if info.max_texture_size == 0 || info.max_texture_units == 0 {
            self.inner.state.set(ContextState::Failed);
            return Err(GpuError::InitializationFailed(format!(
                "{} reports no usable texture limits",
                info.renderer
            )));
        }

        info!(
            "GPU ready: {} (max texture {}, {} units)",
            info.renderer, info.max_texture_size, info.max_texture_units
        );
        self.inner.state.set(ContextState::Ready);
        Ok(())
    }

    pub fn state(&self) -> ContextState {
        self.inner.state.get()
    }

    pub fn is_lost(&self) -> bool {
        self.check_context();
        self.state() == ContextState::Lost
    }

    /// Number of restores since creation
    pub fn generation(&self) -> u64 {
        self.inner.generation.get()
    }

    pub fn settings(&self) -> &GpuSettings {
        &self.inner.settings
    }

    pub fn info(&self) -> BackendInfo {
        self.inner.backend.borrow().info()
    }

    pub fn stats(&self) -> BackendStats {
        self.inner.backend.borrow().stats()
    }

    /// Mutable access to the backend while the context is `Ready`.
    ///
    /// The borrow must not be held across an `.await`.
    pub fn backend(&self) -> GpuResult<RefMut<'_, Box<dyn GpuBackend>>> {
        self.check_context();
        match self.state() {
            ContextState::Ready => {}
            ContextState::Lost => return Err(GpuError::ContextLost),
            state => return Err(GpuError::NotReady(state)),
        }
        self.raw_backend()
    }

    fn raw_backend(&self) -> GpuResult<RefMut<'_, Box<dyn GpuBackend>>> {
        self.inner
            .backend
            .try_borrow_mut()
            .map_err(|_| GpuError::InvalidResource("GPU backend is already borrowed".to_string()))
    }

    /// Register for context loss/restore notifications.
    pub fn subscribe(&self) -> ContextObserver {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.subscribers.borrow_mut().push(tx);
        ContextObserver { rx }
    }

    /// Drop every GPU object and enter the `Lost` state.
    pub fn lose_context(&self) -> GpuResult<()> {
        if self.state() == ContextState::Lost {
            return Ok(());
        }
        self.raw_backend()?.lose_context()?;
        self.mark_lost();
        Ok(())
    }

    /// Bring a lost context back and notify subscribers.
    pub fn restore_context(&self) -> GpuResult<()> {
        self.check_context();
        if self.state() != ContextState::Lost {
            return Ok(());
        }
        self.raw_backend()?.restore_context()?;

        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);
        self.inner.state.set(ContextState::Ready);
        info!("GPU context restored (generation {})", generation);
        self.notify(ContextEvent::Restored { generation });
        Ok(())
    }

    /// Submit pending commands. No-op while lost.
    pub fn flush(&self) {
        if let Ok(mut backend) = self.backend() {
            backend.flush();
        }
    }

    pub fn create_texture(&self, width: u32, height: u32) -> GpuResult<TextureHandle> {
        let id = self.backend()?.create_texture(width, height)?;
        debug!("Created texture {:?} ({}x{})", id, width, height);
        Ok(TextureHandle {
            id,
            width,
            height,
            generation: self.generation(),
        })
    }

    pub fn create_owned_texture(&self, width: u32, height: u32) -> GpuResult<OwnedTexture> {
        let handle = self.create_texture(width, height)?;
        Ok(OwnedTexture {
            gpu: self.clone(),
            handle,
        })
    }

    /// Replace the contents of `texture` with `width × height` RGBA bytes.
    pub fn upload(
        &self,
        texture: &TextureHandle,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> GpuResult<TextureHandle> {
        self.ensure_current(texture)?;
        self.backend()?
            .upload_texture(texture.id, width, height, pixels)?;
        Ok(texture.resized(width, height))
    }

    /// Delete a texture. Skipped for handles from an older generation.
    pub fn delete_texture(&self, texture: &TextureHandle) {
        if texture.generation != self.generation() {
            return;
        }
        if let Ok(mut backend) = self.backend() {
            backend.delete_texture(texture.id);
            debug!("Deleted texture {:?}", texture.id);
        }
    }

    /// Fail with `InvalidResource` if `texture` predates the last restore.
    pub fn ensure_current(&self, texture: &TextureHandle) -> GpuResult<()> {
        if texture.generation != self.generation() {
            return Err(GpuError::InvalidResource(format!(
                "{:?} belongs to context generation {} (current {})",
                texture.id,
                texture.generation,
                self.generation()
            )));
        }
        Ok(())
    }

    fn check_context(&self) {
        if self.state() != ContextState::Ready {
            return;
        }
        let lost = match self.inner.backend.try_borrow() {
            Ok(backend) => backend.is_context_lost(),
            Err(_) => false,
        };
        if lost {
            self.mark_lost();
        }
    }

    fn mark_lost(&self) {
        warn!("GPU context lost");
        self.inner.state.set(ContextState::Lost);
        self.notify(ContextEvent::Lost);
    }

    fn notify(&self, event: ContextEvent) {
        self.inner
            .subscribers
            .borrow_mut()
            .retain(|tx| tx.send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::backend::MockGpuBackend;

    fn software() -> Gpu {
        Gpu::software(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_state_machine() {
        let gpu = Gpu::new(Box::<SoftwareGpu>::default(), GpuSettings::default());
        assert_eq!(gpu.state(), ContextState::Uninitialized);
        assert!(matches!(gpu.backend(), Err(GpuError::NotReady(ContextState::Uninitialized))));

        gpu.initialize().unwrap();
        assert_eq!(gpu.state(), ContextState::Ready);
        assert!(gpu.backend().is_ok());
    }

    #[test]
    fn test_failed_initialization() {
        let mut mock = MockGpuBackend::new();
        mock.expect_info().returning(|| BackendInfo {
            renderer: "mock".to_string(),
            max_texture_size: 0,
            max_texture_units: 0,
        });
        mock.expect_is_context_lost().return_const(false);

        let gpu = Gpu::new(Box::new(mock), GpuSettings::default());
        assert!(matches!(gpu.initialize(), Err(GpuError::InitializationFailed(_))));
        assert_eq!(gpu.state(), ContextState::Failed);
    }

    #[test]
    fn test_loss_and_restore_notify_observers() {
        let gpu = software();
        let observer = gpu.subscribe();

        gpu.lose_context().unwrap();
        assert!(gpu.is_lost());
        assert_eq!(observer.try_next(), Some(ContextEvent::Lost));
        assert!(matches!(gpu.create_texture(2, 2), Err(GpuError::ContextLost)));

        gpu.restore_context().unwrap();
        assert_eq!(gpu.generation(), 1);
        assert!(observer.poll_restored());
        assert!(!observer.poll_restored());
    }

    #[test]
    fn test_stale_handles() {
        let gpu = software();
        let texture = gpu.create_texture(2, 2).unwrap();
        gpu.lose_context().unwrap();
        gpu.restore_context().unwrap();

        assert!(matches!(
            gpu.upload(&texture, 1, 1, &[0; 4]),
            Err(GpuError::InvalidResource(_))
        ));
        // must not touch the new generation's objects
        gpu.delete_texture(&texture);
    }

    fn counting_mock() -> MockGpuBackend {
        let mut mock = MockGpuBackend::new();
        mock.expect_info().returning(|| BackendInfo {
            renderer: "mock".to_string(),
            max_texture_size: 64,
            max_texture_units: 4,
        });
        mock.expect_is_context_lost().return_const(false);
        mock.expect_create_texture().returning(|_, _| Ok(TextureId(7)));
        mock
    }

    #[test]
    fn test_owned_texture_is_deleted_on_drop() {
        let mut mock = counting_mock();
        mock.expect_upload_texture().times(1).returning(|_, _, _, _| Ok(()));
        mock.expect_delete_texture()
            .withf(|id| *id == TextureId(7))
            .times(1)
            .return_const(());
        let gpu = Gpu::with_backend(Box::new(mock), GpuSettings::default()).unwrap();

        {
            let owned = gpu.create_owned_texture(4, 4).unwrap();
            let uploaded = gpu.upload(&owned.handle(), 1, 1, &[1, 2, 3, 4]).unwrap();
            assert_eq!(uploaded.size(), (1, 1));
        }
        // the mock panics on drop if delete_texture was not called exactly once
    }

    #[test]
    fn test_stale_owned_texture_is_not_deleted() {
        let mut mock = counting_mock();
        mock.expect_lose_context().returning(|| Ok(()));
        mock.expect_restore_context().returning(|| Ok(()));
        mock.expect_delete_texture().times(0);
        let gpu = Gpu::with_backend(Box::new(mock), GpuSettings::default()).unwrap();

        let owned = gpu.create_owned_texture(4, 4).unwrap();
        gpu.lose_context().unwrap();
        gpu.restore_context().unwrap();
        drop(owned);
    }
}
