//! GPU → CPU pixel transfers.
//!
//! [`AsyncReader`] offers three ways to get pixels out of a texture:
//!
//! - [`AsyncReader::read_sync`]: blocking read into a reused CPU buffer.
//! - [`AsyncReader::read_async`] with `buffered = false`: read into a pixel
//!   buffer object, insert a fence and poll it until the transfer completes.
//! - [`AsyncReader::read_async`] with `buffered = true`: a ring of N slots with
//!   independent producer and consumer cursors. Each call starts at most one
//!   new transfer and returns the oldest completed one, so a result may be up
//!   to N-1 calls stale but the caller never waits on the transfer it just
//!   issued.
//!
//! CPU buffers only grow. While the context is lost every read resolves
//! immediately with whatever the buffer currently holds.

use crate::config::{PollingStrategy, ReaderSettings};
use crate::gpu::backend::{BufferId, FenceId, FenceStatus, FramebufferId, GpuBackend, PixelRect};
use crate::gpu::context::{ContextObserver, Gpu, TextureHandle};
use crate::gpu::error::{GpuError, GpuResult};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One producer/consumer slot
#[derive(Debug, Default)]
struct Slot {
    data: Vec<u8>,
    pbo: Option<BufferId>,
    fence: Option<FenceId>,
    /// GPU transfer in flight
    busy: bool,
    /// transfer finished, not consumed yet
    ready: bool,
}

impl Slot {
    /// Copy the finished transfer into CPU memory.
    fn finish(&mut self, backend: &mut dyn GpuBackend) -> GpuResult<()> {
        if let Some(pbo) = self.pbo {
            backend.get_buffer_data(pbo, &mut self.data)?;
        }
        self.cancel(backend);
        self.ready = true;
        Ok(())
    }

    fn cancel(&mut self, backend: &mut dyn GpuBackend) {
        if let Some(fence) = self.fence.take() {
            backend.delete_fence(fence);
        }
        self.busy = false;
        self.ready = false;
    }

    /// Drop GPU object ids without deleting them (context was lost).
    fn forget(&mut self) {
        self.pbo = None;
        self.fence = None;
        self.busy = false;
        self.ready = false;
    }
}

/// Reads pixels of textures, synchronously or through fences.
pub struct AsyncReader {
    gpu: Gpu,
    polling: PollingStrategy,
    frame_interval: Duration,
    max_attempts: u32,
    sync_buffer: Vec<u8>,
    transfer: Option<(BufferId, usize)>,
    slots: Vec<Slot>,
    capacity: usize,
    producer: usize,
    consumer: usize,
    last_consumed: usize,
    framebuffer: Option<(TextureHandle, FramebufferId)>,
    generation: u64,
    observer: ContextObserver,
}

impl AsyncReader {
    pub fn new(gpu: &Gpu, settings: &ReaderSettings) -> GpuResult<Self> {
        let buffers = settings.buffers;
        if buffers < 2 {
            return Err(GpuError::IllegalArgument(format!(
                "a buffered reader needs at least 2 slots, got {}",
                buffers
            )));
        }

        let gpu_settings = gpu.settings();
        Ok(Self {
            gpu: gpu.clone(),
            polling: gpu_settings.polling,
            frame_interval: gpu_settings.frame_interval(),
            max_attempts: gpu_settings.max_fence_attempts.max(1),
            sync_buffer: Vec::new(),
            transfer: None,
            slots: (0..buffers).map(|_| Slot::default()).collect(),
            capacity: 0,
            producer: 0,
            consumer: buffers - 1,
            last_consumed: buffers - 1,
            framebuffer: None,
            generation: gpu.generation(),
            observer: gpu.subscribe(),
        })
    }

    /// Number of slots in the buffered ring
    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    /// Blocking read of `rect` (the whole texture if `None`).
    pub fn read_sync(&mut self, texture: &TextureHandle, rect: Option<PixelRect>) -> GpuResult<&[u8]> {
        let rect = region(texture, rect);
        let len = rect.byte_len();
        grow(&mut self.sync_buffer, len);

        if len == 0 || self.gpu.is_lost() {
            return Ok(&self.sync_buffer[..len]);
        }
        self.sync_context();
        let framebuffer = self.framebuffer_for(texture)?;

        let mut backend = self.gpu.backend()?;
        backend.bind_framebuffer(Some(framebuffer))?;
        backend.read_pixels(rect, &mut self.sync_buffer[..len])?;
        Ok(&self.sync_buffer[..len])
    }

    /// Fence-gated read of `rect` (the whole texture if `None`).
    ///
    /// Fails with [`GpuError::Timeout`] if the fence does not signal within the
    /// configured number of polls.
    pub async fn read_async(
        &mut self,
        texture: &TextureHandle,
        rect: Option<PixelRect>,
        buffered: bool,
    ) -> GpuResult<&[u8]> {
        let rect = region(texture, rect);
        if buffered {
            self.read_buffered(texture, rect).await
        } else {
            self.read_direct(texture, rect).await
        }
    }

    /// Delete every GPU object owned by the reader.
    pub fn release(&mut self) {
        let current = self.generation == self.gpu.generation();
        let backend = if current { self.gpu.backend().ok() } else { None };

        match backend {
            Some(mut backend) => {
                for slot in &mut self.slots {
                    slot.cancel(&mut **backend);
                    if let Some(pbo) = slot.pbo.take() {
                        backend.delete_pixel_buffer(pbo);
                    }
                }
                if let Some((pbo, _)) = self.transfer.take() {
                    backend.delete_pixel_buffer(pbo);
                }
                if let Some((_, framebuffer)) = self.framebuffer.take() {
                    backend.delete_framebuffer(framebuffer);
                }
            }
            None => {
                self.slots.iter_mut().for_each(Slot::forget);
                self.transfer = None;
                self.framebuffer = None;
            }
        }
    }

    async fn read_direct(&mut self, texture: &TextureHandle, rect: PixelRect) -> GpuResult<&[u8]> {
        let len = rect.byte_len();
        grow(&mut self.sync_buffer, len);

        if len == 0 || self.gpu.is_lost() {
            return Ok(&self.sync_buffer[..len]);
        }
        self.sync_context();
        let framebuffer = self.framebuffer_for(texture)?;
        let pbo = self.transfer_buffer(len)?;

        let fence = {
            let mut backend = self.gpu.backend()?;
            backend.bind_framebuffer(Some(framebuffer))?;
            backend.read_pixels_to_buffer(rect, pbo)?;
            let fence = backend.fence()?;
            backend.flush();
            fence
        };

        match self.wait_fence(fence).await {
            Ok(()) => {}
            Err(GpuError::ContextLost) => {
                warn!("Context lost while waiting for a transfer, returning stale pixels");
                return Ok(&self.sync_buffer[..len]);
            }
            Err(e) => {
                if let Ok(mut backend) = self.gpu.backend() {
                    backend.delete_fence(fence);
                }
                return Err(e);
            }
        }

        let mut backend = self.gpu.backend()?;
        backend.get_buffer_data(pbo, &mut self.sync_buffer[..len])?;
        backend.delete_fence(fence);
        Ok(&self.sync_buffer[..len])
    }

    async fn read_buffered(&mut self, texture: &TextureHandle, rect: PixelRect) -> GpuResult<&[u8]> {
        let len = rect.byte_len();
        self.reallocate(len);

        if len == 0 || self.gpu.is_lost() {
            return Ok(&self.slots[self.last_consumed].data[..len]);
        }
        self.sync_context();
        self.pump()?;
        self.produce(texture, rect)?;

        let index = self.consumer;
        self.consumer = (index + 1) % self.slots.len();
        self.last_consumed = index;

        if let (true, Some(fence)) = (self.slots[index].busy, self.slots[index].fence) {
            match self.wait_fence(fence).await {
                Ok(()) => {
                    let mut backend = self.gpu.backend()?;
                    self.slots[index].finish(&mut **backend)?;
                }
                Err(GpuError::ContextLost) => {
                    warn!("Context lost while waiting for slot {}, returning stale pixels", index);
                    return Ok(&self.slots[index].data[..len]);
                }
                Err(e) => {
                    if let Ok(mut backend) = self.gpu.backend() {
                        self.slots[index].cancel(&mut **backend);
                    }
                    return Err(e);
                }
            }
        }

        let slot = &mut self.slots[index];
        slot.ready = false;
        Ok(&slot.data[..len])
    }

    /// Start a transfer into the producer slot unless it is still busy.
    fn produce(&mut self, texture: &TextureHandle, rect: PixelRect) -> GpuResult<()> {
        let index = self.producer;
        if self.slots[index].busy {
            trace!("Slot {} still busy, skipping transfer", index);
            return Ok(());
        }

        let framebuffer = self.framebuffer_for(texture)?;
        let pbo = match self.slots[index].pbo {
            Some(pbo) => pbo,
            None => {
                let pbo = self.gpu.backend()?.create_pixel_buffer(self.capacity)?;
                self.slots[index].pbo = Some(pbo);
                pbo
            }
        };

        let mut backend = self.gpu.backend()?;
        backend.bind_framebuffer(Some(framebuffer))?;
        backend.read_pixels_to_buffer(rect, pbo)?;
        let fence = backend.fence()?;
        backend.flush();

        let slot = &mut self.slots[index];
        slot.fence = Some(fence);
        slot.busy = true;
        slot.ready = false;
        self.producer = (index + 1) % self.slots.len();
        Ok(())
    }

    /// Complete every transfer whose fence has signaled.
    fn pump(&mut self) -> GpuResult<()> {
        let mut backend = self.gpu.backend()?;
        for slot in self.slots.iter_mut().filter(|s| s.busy) {
            let Some(fence) = slot.fence else {
                slot.busy = false;
                continue;
            };
            match backend.client_wait(fence) {
                FenceStatus::Signaled => slot.finish(&mut **backend)?,
                FenceStatus::TimeoutExpired => {}
                FenceStatus::WaitFailed => slot.cancel(&mut **backend),
            }
        }
        Ok(())
    }

    async fn wait_fence(&self, fence: FenceId) -> GpuResult<()> {
        for _ in 0..self.max_attempts {
            let status = self.gpu.backend()?.client_wait(fence);
            match status {
                FenceStatus::Signaled => return Ok(()),
                FenceStatus::WaitFailed if self.gpu.is_lost() => return Err(GpuError::ContextLost),
                FenceStatus::WaitFailed => return Err(GpuError::WaitFailed),
                FenceStatus::TimeoutExpired => self.pause().await,
            }
        }
        Err(GpuError::Timeout(format!(
            "{:?} not signaled after {} polls",
            fence, self.max_attempts
        )))
    }

    async fn pause(&self) {
        match self.polling {
            PollingStrategy::Asap => tokio::task::yield_now().await,
            PollingStrategy::PerFrame => tokio::time::sleep(self.frame_interval).await,
        }
    }

    /// Grow every slot to hold `size` bytes. Pending transfers are dropped.
    fn reallocate(&mut self, size: usize) {
        if size <= self.capacity {
            return;
        }
        debug!("Growing reader slots from {} to {} bytes", self.capacity, size);

        let backend = if self.generation == self.gpu.generation() {
            self.gpu.backend().ok()
        } else {
            None
        };
        match backend {
            Some(mut backend) => {
                for slot in &mut self.slots {
                    slot.cancel(&mut **backend);
                    if let Some(pbo) = slot.pbo.take() {
                        backend.delete_pixel_buffer(pbo);
                    }
                }
            }
            None => self.slots.iter_mut().for_each(Slot::forget),
        }

        for slot in &mut self.slots {
            let fresh = slot.data.len() < 4;
            grow(&mut slot.data, size);
            if fresh {
                // an unproduced slot decodes as an empty list
                slot.data[..4].fill(0xFF);
            }
        }
        self.capacity = size;
    }

    fn transfer_buffer(&mut self, size: usize) -> GpuResult<BufferId> {
        if let Some((pbo, capacity)) = self.transfer {
            if capacity >= size {
                return Ok(pbo);
            }
            self.gpu.backend()?.delete_pixel_buffer(pbo);
            self.transfer = None;
        }
        let capacity = size.max(self.sync_buffer.len());
        let pbo = self.gpu.backend()?.create_pixel_buffer(capacity)?;
        self.transfer = Some((pbo, capacity));
        Ok(pbo)
    }

    /// Framebuffer attached to `texture`, cached across calls.
    fn framebuffer_for(&mut self, texture: &TextureHandle) -> GpuResult<FramebufferId> {
        self.gpu.ensure_current(texture)?;
        if let Some((cached, framebuffer)) = self.framebuffer {
            if cached.id() == texture.id() {
                return Ok(framebuffer);
            }
        }

        let mut backend = self.gpu.backend()?;
        if let Some((_, old)) = self.framebuffer.take() {
            backend.delete_framebuffer(old);
        }
        let framebuffer = backend.create_framebuffer(texture.id())?;
        self.framebuffer = Some((*texture, framebuffer));
        Ok(framebuffer)
    }

    fn sync_context(&mut self) {
        let restored = self.observer.poll_restored();
        if restored || self.generation != self.gpu.generation() {
            debug!("Reader dropping GPU objects of generation {}", self.generation);
            self.forget_gpu_objects();
            self.generation = self.gpu.generation();
        }
    }

    fn forget_gpu_objects(&mut self) {
        self.slots.iter_mut().for_each(Slot::forget);
        self.transfer = None;
        self.framebuffer = None;
    }
}

impl Drop for AsyncReader {
    fn drop(&mut self) {
        self.release();
    }
}

fn region(texture: &TextureHandle, rect: Option<PixelRect>) -> PixelRect {
    rect.unwrap_or_else(|| PixelRect::new(0, 0, texture.width(), texture.height()))
        .clamp_to(texture.width(), texture.height())
}

fn grow(buffer: &mut Vec<u8>, size: usize) {
    if buffer.len() < size {
        buffer.resize(size, 0);
    }
}
