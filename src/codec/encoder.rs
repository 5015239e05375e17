//! Two-pass GPU keypoint encoder.

use crate::codec::{encoder_capacity, optimize_encoder_size, RecordLayout, MAX_DESCRIPTOR_SIZE, MAX_ENCODER_LENGTH, MIN_ENCODER_LENGTH};
use crate::config::EncoderSettings;
use crate::gpu::{Gpu, GpuError, GpuResult, Kernel, KernelArg, KernelId, KernelOptions, TextureHandle};
use tracing::trace;

/// Packs a cornerness texture into an `encoder_length²` record texture.
///
/// Pass 1 writes, for every pixel, the distance to the next keypoint in raster
/// order (capped) into channel 2. Pass 2 follows that chain from the origin to
/// locate the keypoint behind each output record.
pub struct KeypointEncoder {
    offsets: Kernel,
    packer: Kernel,
    encoder_length: u32,
    max_chain_steps: u32,
}

impl KeypointEncoder {
    pub fn new(gpu: &Gpu, settings: &EncoderSettings) -> GpuResult<Self> {
        let encoder_length = settings.clamped_initial_length();
        let offsets = Kernel::compile(gpu, KernelId::EncodeOffsets.descriptor(), KernelOptions::new())?;
        let packer = Kernel::compile(
            gpu,
            KernelId::EncodeKeypoints.descriptor(),
            KernelOptions::new().output_size(encoder_length, encoder_length),
        )?;

        Ok(Self {
            offsets,
            packer,
            encoder_length,
            max_chain_steps: settings.chain_cap(),
        })
    }

    /// Side of the square record texture
    pub fn encoder_length(&self) -> u32 {
        self.encoder_length
    }

    pub fn max_chain_steps(&self) -> u32 {
        self.max_chain_steps
    }

    /// Records that fit at the current length
    pub fn capacity(&self, layout: RecordLayout) -> usize {
        encoder_capacity(self.encoder_length, layout)
    }

    /// Resize for an expected number of keypoints; returns the new length.
    pub fn optimize(&mut self, expected_count: usize, layout: RecordLayout) -> u32 {
        self.encoder_length = optimize_encoder_size(expected_count, layout);
        self.encoder_length
    }

    /// Encode with the current length and chain cap.
    pub fn encode_default(&mut self, corners: &TextureHandle, layout: RecordLayout) -> GpuResult<TextureHandle> {
        self.encode(corners, self.max_chain_steps, layout, self.encoder_length)
    }

    /// Run both passes over `corners`.
    ///
    /// The returned texture is recycled by the next call.
    pub fn encode(
        &mut self,
        corners: &TextureHandle,
        max_chain_steps: u32,
        layout: RecordLayout,
        encoder_length: u32,
    ) -> GpuResult<TextureHandle> {
        if layout.descriptor_size > MAX_DESCRIPTOR_SIZE {
            return Err(GpuError::IllegalArgument(format!(
                "descriptor size {} exceeds {} bytes",
                layout.descriptor_size, MAX_DESCRIPTOR_SIZE
            )));
        }
        let encoder_length = encoder_length.clamp(MIN_ENCODER_LENGTH, MAX_ENCODER_LENGTH);
        let chain_cap = max_chain_steps.clamp(1, 255);
        let (width, height) = corners.size();

        self.offsets.resize(width, height)?;
        let offsets = self
            .offsets
            .invoke(&[KernelArg::from(corners), KernelArg::from(chain_cap)])?
            .texture()
            .ok_or_else(|| GpuError::InvalidResource("offset pass produced no texture".to_string()))?;

        self.packer.resize(encoder_length, encoder_length)?;
        let encoded = self
            .packer
            .invoke(&[
                KernelArg::from(offsets),
                KernelArg::from([width, height]),
                KernelArg::from(layout.descriptor_size),
                KernelArg::from(layout.extra_size),
                KernelArg::from(encoder_length),
            ])?
            .texture()
            .ok_or_else(|| GpuError::InvalidResource("packing pass produced no texture".to_string()))?;

        trace!(
            "Encoded {}x{} corners into a {}x{} record texture",
            width,
            height,
            encoder_length,
            encoder_length
        );
        Ok(encoded)
    }
}
