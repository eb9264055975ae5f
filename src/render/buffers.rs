//! Render buffers: per-pixel accumulation storage owned by the caller.

use std::sync::Arc;

use crate::device::{BufferId, DeviceMemory, DeviceQueue, DeviceVector, PassRegion};
use crate::util::{Result, Vec3};

/// Floats per pixel in the render buffer.
pub const PASS_STRIDE: usize = 8;
/// Offset of the combined RGB sum; `+3` holds the number of samples taken.
pub const PASS_COMBINED: usize = 0;
/// Offset of the combined sample count.
pub const PASS_SAMPLE_COUNT: usize = 3;
/// Offset of the RGB sum of squared samples.
pub const PASS_COMBINED_SQUARED: usize = 4;
/// Offset of the adaptive sampling flag, `1.0` once a pixel converged.
pub const PASS_ADAPTIVE_CONVERGED: usize = 7;

/// Size and placement of a render buffer within the full frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferParams {
    pub width: usize,
    pub height: usize,
    /// Corner of the buffer in full-frame pixel coordinates.
    pub full_x: i32,
    pub full_y: i32,
}

impl BufferParams {
    /// Buffer covering a `width` × `height` frame from the origin.
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, full_x: 0, full_y: 0 }
    }

    /// Number of pixels.
    #[inline]
    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    /// Offset and stride such that full-frame pixel `(x, y)` is stored at
    /// buffer pixel `offset + x + y * stride`.
    #[inline]
    pub fn get_offset_stride(&self) -> (i32, i32) {
        let stride = self.width as i32;
        let offset = -(self.full_x + self.full_y * stride);
        (offset, stride)
    }

    /// Region covering the whole buffer, for film and adaptive kernels.
    pub fn pass_region(&self) -> PassRegion {
        let (offset, stride) = self.get_offset_stride();
        PassRegion {
            full_x: self.full_x,
            full_y: self.full_y,
            width: self.width as i32,
            height: self.height as i32,
            offset,
            stride,
        }
    }
}

/// Device-resident accumulation buffer with a host mirror.
pub struct RenderBuffers {
    pub params: BufferParams,
    pub buffer: DeviceVector<f32>,
}

impl RenderBuffers {
    /// Create an unallocated buffer.
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        Self {
            params: BufferParams::new(0, 0),
            buffer: DeviceVector::new(memory, "render_buffer"),
        }
    }

    /// Allocate storage for `params` and queue zeroing it.
    pub fn reset<Q: DeviceQueue>(&mut self, params: BufferParams, queue: &mut Q) -> Result<()> {
        if params != self.params || self.buffer.size() != params.num_pixels() * PASS_STRIDE {
            self.buffer.alloc(params.num_pixels() * PASS_STRIDE)?;
        }
        self.params = params;
        self.zero(queue);
        Ok(())
    }

    /// Queue zeroing of all passes.
    pub fn zero<Q: DeviceQueue>(&self, queue: &mut Q) {
        self.buffer.zero_to_device(queue);
    }

    /// Device handle of the buffer.
    pub fn device_pointer(&self) -> Option<BufferId> {
        self.buffer.device_pointer()
    }

    /// Read the buffer back into the host mirror (after synchronization).
    pub fn copy_from_device(&mut self) -> Result<()> {
        self.buffer.copy_from_device()
    }

    /// Host-side passes of one pixel.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let index = (y * self.params.width + x) * PASS_STRIDE;
        &self.buffer.data()[index..index + PASS_STRIDE]
    }

    /// Number of samples accumulated in a pixel (host mirror).
    pub fn sample_count(&self, x: usize, y: usize) -> u32 {
        self.pixel(x, y)[PASS_SAMPLE_COUNT] as u32
    }

    /// Mean radiance of a pixel (host mirror).
    pub fn mean(&self, x: usize, y: usize) -> Vec3 {
        let p = self.pixel(x, y);
        let n = p[PASS_SAMPLE_COUNT];
        if n <= 0.0 {
            Vec3::ZERO
        } else {
            Vec3::new(p[PASS_COMBINED], p[PASS_COMBINED + 1], p[PASS_COMBINED + 2]) / n
        }
    }

    /// Whether adaptive sampling marked the pixel converged (host mirror).
    pub fn is_converged(&self, x: usize, y: usize) -> bool {
        self.pixel(x, y)[PASS_ADAPTIVE_CONVERGED] >= 0.5
    }

    /// Sum of samples over all pixels (host mirror).
    pub fn total_samples(&self) -> u64 {
        self.buffer
            .data()
            .chunks_exact(PASS_STRIDE)
            .map(|p| p[PASS_SAMPLE_COUNT] as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu::CpuDevice;
    use crate::device::Device;

    #[test]
    fn test_offset_stride() {
        let params = BufferParams { width: 10, height: 5, full_x: 3, full_y: 2 };
        let (offset, stride) = params.get_offset_stride();
        assert_eq!(stride, 10);
        assert_eq!(offset + 3 + 2 * stride, 0);
        assert_eq!(params.pass_region().buffer_pixel(9, 4), 49);
    }

    #[test]
    fn test_reset_zeroes() {
        let device = Arc::new(CpuDevice::new());
        let mut queue = device.queue_create();
        let mut buffers = RenderBuffers::new(device.clone());
        buffers.reset(BufferParams::new(4, 2), &mut queue).unwrap();
        assert!(queue.synchronize());
        buffers.copy_from_device().unwrap();

        assert_eq!(buffers.buffer.size(), 4 * 2 * PASS_STRIDE);
        assert_eq!(buffers.total_samples(), 0);
        assert_eq!(buffers.mean(3, 1), Vec3::ZERO);
        assert!(!buffers.is_converged(0, 0));
    }
}
