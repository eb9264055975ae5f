//! Typed device buffers with a host-side mirror.

use std::sync::Arc;

use bytemuck::Pod;

use super::{BufferId, DeviceMemory, DeviceQueue};
use crate::util::Result;

/// A device buffer of `T` with a host copy of the same length.
///
/// Host and device contents are only synchronized by explicit
/// `copy_to_device` / `copy_from_device` calls. The device buffer is freed
/// when the vector is dropped.
pub struct DeviceVector<T: Pod> {
    label: String,
    memory: Arc<dyn DeviceMemory>,
    host: Vec<T>,
    device_pointer: Option<BufferId>,
}

impl<T: Pod> DeviceVector<T> {
    /// Create an empty, unallocated vector.
    pub fn new(memory: Arc<dyn DeviceMemory>, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            memory,
            host: Vec::new(),
            device_pointer: None,
        }
    }

    /// Debug label of the buffer.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.host.len()
    }

    /// Whether the vector holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// (Re)allocate `num` elements on host and device.
    ///
    /// Previous contents are discarded; the host mirror is zeroed.
    pub fn alloc(&mut self, num: usize) -> Result<()> {
        self.free();
        if num == 0 {
            return Ok(());
        }
        let size_bytes = num * std::mem::size_of::<T>();
        let buffer = self.memory.mem_alloc(&self.label, size_bytes)?;
        self.device_pointer = Some(buffer);
        self.host = vec![T::zeroed(); num];
        Ok(())
    }

    /// Release host and device memory.
    pub fn free(&mut self) {
        if let Some(buffer) = self.device_pointer.take() {
            self.memory.mem_free(buffer);
        }
        self.host = Vec::new();
    }

    /// Queue zeroing of the device buffer.
    pub fn zero_to_device<Q: DeviceQueue>(&self, queue: &mut Q) {
        if let Some(buffer) = self.device_pointer {
            queue.zero_to_device(buffer);
        }
    }

    /// Queue an upload of the host mirror.
    pub fn copy_to_device<Q: DeviceQueue>(&self, queue: &mut Q) {
        if let Some(buffer) = self.device_pointer {
            queue.copy_to_device(buffer, bytemuck::cast_slice(&self.host).to_vec());
        }
    }

    /// Read the device buffer back into the host mirror.
    ///
    /// The queue that wrote the buffer must have been synchronized.
    pub fn copy_from_device(&mut self) -> Result<()> {
        if let Some(buffer) = self.device_pointer {
            self.memory
                .mem_copy_from(buffer, 0, bytemuck::cast_slice_mut(&mut self.host))?;
        }
        Ok(())
    }

    /// Host mirror.
    #[inline]
    pub fn data(&self) -> &[T] {
        &self.host
    }

    /// Mutable host mirror.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Device handle, if allocated.
    #[inline]
    pub fn device_pointer(&self) -> Option<BufferId> {
        self.device_pointer
    }
}

impl<T: Pod> Drop for DeviceVector<T> {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu::CpuDevice;
    use crate::device::Device;

    #[test]
    fn test_alloc_and_roundtrip() {
        let device = Arc::new(CpuDevice::new());
        let mut queue = device.queue_create();
        let mut vec: DeviceVector<u32> = DeviceVector::new(device.clone(), "test");

        vec.alloc(4).unwrap();
        assert_eq!(vec.size(), 4);
        vec.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        vec.copy_to_device(&mut queue);
        assert!(queue.synchronize());

        vec.data_mut().fill(0);
        vec.copy_from_device().unwrap();
        assert_eq!(vec.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_free_on_drop() {
        let device = Arc::new(CpuDevice::new());
        {
            let mut vec: DeviceVector<f32> = DeviceVector::new(device.clone(), "drop");
            vec.alloc(16).unwrap();
            assert_eq!(device.stats().live_buffers, 1);
        }
        assert_eq!(device.stats().live_buffers, 0);
    }
}
