//! Path state pool: structure-of-arrays storage of in-flight paths.
//!
//! Every [`StateField`] is one device array of `capacity * components` words.
//! Kernels find the arrays through the named constant
//! [`INTEGRATOR_STATE_CONST`], which lists the buffers in field order, so
//! a path slot is just an index into each array.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::device::{BufferId, Device, DeviceKernel, DeviceMemory, DeviceQueue, NUM_INTEGRATOR_PHASES};
use crate::util::{Error, Result};

/// Constant table holding the state field buffers.
pub const INTEGRATOR_STATE_CONST: &str = "__integrator_state";

/// Constant table holding the queue counter buffer.
pub const INTEGRATOR_QUEUE_CONST: &str = "__integrator_queue";

/// Encoded "not queued for any kernel": the slot is free.
pub const QUEUED_NONE: u32 = 0;

/// Encode the kernel a path is queued for as stored in `path.queued_kernel`.
#[inline]
pub fn encode_queued(kernel: Option<DeviceKernel>) -> u32 {
    match kernel {
        Some(k) => k as u32 + 1,
        None => QUEUED_NONE,
    }
}

/// Decode a stored `path.queued_kernel` value.
#[inline]
pub fn decode_queued(value: u32) -> Option<DeviceKernel> {
    if value == QUEUED_NONE {
        None
    } else {
        DeviceKernel::from_index(value as usize - 1)
    }
}

/// One member of the per-path state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StateField {
    PathRenderPixelIndex,
    PathSample,
    PathBounce,
    PathRngState,
    PathQueuedKernel,
    /// Kernel to resume after the in-flight shadow ray resolves.
    PathContinuation,
    RayP,
    RayD,
    IsectT,
    IsectObject,
    PathThroughput,
    /// Radiance gathered so far, flushed to the render buffer on termination.
    PathRadiance,
    ShadowRayP,
    ShadowRayD,
    ShadowRayT,
    ShadowThroughput,
    /// Non-zero while the slot's single shadow ray is in flight.
    ShadowOccupied,
}

impl StateField {
    pub const COUNT: usize = 17;

    pub const ALL: [StateField; Self::COUNT] = [
        Self::PathRenderPixelIndex,
        Self::PathSample,
        Self::PathBounce,
        Self::PathRngState,
        Self::PathQueuedKernel,
        Self::PathContinuation,
        Self::RayP,
        Self::RayD,
        Self::IsectT,
        Self::IsectObject,
        Self::PathThroughput,
        Self::PathRadiance,
        Self::ShadowRayP,
        Self::ShadowRayD,
        Self::ShadowRayT,
        Self::ShadowThroughput,
        Self::ShadowOccupied,
    ];

    /// Position of the field in the state descriptor.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Number of 32-bit words per path.
    #[inline]
    pub const fn components(self) -> usize {
        match self {
            Self::RayP
            | Self::RayD
            | Self::PathThroughput
            | Self::PathRadiance
            | Self::ShadowRayP
            | Self::ShadowRayD
            | Self::ShadowThroughput => 3,
            _ => 1,
        }
    }

    /// Name used for the device allocation.
    pub const fn name(self) -> &'static str {
        match self {
            Self::PathRenderPixelIndex => "integrator_state_path_render_pixel_index",
            Self::PathSample => "integrator_state_path_sample",
            Self::PathBounce => "integrator_state_path_bounce",
            Self::PathRngState => "integrator_state_path_rng_state",
            Self::PathQueuedKernel => "integrator_state_path_queued_kernel",
            Self::PathContinuation => "integrator_state_path_continuation",
            Self::RayP => "integrator_state_ray_P",
            Self::RayD => "integrator_state_ray_D",
            Self::IsectT => "integrator_state_isect_t",
            Self::IsectObject => "integrator_state_isect_object",
            Self::PathThroughput => "integrator_state_path_throughput",
            Self::PathRadiance => "integrator_state_path_radiance",
            Self::ShadowRayP => "integrator_state_shadow_ray_P",
            Self::ShadowRayD => "integrator_state_shadow_ray_D",
            Self::ShadowRayT => "integrator_state_shadow_ray_t",
            Self::ShadowThroughput => "integrator_state_shadow_throughput",
            Self::ShadowOccupied => "integrator_state_shadow_occupied",
        }
    }
}

/// Pending-work counters, one per integrator phase.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IntegratorQueueCounter {
    pub num_queued: [u32; NUM_INTEGRATOR_PHASES],
}

impl IntegratorQueueCounter {
    /// Counters with a single phase populated.
    pub fn with(kernel: DeviceKernel, count: u32) -> Self {
        let mut counter = Self::default();
        counter.set(kernel, count);
        counter
    }

    /// Pending paths for a phase. Non-phase kernels report zero.
    #[inline]
    pub fn get(&self, kernel: DeviceKernel) -> u32 {
        if kernel.is_integrator_phase() {
            self.num_queued[kernel.index()]
        } else {
            0
        }
    }

    /// Set the counter of a phase.
    #[inline]
    pub fn set(&mut self, kernel: DeviceKernel, count: u32) {
        debug_assert!(kernel.is_integrator_phase());
        self.num_queued[kernel.index()] = count;
    }

    /// Sum over all phases, i.e. the number of active paths.
    #[inline]
    pub fn total(&self) -> usize {
        self.num_queued.iter().map(|&n| n as usize).sum()
    }

    /// Phase with the most pending paths; ties go to the lowest phase id.
    pub fn max_queued(&self) -> Option<(DeviceKernel, u32)> {
        let mut best: Option<(DeviceKernel, u32)> = None;
        for kernel in DeviceKernel::INTEGRATOR_PHASES {
            let n = self.get(kernel);
            if n > best.map_or(0, |(_, m)| m) {
                best = Some((kernel, n));
            }
        }
        best
    }
}

/// Fixed-capacity pool of path slots, one device array per [`StateField`].
pub struct PathStatePool {
    memory: Arc<dyn DeviceMemory>,
    arrays: Vec<BufferId>,
    capacity: usize,
}

impl PathStatePool {
    /// Create an unallocated pool.
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        Self { memory, arrays: Vec::new(), capacity: 0 }
    }

    /// Whether the device arrays exist.
    #[inline]
    pub fn is_allocated(&self) -> bool {
        !self.arrays.is_empty()
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers in field order, as published to kernels.
    #[inline]
    pub fn descriptor(&self) -> &[BufferId] {
        &self.arrays
    }

    /// Buffer of one field.
    #[inline]
    pub fn array(&self, field: StateField) -> Option<BufferId> {
        self.arrays.get(field.index()).copied()
    }

    /// Allocate and zero every field array for `capacity` slots and publish
    /// the descriptor.
    ///
    /// Returns `Ok(false)` without touching the device when already allocated.
    pub fn alloc<D: Device>(&mut self, device: &D, queue: &mut D::Queue, capacity: usize) -> Result<bool> {
        if self.is_allocated() {
            return Ok(false);
        }
        if capacity == 0 {
            return Err(Error::config("path state capacity must be non-zero"));
        }

        let mut arrays = Vec::with_capacity(StateField::COUNT);
        for field in StateField::ALL {
            let size_bytes = capacity * field.components() * std::mem::size_of::<u32>();
            match self.memory.mem_alloc(field.name(), size_bytes) {
                Ok(buffer) => arrays.push(buffer),
                Err(e) => {
                    for buffer in arrays {
                        self.memory.mem_free(buffer);
                    }
                    return Err(e);
                }
            }
        }

        for &buffer in &arrays {
            queue.zero_to_device(buffer);
        }
        if let Err(e) = device.const_copy_to(INTEGRATOR_STATE_CONST, &arrays) {
            for buffer in arrays {
                self.memory.mem_free(buffer);
            }
            return Err(e);
        }

        tracing::debug!(
            capacity,
            fields = StateField::COUNT,
            "allocated integrator state"
        );
        self.arrays = arrays;
        self.capacity = capacity;
        Ok(true)
    }

    /// Read one single-word field for every slot.
    ///
    /// The queue writing the state must have been synchronized.
    pub fn read_u32_field(&self, field: StateField) -> Result<Vec<u32>> {
        let buffer = self
            .array(field)
            .ok_or_else(|| Error::buffer("integrator state is not allocated"))?;
        let mut values = vec![0u32; self.capacity * field.components()];
        self.memory
            .mem_copy_from(buffer, 0, bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }

    /// Count slots per queued phase, read back from the device.
    ///
    /// Returns the per-phase histogram and the number of active slots.
    pub fn queued_histogram(&self) -> Result<(IntegratorQueueCounter, usize)> {
        let queued = self.read_u32_field(StateField::PathQueuedKernel)?;
        let mut histogram = IntegratorQueueCounter::default();
        let mut active = 0;
        for (slot, &value) in queued.iter().enumerate() {
            if value == QUEUED_NONE {
                continue;
            }
            match decode_queued(value) {
                Some(kernel) if kernel.is_integrator_phase() => {
                    histogram.num_queued[kernel.index()] += 1;
                    active += 1;
                }
                _ => {
                    return Err(Error::consistency(format!(
                        "slot {slot} is queued for invalid kernel id {value}"
                    )))
                }
            }
        }
        Ok((histogram, active))
    }
}

impl Drop for PathStatePool {
    fn drop(&mut self) {
        for buffer in self.arrays.drain(..) {
            self.memory.mem_free(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu::CpuDevice;

    #[test]
    fn test_queued_encoding() {
        assert_eq!(encode_queued(None), QUEUED_NONE);
        assert_eq!(decode_queued(QUEUED_NONE), None);
        for kernel in DeviceKernel::INTEGRATOR_PHASES {
            assert_eq!(decode_queued(encode_queued(Some(kernel))), Some(kernel));
        }
    }

    #[test]
    fn test_counter_max_ties_lowest_id() {
        let mut c = IntegratorQueueCounter::default();
        c.set(DeviceKernel::ShadeSurface, 10);
        c.set(DeviceKernel::IntersectShadow, 10);
        assert_eq!(c.max_queued(), Some((DeviceKernel::IntersectShadow, 10)));
        assert_eq!(c.total(), 20);

        assert_eq!(IntegratorQueueCounter::default().max_queued(), None);
    }

    #[test]
    fn test_alloc_idempotent() {
        let device = Arc::new(CpuDevice::new());
        let mut queue = device.queue_create();
        let mut pool = PathStatePool::new(device.clone());

        assert!(pool.alloc(device.as_ref(), &mut queue, 64).unwrap());
        let first = pool.descriptor().to_vec();
        let allocations = device.stats().num_allocations;

        assert!(!pool.alloc(device.as_ref(), &mut queue, 64).unwrap());
        assert_eq!(pool.descriptor(), first.as_slice());
        assert_eq!(device.stats().num_allocations, allocations);
        assert_eq!(first.len(), StateField::COUNT);
    }

    #[test]
    fn test_alloc_zeroed() {
        let device = Arc::new(CpuDevice::new());
        let mut queue = device.queue_create();
        let mut pool = PathStatePool::new(device.clone());
        pool.alloc(device.as_ref(), &mut queue, 32).unwrap();
        assert!(queue.synchronize());

        let (histogram, active) = pool.queued_histogram().unwrap();
        assert_eq!(active, 0);
        assert_eq!(histogram.total(), 0);
    }

    #[test]
    fn test_alloc_failure_releases_partial() {
        let device = Arc::new(CpuDevice::with_memory_limit(1024));
        let mut queue = device.queue_create();
        let mut pool = PathStatePool::new(device.clone());

        let err = pool.alloc(device.as_ref(), &mut queue, 1 << 16).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
        assert!(!pool.is_allocated());
        assert_eq!(device.stats().live_buffers, 0);
    }
}
