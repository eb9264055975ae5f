//! In-process reference device.
//!
//! `CpuDevice` implements the device traits on host memory so the scheduler
//! can run end to end without an accelerator. Buffers live in a registry of
//! word-aligned vectors, queues record commands and execute them on the rayon
//! pool at `synchronize`, and the integrator kernels trace a small analytic
//! [`Scene`].
//!
//! For testing the error paths the device can:
//! - cap its memory (`with_memory_limit`) so allocations fail,
//! - fail every launch of one kernel (`set_kernel_failure`),
//! - refuse or break graphics interop (`set_graphics_interop`,
//!   `set_interop_map_failure`).

mod kernels;
mod scene;

pub use scene::{Camera, Hit, Material, Scene, Sphere, OBJECT_NONE};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{
    BufferId, Device, DeviceGraphicsInterop, DeviceInfo, DeviceKernel, DeviceMemory, DeviceQueue, DeviceSlice,
    GraphicsInteropDestination, KernelArgs,
};
use crate::util::{divide_up, Error, Result};

/// Shared storage of one buffer.
pub(crate) type Storage = Arc<RwLock<Vec<u32>>>;

/// Counters of device activity.
#[derive(Clone, Debug, Default)]
pub struct CpuDeviceStats {
    /// Successful `mem_alloc` calls.
    pub num_allocations: usize,
    /// Buffers currently allocated (interop mappings excluded).
    pub live_buffers: usize,
    /// Bytes currently allocated.
    pub allocated_bytes: usize,
    /// Launches per kernel, indexed by kernel id.
    pub kernel_launches: [usize; DeviceKernel::COUNT],
    /// Calls to `synchronize` on any queue.
    pub num_synchronize: usize,
    /// Synchronizations that reported failure.
    pub num_failed_synchronize: usize,
    /// Calls to `DeviceGraphicsInterop::map`.
    pub interop_map_attempts: usize,
}

impl CpuDeviceStats {
    /// Number of launches of a kernel.
    #[inline]
    pub fn launches(&self, kernel: DeviceKernel) -> usize {
        self.kernel_launches[kernel.index()]
    }
}

struct DeviceBuffer {
    label: String,
    size_bytes: usize,
    storage: Storage,
    /// Memory owned elsewhere, registered for the duration of a mapping.
    external: bool,
}

/// State shared between the device, its queues and interop helpers.
pub(crate) struct CpuShared {
    buffers: RwLock<HashMap<BufferId, DeviceBuffer>>,
    constants: RwLock<HashMap<String, Vec<BufferId>>>,
    next_id: AtomicU64,
    allocated_bytes: AtomicUsize,
    memory_limit: Option<usize>,
    scene: RwLock<Arc<Scene>>,
    kernel_failure: RwLock<Option<DeviceKernel>>,
    graphics_interop: AtomicBool,
    interop_map_failure: AtomicBool,
    stats: Mutex<CpuDeviceStats>,
}

impl CpuShared {
    pub(crate) fn storage(&self, buffer: BufferId) -> Result<Storage> {
        self.buffers
            .read()
            .get(&buffer)
            .map(|b| Arc::clone(&b.storage))
            .ok_or_else(|| Error::buffer(format!("unknown device buffer {buffer:?}")))
    }

    pub(crate) fn constant(&self, name: &str) -> Result<Vec<BufferId>> {
        self.constants
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::buffer(format!("device constant '{name}' was never published")))
    }

    pub(crate) fn scene(&self) -> Arc<Scene> {
        Arc::clone(&self.scene.read())
    }

    fn register(&self, label: &str, size_bytes: usize, storage: Storage, external: bool) -> BufferId {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.buffers.write().insert(
            id,
            DeviceBuffer {
                label: label.to_string(),
                size_bytes,
                storage,
                external,
            },
        );
        id
    }
}

/// Host-memory compute device.
pub struct CpuDevice {
    shared: Arc<CpuShared>,
}

impl CpuDevice {
    /// Device without a memory limit, rendering [`Scene::demo`] at 64×64.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Device failing allocations once `limit_bytes` are in use.
    pub fn with_memory_limit(limit_bytes: usize) -> Self {
        Self::build(Some(limit_bytes))
    }

    fn build(memory_limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(CpuShared {
                buffers: RwLock::new(HashMap::new()),
                constants: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                allocated_bytes: AtomicUsize::new(0),
                memory_limit,
                scene: RwLock::new(Arc::new(Scene::demo(64, 64))),
                kernel_failure: RwLock::new(None),
                graphics_interop: AtomicBool::new(true),
                interop_map_failure: AtomicBool::new(false),
                stats: Mutex::new(CpuDeviceStats::default()),
            }),
        }
    }

    /// Replace the scene traced by the integrator kernels.
    pub fn set_scene(&self, scene: Scene) {
        *self.shared.scene.write() = Arc::new(scene);
    }

    /// Make every launch of `kernel` fail, or clear the failure with `None`.
    pub fn set_kernel_failure(&self, kernel: Option<DeviceKernel>) {
        *self.shared.kernel_failure.write() = kernel;
    }

    /// Whether the device advertises graphics interop support.
    pub fn set_graphics_interop(&self, enabled: bool) {
        self.shared.graphics_interop.store(enabled, Ordering::Relaxed);
    }

    /// Make interop mapping fail.
    pub fn set_interop_map_failure(&self, fail: bool) {
        self.shared.interop_map_failure.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> CpuDeviceStats {
        self.shared.stats.lock().clone()
    }

    /// Labels of live buffers, sorted, for leak diagnostics.
    pub fn live_buffer_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .shared
            .buffers
            .read()
            .values()
            .filter(|b| !b.external)
            .map(|b| b.label.clone())
            .collect();
        labels.sort();
        labels
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for CpuDevice {
    fn mem_alloc(&self, label: &str, size_bytes: usize) -> Result<BufferId> {
        if let Some(limit) = self.shared.memory_limit {
            let in_use = self.shared.allocated_bytes.load(Ordering::Relaxed);
            if in_use + size_bytes > limit {
                tracing::warn!(label, size_bytes, in_use, limit, "device memory exhausted");
                return Err(Error::Allocation { label: label.to_string(), size: size_bytes });
            }
        }

        let storage = Arc::new(RwLock::new(vec![0u32; divide_up(size_bytes, 4)]));
        let id = self.shared.register(label, size_bytes, storage, false);
        self.shared.allocated_bytes.fetch_add(size_bytes, Ordering::Relaxed);

        let mut stats = self.shared.stats.lock();
        stats.num_allocations += 1;
        stats.live_buffers += 1;
        stats.allocated_bytes += size_bytes;
        tracing::trace!(label, size_bytes, ?id, "mem_alloc");
        Ok(id)
    }

    fn mem_free(&self, buffer: BufferId) {
        let Some(removed) = self.shared.buffers.write().remove(&buffer) else {
            return;
        };
        if removed.external {
            return;
        }
        self.shared.allocated_bytes.fetch_sub(removed.size_bytes, Ordering::Relaxed);
        let mut stats = self.shared.stats.lock();
        stats.live_buffers -= 1;
        stats.allocated_bytes -= removed.size_bytes;
    }

    fn mem_copy_from(&self, buffer: BufferId, offset_bytes: usize, data: &mut [u8]) -> Result<()> {
        let storage = self.shared.storage(buffer)?;
        let words = storage.read();
        let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
        let src = bytes.get(offset_bytes..offset_bytes + data.len()).ok_or_else(|| {
            Error::buffer(format!(
                "read of {} bytes at {offset_bytes} exceeds buffer of {} bytes",
                data.len(),
                bytes.len()
            ))
        })?;
        data.copy_from_slice(src);
        Ok(())
    }
}

impl Device for CpuDevice {
    type Queue = CpuQueue;

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "CPU".to_string(),
            num_workers: rayon::current_num_threads(),
        }
    }

    fn queue_create(&self) -> CpuQueue {
        CpuQueue {
            shared: Arc::clone(&self.shared),
            commands: Vec::new(),
        }
    }

    fn const_copy_to(&self, name: &str, buffers: &[BufferId]) -> Result<()> {
        {
            let registry = self.shared.buffers.read();
            if let Some(missing) = buffers.iter().find(|b| !registry.contains_key(b)) {
                return Err(Error::buffer(format!("constant '{name}' references unknown buffer {missing:?}")));
            }
        }
        self.shared.constants.write().insert(name.to_string(), buffers.to_vec());
        Ok(())
    }

    fn should_use_graphics_interop(&self) -> bool {
        self.shared.graphics_interop.load(Ordering::Relaxed)
    }

    fn graphics_interop_create(&self) -> Box<dyn DeviceGraphicsInterop> {
        Box::new(CpuGraphicsInterop {
            shared: Arc::clone(&self.shared),
            destination: GraphicsInteropDestination::default(),
            mapped: None,
        })
    }
}

enum Command {
    Launch { kernel: DeviceKernel, work_size: usize, args: KernelArgs },
    Zero(BufferId),
    Upload(BufferId, Vec<u8>),
}

/// Command stream of a [`CpuDevice`].
pub struct CpuQueue {
    shared: Arc<CpuShared>,
    commands: Vec<Command>,
}

impl CpuQueue {
    fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Launch { kernel, work_size, args } => {
                self.shared.stats.lock().kernel_launches[kernel.index()] += 1;
                if *self.shared.kernel_failure.read() == Some(kernel) {
                    return Err(Error::device(format!("{kernel} failed on {work_size} work items")));
                }
                tracing::trace!(%kernel, work_size, "launch");
                kernels::launch(&self.shared, kernel, &args)
            }
            Command::Zero(buffer) => {
                self.shared.storage(buffer)?.write().fill(0);
                Ok(())
            }
            Command::Upload(buffer, data) => {
                let storage = self.shared.storage(buffer)?;
                let mut words = storage.write();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
                let len = bytes.len();
                bytes
                    .get_mut(..data.len())
                    .ok_or_else(|| Error::buffer(format!("upload of {} bytes into {len}", data.len())))?
                    .copy_from_slice(&data);
                Ok(())
            }
        }
    }
}

impl DeviceQueue for CpuQueue {
    fn init_execution(&mut self) -> Result<()> {
        if !self.commands.is_empty() {
            tracing::debug!(pending = self.commands.len(), "discarding unsynchronized commands");
            self.commands.clear();
        }
        Ok(())
    }

    fn enqueue(&mut self, kernel: DeviceKernel, work_size: usize, args: KernelArgs) {
        self.commands.push(Command::Launch { kernel, work_size, args });
    }

    fn zero_to_device(&mut self, buffer: BufferId) {
        self.commands.push(Command::Zero(buffer));
    }

    fn copy_to_device(&mut self, buffer: BufferId, data: Vec<u8>) {
        self.commands.push(Command::Upload(buffer, data));
    }

    fn synchronize(&mut self) -> bool {
        let commands = std::mem::take(&mut self.commands);
        self.shared.stats.lock().num_synchronize += 1;
        let _span = tracing::info_span!("cpu_synchronize", commands = commands.len()).entered();

        for command in commands {
            if let Err(e) = self.execute(command) {
                tracing::error!("device queue failed: {e}");
                self.shared.stats.lock().num_failed_synchronize += 1;
                return false;
            }
        }
        true
    }
}

/// Maps a display's shared texture into the buffer registry.
struct CpuGraphicsInterop {
    shared: Arc<CpuShared>,
    destination: GraphicsInteropDestination,
    mapped: Option<BufferId>,
}

impl DeviceGraphicsInterop for CpuGraphicsInterop {
    fn set_destination(&mut self, destination: GraphicsInteropDestination) {
        self.destination = destination;
    }

    fn map(&mut self) -> Option<DeviceSlice> {
        self.shared.stats.lock().interop_map_attempts += 1;
        if self.shared.interop_map_failure.load(Ordering::Relaxed) {
            tracing::debug!("interop mapping refused");
            return None;
        }
        self.unmap();
        let texture = self.destination.texture.as_ref()?;

        let size_bytes = texture.width * texture.height * 8;
        let id = self
            .shared
            .register("display_texture", size_bytes, Arc::clone(&texture.storage), true);
        self.mapped = Some(id);
        Some(DeviceSlice::new(id))
    }

    fn unmap(&mut self) {
        if let Some(id) = self.mapped.take() {
            self.shared.buffers.write().remove(&id);
        }
    }
}

impl Drop for CpuGraphicsInterop {
    fn drop(&mut self) {
        self.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SharedTexture;
    use crate::render::BufferParams;

    #[test]
    fn test_memory_limit() {
        let device = CpuDevice::with_memory_limit(100);
        let a = device.mem_alloc("a", 64).unwrap();
        let err = device.mem_alloc("b", 64).unwrap_err();
        assert!(matches!(err, Error::Allocation { size: 64, .. }));

        device.mem_free(a);
        assert!(device.mem_alloc("b", 64).is_ok());
        assert_eq!(device.stats().num_allocations, 2);
    }

    #[test]
    fn test_queue_runs_in_order() {
        let device = CpuDevice::new();
        let buffer = device.mem_alloc("buf", 8).unwrap();
        let mut queue = device.queue_create();

        queue.copy_to_device(buffer, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        queue.zero_to_device(buffer);
        queue.copy_to_device(buffer, vec![9, 9]);

        let mut out = [0u8; 4];
        device.mem_copy_from(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0], "nothing runs before synchronize");

        assert!(queue.synchronize());
        device.mem_copy_from(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [9, 9, 0, 0]);
    }

    #[test]
    fn test_copy_from_out_of_range() {
        let device = CpuDevice::new();
        let buffer = device.mem_alloc("buf", 4).unwrap();
        let mut out = [0u8; 8];
        assert!(device.mem_copy_from(buffer, 0, &mut out).is_err());
    }

    #[test]
    fn test_injected_failure_stops_queue() {
        let device = CpuDevice::new();
        device.set_kernel_failure(Some(DeviceKernel::ConvertToHalfFloat));
        let buffer = device.mem_alloc("buf", 4).unwrap();
        let mut queue = device.queue_create();

        queue.enqueue(
            DeviceKernel::ConvertToHalfFloat,
            0,
            KernelArgs::FilmConvert {
                rgba_half: DeviceSlice::new(buffer),
                render_buffer: buffer,
                sample_scale: 1.0,
                per_pixel_sample_count: false,
                region: BufferParams::new(0, 0).pass_region(),
            },
        );
        queue.copy_to_device(buffer, vec![1, 1, 1, 1]);
        assert!(!queue.synchronize());

        let mut out = [0u8; 4];
        device.mem_copy_from(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0], "commands after the failure are dropped");
        assert_eq!(device.stats().num_failed_synchronize, 1);
    }

    #[test]
    fn test_const_copy_rejects_unknown() {
        let device = CpuDevice::new();
        assert!(device.const_copy_to("x", &[BufferId(999)]).is_err());
    }

    #[test]
    fn test_interop_map_and_unmap() {
        let device = CpuDevice::new();
        let texture = SharedTexture::new(2, 2);
        let mut interop = device.graphics_interop_create();
        interop.set_destination(GraphicsInteropDestination {
            width: 2,
            height: 2,
            texture: Some(texture.clone()),
        });

        let slice = interop.map().unwrap();
        assert!(device.shared.storage(slice.buffer).is_ok());
        interop.unmap();
        assert!(device.shared.storage(slice.buffer).is_err());
        assert_eq!(device.stats().live_buffers, 0);

        device.set_interop_map_failure(true);
        assert!(interop.map().is_none());
        assert_eq!(device.stats().interop_map_attempts, 2);
    }
}
