//! End-to-end rendering on the CPU device.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use wavefront::device::cpu::{CpuDevice, CpuQueue, Scene};
use wavefront::device::{
    BufferId, Device, DeviceGraphicsInterop, DeviceInfo, DeviceKernel, DeviceMemory, DeviceQueue, KernelArgs,
};
use wavefront::integrator::{AdaptiveSamplingConfig, PathTraceConfig, PathTraceWork};
use wavefront::render::BufferParams;
use wavefront::{Error, Result};

fn config(max_num_paths: usize) -> PathTraceConfig {
    PathTraceConfig {
        max_num_paths,
        tile_size: 8,
        check_invariants: true,
        ..Default::default()
    }
}

fn setup(width: usize, height: usize, config: PathTraceConfig) -> (Arc<CpuDevice>, PathTraceWork<CpuDevice>) {
    let device = Arc::new(CpuDevice::new());
    device.set_scene(Scene::demo(width, height));
    let mut work = PathTraceWork::new(device.clone(), config, Arc::default()).unwrap();
    work.init_execution().unwrap();
    work.set_effective_buffer_params(BufferParams::new(width, height)).unwrap();
    (device, work)
}

fn assert_sample_counts(work: &PathTraceWork<CpuDevice>, expected: u32) {
    let buffers = work.render_buffers();
    for y in 0..buffers.params.height {
        for x in 0..buffers.params.width {
            assert_eq!(buffers.sample_count(x, y), expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn test_every_pixel_gets_every_sample() {
    // Capacity well below the pixel count forces tile splitting and slot reuse.
    let (_device, mut work) = setup(16, 12, config(50));
    work.render_samples(0, 4).unwrap();
    work.copy_render_buffers_from_device().unwrap();

    assert_sample_counts(&work, 4);
    assert_eq!(work.render_buffers().total_samples(), 16 * 12 * 4);
    assert_eq!(work.get_num_active_paths(), 0);
    assert_eq!(work.stats().num_camera_paths, 16 * 12 * 4);
    work.check_invariants().unwrap();
}

#[test]
fn test_consecutive_passes_accumulate() {
    let (_device, mut work) = setup(10, 10, config(64));
    work.render_samples(0, 3).unwrap();
    work.render_samples(3, 2).unwrap();
    work.copy_render_buffers_from_device().unwrap();
    assert_sample_counts(&work, 5);
}

#[test]
fn test_compaction_kernels_run_when_pool_is_small() {
    let (_device, mut work) = setup(16, 16, config(40));
    work.render_samples(0, 2).unwrap();

    let stats = work.stats();
    assert!(stats.launches(DeviceKernel::TerminatedPathsArray) > 0);
    assert!(stats.launches(DeviceKernel::QueuedPathsArray) > 0);
    assert!(stats.launches(DeviceKernel::InitFromCamera) >= stats.num_tiles);
    assert!(stats.num_tile_requests >= stats.num_tiles);
}

#[test]
fn test_megakernel_finishes_sparse_work() {
    // 64 paths stay below 10% of the capacity from the start.
    let (device, mut work) = setup(8, 8, config(4096));
    work.render_samples(0, 1).unwrap();
    work.copy_render_buffers_from_device().unwrap();

    assert!(work.stats().launches(DeviceKernel::Megakernel) > 0);
    assert!(device.stats().launches(DeviceKernel::Megakernel) > 0);
    assert_sample_counts(&work, 1);
}

#[test]
fn test_megakernel_disabled() {
    let config = PathTraceConfig { use_megakernel: false, ..config(4096) };
    let (_device, mut work) = setup(8, 8, config);
    work.render_samples(0, 2).unwrap();
    work.copy_render_buffers_from_device().unwrap();

    let stats = work.stats();
    assert_eq!(stats.launches(DeviceKernel::Megakernel), 0);
    assert!(stats.launches(DeviceKernel::IntersectClosest) > 0);
    assert_sample_counts(&work, 2);
}

#[test]
fn test_cancel_before_start_requests_no_tiles() {
    let device = Arc::new(CpuDevice::new());
    device.set_scene(Scene::demo(8, 8));
    let cancel = Arc::new(AtomicBool::new(true));
    let mut work = PathTraceWork::new(device, config(64), cancel).unwrap();
    work.init_execution().unwrap();
    work.set_effective_buffer_params(BufferParams::new(8, 8)).unwrap();

    work.render_samples(0, 4).unwrap();
    work.copy_render_buffers_from_device().unwrap();

    assert_eq!(work.stats().num_tile_requests, 0);
    assert_eq!(work.stats().num_iterations, 0);
    assert_eq!(work.render_buffers().total_samples(), 0);
}

#[test]
fn test_kernel_failure_aborts_pass() {
    let (device, mut work) = setup(16, 16, config(50));
    device.set_kernel_failure(Some(DeviceKernel::ShadeSurface));

    let err = work.render_samples(0, 4).unwrap_err();
    assert!(matches!(err, Error::DeviceFailure(_)));
    assert!(!err.is_fatal());
    assert!(device.stats().num_failed_synchronize > 0);

    // Samples initialized before the failing batch stay in the buffer.
    work.copy_render_buffers_from_device().unwrap();
    let total = work.render_buffers().total_samples();
    assert!(total > 0);
    assert!(total < 16 * 16 * 4);
}

#[test]
fn test_allocation_failure() {
    let device = Arc::new(CpuDevice::with_memory_limit(1024));
    let mut work = PathTraceWork::new(device.clone(), config(4096), Arc::default()).unwrap();
    let err = work.init_execution().unwrap_err();
    assert!(matches!(err, Error::Allocation { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_invalid_config_rejected() {
    let device = Arc::new(CpuDevice::new());
    let config = PathTraceConfig { regenerate_threshold: 1.5, ..Default::default() };
    assert!(matches!(
        PathTraceWork::new(device, config, Arc::default()),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_render_without_buffer() {
    let device = Arc::new(CpuDevice::new());
    let mut work = PathTraceWork::new(device, config(64), Arc::default()).unwrap();
    work.init_execution().unwrap();
    assert!(matches!(work.render_samples(0, 1), Err(Error::InvalidBuffer(_))));
}

#[test]
fn test_adaptive_sampling_stops_converged_pixels() {
    let config = PathTraceConfig {
        adaptive: AdaptiveSamplingConfig { enabled: true, min_samples: 4, threshold: 1.0e3 },
        ..config(128)
    };
    let (_device, mut work) = setup(12, 8, config);

    work.render_samples(0, 4).unwrap();
    assert!(work.adaptive_sampling_converge_and_filter(4).unwrap());

    let camera_paths = work.stats().num_camera_paths;
    work.render_samples(4, 4).unwrap();
    work.copy_render_buffers_from_device().unwrap();

    // Tiles are still handed out, but converged pixels start no paths.
    assert!(work.stats().num_camera_paths > camera_paths);
    assert_sample_counts(&work, 4);
    for y in 0..8 {
        for x in 0..12 {
            assert!(work.render_buffers().is_converged(x, y));
        }
    }
}

#[test]
fn test_adaptive_sampling_below_min_samples() {
    let config = PathTraceConfig {
        adaptive: AdaptiveSamplingConfig { enabled: true, min_samples: 8, threshold: 1.0e3 },
        ..config(128)
    };
    let (_device, mut work) = setup(6, 6, config);
    work.render_samples(0, 2).unwrap();
    assert!(!work.adaptive_sampling_converge_and_filter(2).unwrap());
}

/// CPU device raising a cancel flag once a given number of synchronizations
/// completed, and recording camera path launches made afterwards.
struct CancellingDevice {
    inner: CpuDevice,
    cancel: Arc<AtomicBool>,
    cancel_at: usize,
    num_synchronize: Arc<AtomicUsize>,
    inits_after_cancel: Arc<AtomicUsize>,
}

struct CancellingQueue {
    inner: CpuQueue,
    cancel: Arc<AtomicBool>,
    cancel_at: usize,
    num_synchronize: Arc<AtomicUsize>,
    inits_after_cancel: Arc<AtomicUsize>,
}

impl DeviceMemory for CancellingDevice {
    fn mem_alloc(&self, label: &str, size_bytes: usize) -> Result<BufferId> {
        self.inner.mem_alloc(label, size_bytes)
    }

    fn mem_free(&self, buffer: BufferId) {
        self.inner.mem_free(buffer)
    }

    fn mem_copy_from(&self, buffer: BufferId, offset_bytes: usize, data: &mut [u8]) -> Result<()> {
        self.inner.mem_copy_from(buffer, offset_bytes, data)
    }
}

impl Device for CancellingDevice {
    type Queue = CancellingQueue;

    fn info(&self) -> DeviceInfo {
        self.inner.info()
    }

    fn queue_create(&self) -> CancellingQueue {
        CancellingQueue {
            inner: self.inner.queue_create(),
            cancel: self.cancel.clone(),
            cancel_at: self.cancel_at,
            num_synchronize: self.num_synchronize.clone(),
            inits_after_cancel: self.inits_after_cancel.clone(),
        }
    }

    fn const_copy_to(&self, name: &str, buffers: &[BufferId]) -> Result<()> {
        self.inner.const_copy_to(name, buffers)
    }

    fn should_use_graphics_interop(&self) -> bool {
        self.inner.should_use_graphics_interop()
    }

    fn graphics_interop_create(&self) -> Box<dyn DeviceGraphicsInterop> {
        self.inner.graphics_interop_create()
    }
}

impl DeviceQueue for CancellingQueue {
    fn init_execution(&mut self) -> Result<()> {
        self.inner.init_execution()
    }

    fn enqueue(&mut self, kernel: DeviceKernel, work_size: usize, args: KernelArgs) {
        if kernel == DeviceKernel::InitFromCamera && self.cancel.load(Ordering::Acquire) {
            self.inits_after_cancel.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.enqueue(kernel, work_size, args)
    }

    fn zero_to_device(&mut self, buffer: BufferId) {
        self.inner.zero_to_device(buffer)
    }

    fn copy_to_device(&mut self, buffer: BufferId, data: Vec<u8>) {
        self.inner.copy_to_device(buffer, data)
    }

    fn synchronize(&mut self) -> bool {
        let ok = self.inner.synchronize();
        if self.num_synchronize.fetch_add(1, Ordering::Relaxed) + 1 == self.cancel_at {
            self.cancel.store(true, Ordering::Release);
        }
        ok
    }
}

#[test]
fn test_cancel_mid_pass_drains_in_flight_paths() {
    const W: usize = 32;
    const H: usize = 32;
    const SAMPLES: u32 = 8;

    let cancel = Arc::new(AtomicBool::new(false));
    let inits_after_cancel = Arc::new(AtomicUsize::new(0));
    let inner = CpuDevice::new();
    inner.set_scene(Scene::demo(W, H));
    // One synchronize for init_execution, then a few render iterations.
    let device = Arc::new(CancellingDevice {
        inner,
        cancel: cancel.clone(),
        cancel_at: 6,
        num_synchronize: Arc::new(AtomicUsize::new(0)),
        inits_after_cancel: inits_after_cancel.clone(),
    });

    let mut work = PathTraceWork::new(device, config(128), cancel.clone()).unwrap();
    work.init_execution().unwrap();
    work.set_effective_buffer_params(BufferParams::new(W, H)).unwrap();
    work.render_samples(0, SAMPLES).unwrap();
    work.copy_render_buffers_from_device().unwrap();

    assert!(cancel.load(Ordering::Acquire));
    assert_eq!(inits_after_cancel.load(Ordering::Relaxed), 0);
    assert_eq!(work.get_num_active_paths(), 0);
    work.check_invariants().unwrap();

    // Every started path finished and was accumulated; the rest never started.
    let total = work.render_buffers().total_samples();
    assert!(total > 0);
    assert_eq!(total, work.stats().num_camera_paths as u64);
    assert!(total < (W * H) as u64 * SAMPLES as u64);

    // A cancelled work issues no further tiles.
    let requests = work.stats().num_tile_requests;
    work.render_samples(SAMPLES, 1).unwrap();
    assert_eq!(work.stats().num_tile_requests, requests);
}

fn render_with_regenerate_threshold(regenerate_threshold: f32) -> PathTraceWork<CpuDevice> {
    let config = PathTraceConfig { regenerate_threshold, ..config(40) };
    let (_device, mut work) = setup(16, 16, config);
    work.render_samples(0, 2).unwrap();
    work.copy_render_buffers_from_device().unwrap();
    assert_sample_counts(&work, 2);
    work
}

#[test]
fn test_regenerate_threshold_controls_top_up() {
    let eager = render_with_regenerate_threshold(0.5);
    let lazy = render_with_regenerate_threshold(0.0);

    // With a zero threshold tiles are only requested once the pool drained,
    // so free slots never need to be gathered.
    assert_eq!(lazy.stats().launches(DeviceKernel::TerminatedPathsArray), 0);
    assert!(eager.stats().launches(DeviceKernel::TerminatedPathsArray) > 0);

    // Both hand out the same work, only the refill points differ.
    assert_eq!(eager.stats().num_camera_paths, lazy.stats().num_camera_paths);
    assert_eq!(lazy.stats().num_camera_paths, 16 * 16 * 2);
    for work in [&eager, &lazy] {
        assert!(work.stats().num_tile_requests >= work.stats().num_tiles);
    }
}
