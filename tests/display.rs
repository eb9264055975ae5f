//! Display updates through graphics interop and the copy fallback.

use std::sync::Arc;

use wavefront::device::cpu::{CpuDevice, Scene};
use wavefront::integrator::{PathTraceConfig, PathTraceWork};
use wavefront::render::{BufferParams, HostDisplay};

const W: usize = 12;
const H: usize = 8;

fn rendered_work(device: &Arc<CpuDevice>) -> PathTraceWork<CpuDevice> {
    device.set_scene(Scene::demo(W, H));
    let config = PathTraceConfig { max_num_paths: 256, check_invariants: true, ..Default::default() };
    let mut work = PathTraceWork::new(device.clone(), config, Arc::default()).unwrap();
    work.init_execution().unwrap();
    work.set_effective_buffer_params(BufferParams::new(W, H)).unwrap();
    work.render_samples(0, 4).unwrap();
    work
}

fn has_signal(display: &HostDisplay) -> bool {
    display
        .pixels()
        .iter()
        .any(|p| p.to_f32()[..3].iter().any(|&c| c > 0.0))
}

#[test]
fn test_interop_update_writes_display_texture() {
    let device = Arc::new(CpuDevice::new());
    let mut work = rendered_work(&device);
    let mut display = HostDisplay::new(W, H);

    work.copy_to_gpu_display(&mut display, 0.25).unwrap();

    assert!(work.interop_use());
    assert_eq!(display.num_naive_updates(), 0);
    assert_eq!(display.num_interop_requests(), 1);
    assert_eq!(work.stats().num_display_allocations, 0);
    assert!(has_signal(&display));
    assert!(display.pixels().iter().all(|p| p.to_f32()[3] == 1.0));
    assert_eq!(device.stats().interop_map_attempts, 1);
}

#[test]
fn test_interop_failure_falls_back_for_good() {
    let device = Arc::new(CpuDevice::new());
    device.set_interop_map_failure(true);
    let mut work = rendered_work(&device);
    let mut display = HostDisplay::new(W, H);

    work.copy_to_gpu_display(&mut display, 0.25).unwrap();
    assert!(!work.interop_use());
    assert_eq!(display.num_naive_updates(), 1);
    assert!(has_signal(&display));

    // Interop is not retried even once mapping would succeed.
    device.set_interop_map_failure(false);
    work.copy_to_gpu_display(&mut display, 0.25).unwrap();
    assert_eq!(device.stats().interop_map_attempts, 1);
    assert_eq!(display.num_naive_updates(), 2);
}

#[test]
fn test_display_without_shared_texture_falls_back() {
    let device = Arc::new(CpuDevice::new());
    let mut work = rendered_work(&device);
    let mut display = HostDisplay::new(W, H).with_interop(false);

    work.copy_to_gpu_display(&mut display, 0.25).unwrap();
    work.copy_to_gpu_display(&mut display, 0.25).unwrap();
    assert!(!work.interop_use());
    assert_eq!(display.num_naive_updates(), 2);
    // No mapping is attempted for a display that cannot share its texture.
    assert_eq!(display.num_interop_requests(), 0);
    assert_eq!(device.stats().interop_map_attempts, 0);
}

#[test]
fn test_device_without_interop_uses_copy_path() {
    let device = Arc::new(CpuDevice::new());
    device.set_graphics_interop(false);
    let mut work = rendered_work(&device);
    let mut display = HostDisplay::new(W, H);

    work.copy_to_gpu_display(&mut display, 0.25).unwrap();
    work.copy_to_gpu_display(&mut display, 0.25).unwrap();

    assert_eq!(display.num_interop_requests(), 0);
    assert_eq!(device.stats().interop_map_attempts, 0);
    assert_eq!(display.num_naive_updates(), 2);
    // The half-float staging buffer is reused while the size is unchanged.
    assert_eq!(work.stats().num_display_allocations, 1);
}

#[test]
fn test_copy_path_reallocates_on_resize() {
    let device = Arc::new(CpuDevice::new());
    device.set_graphics_interop(false);
    let mut work = rendered_work(&device);
    let mut display = HostDisplay::new(W, H);

    work.copy_to_gpu_display(&mut display, 0.25).unwrap();
    work.set_effective_buffer_params(BufferParams::new(6, 4)).unwrap();
    work.copy_to_gpu_display(&mut display, 0.25).unwrap();

    assert_eq!(work.stats().num_display_allocations, 2);
    assert_eq!((display.width(), display.height()), (6, 4));
}

#[test]
fn test_interop_and_copy_paths_agree() {
    let device = Arc::new(CpuDevice::new());
    let mut work = rendered_work(&device);

    let mut interop_display = HostDisplay::new(W, H);
    work.copy_to_gpu_display(&mut interop_display, 0.25).unwrap();
    assert!(work.interop_use());

    let fallback_device = Arc::new(CpuDevice::new());
    fallback_device.set_graphics_interop(false);
    let mut fallback_work = rendered_work(&fallback_device);
    let mut naive_display = HostDisplay::new(W, H);
    fallback_work.copy_to_gpu_display(&mut naive_display, 0.25).unwrap();

    for (a, b) in interop_display.pixels().iter().zip(naive_display.pixels()) {
        for (ca, cb) in a.to_f32().iter().zip(b.to_f32()) {
            assert!((ca - cb).abs() <= 1e-2 * ca.abs().max(1.0), "{ca} vs {cb}");
        }
    }
}

#[test]
fn test_export_formats() {
    let device = Arc::new(CpuDevice::new());
    let mut work = rendered_work(&device);
    let mut display = HostDisplay::new(W, H);
    work.copy_to_gpu_display(&mut display, 0.25).unwrap();

    let dir = tempfile::tempdir().unwrap();
    for name in ["out.png", "out.exr", "out.hdr"] {
        let path = dir.path().join(name);
        display.save(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0, "{name}");
    }

    let png = image::open(dir.path().join("out.png")).unwrap();
    assert_eq!((png.width(), png.height()), (W as u32, H as u32));
}
