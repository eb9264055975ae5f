//! # Wavefront
//!
//! Wavefront path tracing scheduler for compute devices.
//!
//! Instead of tracing each camera path to completion in one kernel, paths
//! live in a fixed pool of slots and advance one integrator phase at a time.
//! Every round the scheduler launches the phase with the most pending paths,
//! refills the pool from work tiles when it drains, and switches to a
//! megakernel once too few paths remain to fill the device.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math helpers
//! - [`device`] - Device, queue and memory traits, plus the host [`device::cpu`] device
//! - [`integrator`] - Path state, work tiles and the [`PathTraceWork`] render loop
//! - [`render`] - Render buffers and display updates
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wavefront::prelude::*;
//!
//! let device = Arc::new(CpuDevice::new());
//! let mut work = PathTraceWork::new(device, PathTraceConfig::default(), Arc::default())?;
//! work.init_execution()?;
//! work.set_effective_buffer_params(BufferParams::new(64, 64))?;
//! work.render_samples(0, 16)?;
//!
//! let mut display = HostDisplay::new(64, 64);
//! work.copy_to_gpu_display(&mut display, 1.0 / 16.0)?;
//! display.save("render.png".as_ref())?;
//! ```

pub mod device;
pub mod integrator;
pub mod render;
pub mod util;

// Re-export commonly used types
pub use integrator::{PathTraceConfig, PathTraceWork};
pub use util::{Error, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::device::cpu::{CpuDevice, Scene};
    pub use crate::device::{Device, DeviceKernel, DeviceQueue};
    pub use crate::integrator::{AdaptiveSamplingConfig, PathTraceConfig, PathTraceWork, RenderStats};
    pub use crate::render::{BufferParams, GpuDisplay, HostDisplay, RenderBuffers};
    pub use crate::util::{Error, Result};
}
