//! Render buffers and the display side of the scheduler.
//!
//! - [`RenderBuffers`]: per-pixel accumulation passes written by the kernels
//! - [`GpuDisplay`]: destination of converted half-float images
//! - [`HostDisplay`]: in-memory display, also used for image export

mod buffers;
mod display;
#[cfg(feature = "wgpu")]
mod wgpu_display;

pub use buffers::{
    BufferParams, RenderBuffers, PASS_ADAPTIVE_CONVERGED, PASS_COMBINED, PASS_COMBINED_SQUARED, PASS_SAMPLE_COUNT,
    PASS_STRIDE,
};
pub use display::{linear_to_srgb, GpuDisplay, Half4, HostDisplay};
#[cfg(feature = "wgpu")]
pub use wgpu_display::WgpuDisplay;
