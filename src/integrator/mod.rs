//! Wavefront integrator scheduling.
//!
//! - [`state`]: path slot storage and queue counters
//! - [`WorkTileScheduler`]: splits a sample range into camera path work tiles
//! - [`PathTraceWork`]: the render loop driving a device
//! - [`PathTraceConfig`]: tunables, loadable from JSON

mod config;
mod path_trace_work;
pub mod state;
mod work_tile;

pub use config::{AdaptiveSamplingConfig, PathTraceConfig};
pub use path_trace_work::{select_kernel, PathTraceWork, RenderStats};
pub use state::{IntegratorQueueCounter, PathStatePool, StateField};
pub use work_tile::{KernelWorkTile, WorkTileScheduler};
