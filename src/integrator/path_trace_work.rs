//! Wavefront path tracing on a compute device.
//!
//! [`PathTraceWork`] keeps a fixed pool of path slots busy. Each round of its
//! render loop it:
//!
//! 1. tops the pool up with camera paths from the [`WorkTileScheduler`] when
//!    it runs low,
//! 2. picks the integrator phase with the most queued paths (see
//!    [`select_kernel`]),
//! 3. compacts the slots queued for that phase into a dense index list when
//!    that is cheaper than scanning every active slot,
//! 4. launches the phase, synchronizes and reads the queue counters back.
//!
//! ```text
//!   WorkTileScheduler ──tiles──> InitFromCamera ──┐
//!                                                 v
//!   counters ──select_kernel──> compaction ──> phase kernel ──> counters
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use super::config::PathTraceConfig;
use super::state::{IntegratorQueueCounter, PathStatePool, StateField, INTEGRATOR_QUEUE_CONST, QUEUED_NONE};
use super::work_tile::{KernelWorkTile, WorkTileScheduler};
use crate::device::{
    BufferId, Device, DeviceGraphicsInterop, DeviceKernel, DeviceQueue, DeviceSlice, DeviceVector, KernelArgs,
};
use crate::render::{BufferParams, GpuDisplay, Half4, RenderBuffers};
use crate::util::{Error, Result};

/// Counters describing the work done by one [`PathTraceWork`].
#[derive(Clone, Debug, Default)]
pub struct RenderStats {
    /// Calls to `WorkTileScheduler::get_work`.
    pub num_tile_requests: usize,
    /// Work tiles turned into camera paths.
    pub num_tiles: usize,
    /// Camera paths requested from the device, converged pixels included.
    pub num_camera_paths: usize,
    /// Iterations of the render loop.
    pub num_iterations: usize,
    /// Launches per kernel, indexed by kernel id.
    pub kernel_launches: [usize; DeviceKernel::COUNT],
    /// Allocations of the naive display buffer.
    pub num_display_allocations: usize,
}

impl RenderStats {
    /// Number of launches of a kernel.
    #[inline]
    pub fn launches(&self, kernel: DeviceKernel) -> usize {
        self.kernel_launches[kernel.index()]
    }
}

/// Choose the next kernel to run from the queue counters.
///
/// The phase with the most queued paths wins, ties going to the lowest phase
/// id. Once fewer than `megakernel_threshold * max_num_paths` paths remain
/// and all of them wait for `IntersectClosest`, the megakernel finishes them
/// in one launch. Pending shadow work runs first before a phase that may
/// emit new shadow rays, and before switching to the megakernel.
pub fn select_kernel(
    counter: &IntegratorQueueCounter,
    max_num_paths: usize,
    config: &PathTraceConfig,
) -> Option<DeviceKernel> {
    let (kernel, max_num_queued) = counter.max_queued()?;
    let num_paths = counter.total();

    let use_megakernel =
        config.use_megakernel && (num_paths as f32) < config.megakernel_threshold * max_num_paths as f32;
    if use_megakernel && kernel == DeviceKernel::IntersectClosest && num_paths == max_num_queued as usize {
        return Some(DeviceKernel::Megakernel);
    }

    if use_megakernel || kernel.may_emit_shadow() {
        if counter.get(DeviceKernel::IntersectShadow) > 0 {
            return Some(DeviceKernel::IntersectShadow);
        }
        if counter.get(DeviceKernel::ShadeShadow) > 0 {
            return Some(DeviceKernel::ShadeShadow);
        }
    }

    Some(kernel)
}

/// Outcome of one round of tile generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TileRound {
    /// Camera paths were enqueued.
    Enqueued,
    /// Nothing to add this round.
    Idle,
    /// No active paths and no work left: the pass is done.
    Finished,
}

/// Compaction launched in the current batch, checked after synchronization.
#[derive(Clone, Copy, Debug)]
struct PendingCompaction {
    kernel: DeviceKernel,
    expected: usize,
}

/// Path tracer driving a [`Device`] with the wavefront scheduler.
pub struct PathTraceWork<D: Device> {
    device: Arc<D>,
    queue: D::Queue,
    config: PathTraceConfig,
    cancel: Arc<AtomicBool>,

    integrator_state: PathStatePool,
    integrator_queue_counter: DeviceVector<IntegratorQueueCounter>,
    queued_paths: DeviceVector<u32>,
    num_queued_paths: DeviceVector<u32>,
    work_tiles: DeviceVector<KernelWorkTile>,
    num_active_pixels: DeviceVector<u32>,
    display_rgba_half: DeviceVector<Half4>,

    render_buffers: RenderBuffers,
    work_tile_scheduler: WorkTileScheduler,

    /// All slots at and above this index are free.
    max_active_path_index: usize,
    pending_compaction: Option<PendingCompaction>,

    device_graphics_interop: Option<Box<dyn DeviceGraphicsInterop>>,
    interop_use_checked: bool,
    interop_use: bool,

    stats: RenderStats,
}

impl<D: Device + 'static> PathTraceWork<D> {
    /// Create the work for `device`. Call [`init_execution`](Self::init_execution)
    /// and [`set_effective_buffer_params`](Self::set_effective_buffer_params)
    /// before rendering.
    pub fn new(device: Arc<D>, config: PathTraceConfig, cancel: Arc<AtomicBool>) -> Result<Self> {
        config.validate()?;

        let queue = device.queue_create();
        let mut work_tile_scheduler = WorkTileScheduler::new();
        work_tile_scheduler.set_max_num_path_states(config.max_num_paths);
        work_tile_scheduler.set_tile_size(config.tile_size);

        Ok(Self {
            queue,
            config,
            cancel,
            integrator_state: PathStatePool::new(device.clone()),
            integrator_queue_counter: DeviceVector::new(device.clone(), "integrator_queue_counter"),
            queued_paths: DeviceVector::new(device.clone(), "queued_paths"),
            num_queued_paths: DeviceVector::new(device.clone(), "num_queued_paths"),
            work_tiles: DeviceVector::new(device.clone(), "work_tiles"),
            num_active_pixels: DeviceVector::new(device.clone(), "num_active_pixels"),
            display_rgba_half: DeviceVector::new(device.clone(), "display_rgba_half"),
            render_buffers: RenderBuffers::new(device.clone()),
            work_tile_scheduler,
            max_active_path_index: 0,
            pending_compaction: None,
            device_graphics_interop: None,
            interop_use_checked: false,
            interop_use: false,
            stats: RenderStats::default(),
            device,
        })
    }

    /// Prepare the queue and allocate path state and queue counters.
    pub fn init_execution(&mut self) -> Result<()> {
        self.queue.init_execution()?;
        self.alloc_integrator_state()?;
        self.alloc_integrator_queue()?;
        if !self.queue.synchronize() {
            return Err(Error::device("initialization of the integrator state failed"));
        }
        self.integrator_queue_counter.copy_from_device()?;
        Ok(())
    }

    fn alloc_integrator_state(&mut self) -> Result<()> {
        let capacity = self.max_num_paths();
        if self
            .integrator_state
            .alloc(self.device.as_ref(), &mut self.queue, capacity)?
        {
            info!("Allocated integrator state for {} paths", capacity);
        }
        Ok(())
    }

    fn alloc_integrator_queue(&mut self) -> Result<()> {
        if self.integrator_queue_counter.size() == 0 {
            self.integrator_queue_counter.alloc(1)?;
            self.integrator_queue_counter.zero_to_device(&mut self.queue);
            let buffer = self.device_pointer(&self.integrator_queue_counter)?;
            self.device.const_copy_to(INTEGRATOR_QUEUE_CONST, &[buffer])?;
        }
        if self.queued_paths.size() < self.max_num_paths() {
            self.queued_paths.alloc(self.max_num_paths())?;
        }
        if self.num_queued_paths.size() == 0 {
            self.num_queued_paths.alloc(1)?;
        }
        if self.num_active_pixels.size() == 0 {
            self.num_active_pixels.alloc(1)?;
        }
        Ok(())
    }

    /// Point rendering at a (re)sized render buffer, zeroing its passes.
    pub fn set_effective_buffer_params(&mut self, params: BufferParams) -> Result<()> {
        self.render_buffers.reset(params, &mut self.queue)?;
        debug!("Render buffer set to {}x{} at ({}, {})", params.width, params.height, params.full_x, params.full_y);
        Ok(())
    }

    /// Render buffers written by the kernels.
    pub fn render_buffers(&self) -> &RenderBuffers {
        &self.render_buffers
    }

    /// Refresh the host copy of the render buffers.
    pub fn copy_render_buffers_from_device(&mut self) -> Result<()> {
        if !self.queue.synchronize() {
            return Err(Error::device("pending device work failed"));
        }
        self.render_buffers.copy_from_device()
    }

    /// Capacity of the path state pool.
    #[inline]
    pub fn max_num_paths(&self) -> usize {
        self.config.max_num_paths
    }

    /// Number of active paths according to the last counter read-back.
    pub fn get_num_active_paths(&self) -> usize {
        self.queue_counter().total()
    }

    /// Bound of the slot range that may hold active paths.
    pub fn max_active_path_index(&self) -> usize {
        self.max_active_path_index
    }

    /// Queue counters as last read back from the device.
    pub fn queue_counter(&self) -> IntegratorQueueCounter {
        self.integrator_queue_counter.data().first().copied().unwrap_or_default()
    }

    /// Activity counters.
    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    /// Whether display updates still go through graphics interop.
    pub fn interop_use(&self) -> bool {
        self.interop_use
    }

    /// Configuration in use.
    pub fn config(&self) -> &PathTraceConfig {
        &self.config
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn device_pointer<T: bytemuck::Pod>(&self, vector: &DeviceVector<T>) -> Result<BufferId> {
        vector
            .device_pointer()
            .ok_or_else(|| Error::buffer(format!("'{}' is not allocated", vector.label())))
    }

    fn render_buffer_pointer(&self) -> Result<BufferId> {
        self.render_buffers
            .device_pointer()
            .ok_or_else(|| Error::buffer("render buffer is not allocated"))
    }

    fn enqueue(&mut self, kernel: DeviceKernel, work_size: usize, args: KernelArgs) {
        trace!("enqueue {} over {} items", kernel, work_size);
        self.stats.kernel_launches[kernel.index()] += 1;
        self.queue.enqueue(kernel, work_size, args);
    }

    /// Render `samples_num` samples per pixel starting at `start_sample`.
    ///
    /// Returns once every camera path of the range has terminated, or once
    /// cancellation was requested and the in-flight paths drained. Device
    /// failures stop the loop at once; samples finished so far stay in the
    /// render buffer.
    #[tracing::instrument(skip_all, fields(start_sample = start_sample, samples_num = samples_num))]
    pub fn render_samples(&mut self, start_sample: u32, samples_num: u32) -> Result<()> {
        if !self.integrator_state.is_allocated() || self.integrator_queue_counter.size() == 0 {
            return Err(Error::buffer("integrator state is not allocated, call init_execution first"));
        }
        self.render_buffer_pointer()?;

        self.work_tile_scheduler
            .reset(&self.render_buffers.params, start_sample, samples_num);

        let iterations_before = self.stats.num_iterations;
        loop {
            match self.enqueue_work_tiles()? {
                TileRound::Finished => break,
                TileRound::Enqueued => self.synchronize()?,
                TileRound::Idle => {}
            }

            if self.enqueue_path_iteration()? {
                self.synchronize()?;
            }
            self.stats.num_iterations += 1;
        }

        info!(
            "Rendered samples {}..{} in {} iterations ({} tiles, {} megakernel launches)",
            start_sample,
            start_sample + samples_num,
            self.stats.num_iterations - iterations_before,
            self.stats.num_tiles,
            self.stats.launches(DeviceKernel::Megakernel)
        );
        Ok(())
    }

    /// Wait for the batch, then read the counters back and run the checks.
    fn synchronize(&mut self) -> Result<()> {
        if !self.queue.synchronize() {
            self.pending_compaction = None;
            return Err(Error::device("device queue reported failure, render pass aborted"));
        }
        self.integrator_queue_counter.copy_from_device()?;
        self.verify_compaction()?;
        if self.config.check_invariants {
            self.check_invariants()?;
        }
        Ok(())
    }

    fn verify_compaction(&mut self) -> Result<()> {
        let Some(pending) = self.pending_compaction.take() else {
            return Ok(());
        };
        self.num_queued_paths.copy_from_device()?;
        let produced = self.num_queued_paths.data().first().copied().unwrap_or(0) as usize;
        if produced != pending.expected {
            return Err(Error::consistency(format!(
                "{} produced {} paths, expected {}",
                pending.kernel, produced, pending.expected
            )));
        }
        Ok(())
    }

    /// Compare the counters with the phases stored in the path slots.
    pub fn check_invariants(&self) -> Result<()> {
        let counter = self.queue_counter();
        let (histogram, active) = self.integrator_state.queued_histogram()?;
        if histogram != counter {
            return Err(Error::consistency(format!(
                "queue counters {:?} disagree with slot phases {:?}",
                counter.num_queued, histogram.num_queued
            )));
        }
        if active > self.max_num_paths() {
            return Err(Error::consistency(format!(
                "{active} active paths exceed capacity {}",
                self.max_num_paths()
            )));
        }

        let queued = self.integrator_state.read_u32_field(StateField::PathQueuedKernel)?;
        let beyond = queued.get(self.max_active_path_index..).unwrap_or_default();
        if let Some(offset) = beyond.iter().position(|&q| q != QUEUED_NONE) {
            return Err(Error::consistency(format!(
                "slot {} is active above max active path index {}",
                self.max_active_path_index + offset,
                self.max_active_path_index
            )));
        }
        Ok(())
    }

    fn enqueue_work_tiles(&mut self) -> Result<TileRound> {
        let max_num_paths = self.max_num_paths();
        let mut num_paths = self.get_num_active_paths();

        if num_paths == 0 {
            self.max_active_path_index = 0;
        }

        if self.is_cancel_requested() {
            return Ok(if num_paths == 0 { TileRound::Finished } else { TileRound::Idle });
        }

        let mut work_tiles: SmallVec<[KernelWorkTile; 8]> = SmallVec::new();

        if num_paths == 0 || (num_paths as f32) < self.config.regenerate_threshold * max_num_paths as f32 {
            while num_paths < max_num_paths {
                self.stats.num_tile_requests += 1;
                match self.work_tile_scheduler.get_work(max_num_paths - num_paths) {
                    Some(tile) => {
                        num_paths += tile.work_size();
                        work_tiles.push(tile);
                    }
                    None => break,
                }
            }

            if work_tiles.is_empty() && num_paths == 0 {
                return Ok(TileRound::Finished);
            }
        }

        if work_tiles.is_empty() {
            return Ok(TileRound::Idle);
        }

        self.enqueue_init_from_camera(&work_tiles)?;
        Ok(TileRound::Enqueued)
    }

    fn enqueue_init_from_camera(&mut self, tiles: &[KernelWorkTile]) -> Result<()> {
        if self.work_tiles.size() < tiles.len() {
            self.work_tiles.alloc(tiles.len())?;
        }
        self.work_tiles.data_mut()[..tiles.len()].copy_from_slice(tiles);
        self.work_tiles.copy_to_device(&mut self.queue);

        let tiles_buffer = self.device_pointer(&self.work_tiles)?;
        let render_buffer = self.render_buffer_pointer()?;

        // Free slots come from the terminated list once slots were handed out.
        let path_index = if self.max_active_path_index != 0 {
            self.compute_queued_paths(DeviceKernel::TerminatedPathsArray, None)?;
            Some(DeviceSlice::new(self.device_pointer(&self.queued_paths)?))
        } else {
            None
        };

        let mut num_paths = 0;
        for (i, tile) in tiles.iter().enumerate() {
            let work_size = tile.work_size();
            self.enqueue(
                DeviceKernel::InitFromCamera,
                work_size,
                KernelArgs::InitFromCamera {
                    path_index: path_index.map(|p| p.advance(num_paths)),
                    work_tile: DeviceSlice::new(tiles_buffer).advance(i),
                    render_buffer,
                    work_size,
                    path_index_offset: num_paths,
                },
            );
            num_paths += work_size;
        }

        self.stats.num_tiles += tiles.len();
        self.stats.num_camera_paths += num_paths;
        self.max_active_path_index = (self.max_active_path_index + num_paths).min(self.max_num_paths());
        Ok(())
    }

    fn enqueue_path_iteration(&mut self) -> Result<bool> {
        let counter = self.queue_counter();
        let Some(kernel) = select_kernel(&counter, self.max_num_paths(), &self.config) else {
            return Ok(false);
        };
        self.enqueue_path_iteration_kernel(kernel, &counter)?;
        Ok(true)
    }

    fn enqueue_path_iteration_kernel(&mut self, kernel: DeviceKernel, counter: &IntegratorQueueCounter) -> Result<()> {
        let queue_kernel = if kernel == DeviceKernel::Megakernel {
            DeviceKernel::IntersectClosest
        } else {
            kernel
        };
        let num_queued = counter.get(queue_kernel) as usize;
        if num_queued > self.max_active_path_index {
            return Err(Error::consistency(format!(
                "{num_queued} paths queued for {queue_kernel} above max active path index {}",
                self.max_active_path_index
            )));
        }

        // Scan every active slot, or compact when that touches fewer slots.
        let mut work_size = self.max_active_path_index;
        let mut path_index = None;
        if num_queued < work_size {
            work_size = num_queued;
            let compaction = if kernel.is_shadow() {
                DeviceKernel::QueuedShadowPathsArray
            } else {
                DeviceKernel::QueuedPathsArray
            };
            self.compute_queued_paths(compaction, Some(queue_kernel))?;
            path_index = Some(DeviceSlice::new(self.device_pointer(&self.queued_paths)?));
        }

        let args = match kernel {
            DeviceKernel::IntersectClosest | DeviceKernel::IntersectShadow | DeviceKernel::IntersectSubsurface => {
                KernelArgs::Intersect { path_index, work_size }
            }
            DeviceKernel::ShadeBackground
            | DeviceKernel::ShadeLight
            | DeviceKernel::ShadeShadow
            | DeviceKernel::ShadeSurface
            | DeviceKernel::ShadeVolume
            | DeviceKernel::Megakernel => KernelArgs::Shade {
                path_index,
                render_buffer: self.render_buffer_pointer()?,
                work_size,
            },
            other => {
                return Err(Error::consistency(format!("{other} is not a path iteration kernel")));
            }
        };
        self.enqueue(kernel, work_size, args);
        Ok(())
    }

    /// Enqueue compaction of the slots queued for `queued_kernel`, or of the
    /// free slots when it is `None`.
    fn compute_queued_paths(&mut self, kernel: DeviceKernel, queued_kernel: Option<DeviceKernel>) -> Result<()> {
        let (work_size, expected) = match queued_kernel {
            Some(queued) => (self.max_active_path_index, self.queue_counter().get(queued) as usize),
            None => (self.max_num_paths(), self.max_num_paths() - self.get_num_active_paths()),
        };

        let queued_paths = self.device_pointer(&self.queued_paths)?;
        let num_queued_paths = self.device_pointer(&self.num_queued_paths)?;
        self.num_queued_paths.zero_to_device(&mut self.queue);

        self.pending_compaction = Some(PendingCompaction { kernel, expected });
        self.enqueue(
            kernel,
            work_size,
            KernelArgs::Compact {
                work_size,
                queued_paths,
                num_queued_paths,
                queued_kernel,
            },
        );
        Ok(())
    }

    // ========================================================================
    // Display
    // ========================================================================

    /// Convert the render buffer to half floats and hand it to `display`.
    ///
    /// Uses graphics interop when the device supports it; the first failed
    /// mapping switches to the copy path for the rest of the session.
    #[tracing::instrument(skip_all)]
    pub fn copy_to_gpu_display(&mut self, display: &mut dyn GpuDisplay, sample_scale: f32) -> Result<()> {
        if !self.interop_use_checked {
            self.interop_use = self.device.should_use_graphics_interop();
            if self.interop_use {
                debug!("Will be using graphics interop display update");
            } else {
                debug!("Will be using naive display update");
            }
            self.interop_use_checked = true;
        }

        if self.interop_use && !display.graphics_interop_supported() {
            debug!("Display cannot share its texture, using naive display update");
            self.interop_use = false;
        }

        if self.interop_use {
            match self.copy_to_gpu_display_interop(display, sample_scale) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e @ Error::Interop(_)) => {
                    warn!("{}, falling back to naive display update", e);
                    self.interop_use = false;
                }
                Err(e) => return Err(e),
            }
        }

        self.copy_to_gpu_display_naive(display, sample_scale)
    }

    fn copy_to_gpu_display_naive(&mut self, display: &mut dyn GpuDisplay, sample_scale: f32) -> Result<()> {
        let params = self.render_buffers.params;
        let num_pixels = params.num_pixels();
        if num_pixels == 0 {
            return Ok(());
        }

        if self.display_rgba_half.size() != num_pixels {
            self.display_rgba_half.alloc(num_pixels)?;
            self.display_rgba_half.zero_to_device(&mut self.queue);
            self.stats.num_display_allocations += 1;
        }

        let rgba_half = DeviceSlice::new(self.device_pointer(&self.display_rgba_half)?);
        self.enqueue_film_convert(rgba_half, sample_scale)?;
        if !self.queue.synchronize() {
            return Err(Error::device("film conversion failed"));
        }

        self.display_rgba_half.copy_from_device()?;
        display.copy_pixels_to_texture(self.display_rgba_half.data(), params.width, params.height)
    }

    /// Returns `false` when the destination does not match the render size,
    /// in which case this update goes through the copy path.
    fn copy_to_gpu_display_interop(&mut self, display: &mut dyn GpuDisplay, sample_scale: f32) -> Result<bool> {
        let params = self.render_buffers.params;
        let destination = display.graphics_interop_get();
        if (destination.width, destination.height) != (params.width, params.height) {
            debug!(
                "Display is {}x{}, render is {}x{}: using naive update",
                destination.width, destination.height, params.width, params.height
            );
            return Ok(false);
        }

        let device = &self.device;
        let interop = self
            .device_graphics_interop
            .get_or_insert_with(|| device.graphics_interop_create());
        interop.set_destination(destination);

        let rgba_half = interop
            .map()
            .ok_or_else(|| Error::Interop("could not map the display texture".into()))?;

        self.enqueue_film_convert(rgba_half, sample_scale)?;
        let synchronized = self.queue.synchronize();
        if let Some(interop) = self.device_graphics_interop.as_mut() {
            interop.unmap();
        }
        if !synchronized {
            return Err(Error::device("film conversion into the display texture failed"));
        }
        Ok(true)
    }

    fn enqueue_film_convert(&mut self, rgba_half: DeviceSlice, sample_scale: f32) -> Result<()> {
        let params = self.render_buffers.params;
        let render_buffer = self.render_buffer_pointer()?;
        self.enqueue(
            DeviceKernel::ConvertToHalfFloat,
            params.num_pixels(),
            KernelArgs::FilmConvert {
                rgba_half,
                render_buffer,
                sample_scale,
                per_pixel_sample_count: self.config.adaptive.enabled,
                region: params.pass_region(),
            },
        );
        Ok(())
    }

    // ========================================================================
    // Adaptive sampling
    // ========================================================================

    /// Run the convergence check and both neighbour filters.
    ///
    /// Returns `true` when no pixel is left that needs more samples.
    #[tracing::instrument(skip_all, fields(sample = sample))]
    pub fn adaptive_sampling_converge_and_filter(&mut self, sample: u32) -> Result<bool> {
        let params = self.render_buffers.params;
        let region = params.pass_region();
        let render_buffer = self.render_buffer_pointer()?;
        let num_active_pixels = self.device_pointer(&self.num_active_pixels)?;
        let adaptive = self.config.adaptive;

        self.num_active_pixels.zero_to_device(&mut self.queue);
        self.enqueue(
            DeviceKernel::AdaptiveSamplingConvergenceCheck,
            params.num_pixels(),
            KernelArgs::AdaptiveCheck {
                render_buffer,
                region,
                sample,
                min_samples: adaptive.min_samples,
                threshold: adaptive.threshold,
                num_active_pixels,
            },
        );
        self.enqueue(
            DeviceKernel::AdaptiveSamplingFilterX,
            params.height,
            KernelArgs::AdaptiveFilter { render_buffer, region },
        );
        self.enqueue(
            DeviceKernel::AdaptiveSamplingFilterY,
            params.width,
            KernelArgs::AdaptiveFilter { render_buffer, region },
        );

        if !self.queue.synchronize() {
            return Err(Error::device("adaptive sampling filter failed"));
        }
        self.num_active_pixels.copy_from_device()?;
        let num_active = self.num_active_pixels.data().first().copied().unwrap_or(0);
        debug!("Adaptive sampling at sample {}: {} pixels still active", sample, num_active);
        Ok(num_active == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu::CpuDevice;

    fn config(max_num_paths: usize) -> PathTraceConfig {
        PathTraceConfig { max_num_paths, ..Default::default() }
    }

    #[test]
    fn test_megakernel_threshold() {
        let config = config(1000);
        let counter = IntegratorQueueCounter::with(DeviceKernel::IntersectClosest, 90);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::Megakernel));

        let counter = IntegratorQueueCounter::with(DeviceKernel::IntersectClosest, 150);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::IntersectClosest));
    }

    #[test]
    fn test_megakernel_needs_all_paths_at_intersect_closest() {
        let config = config(1000);
        let mut counter = IntegratorQueueCounter::with(DeviceKernel::IntersectClosest, 60);
        counter.set(DeviceKernel::ShadeBackground, 20);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::IntersectClosest));

        // Low occupancy drains shadows before anything else.
        counter.set(DeviceKernel::ShadeShadow, 5);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::ShadeShadow));
    }

    #[test]
    fn test_megakernel_disabled() {
        let config = PathTraceConfig { use_megakernel: false, ..config(1000) };
        let counter = IntegratorQueueCounter::with(DeviceKernel::IntersectClosest, 10);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::IntersectClosest));
    }

    #[test]
    fn test_shadow_priority() {
        let config = config(1000);
        let mut counter = IntegratorQueueCounter::with(DeviceKernel::ShadeSurface, 400);
        counter.set(DeviceKernel::IntersectShadow, 100);
        counter.set(DeviceKernel::ShadeShadow, 50);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::IntersectShadow));

        counter.set(DeviceKernel::IntersectShadow, 0);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::ShadeShadow));

        counter.set(DeviceKernel::ShadeShadow, 0);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::ShadeSurface));
    }

    #[test]
    fn test_no_shadow_priority_for_other_phases() {
        let config = config(1000);
        let mut counter = IntegratorQueueCounter::with(DeviceKernel::ShadeBackground, 400);
        counter.set(DeviceKernel::IntersectShadow, 300);
        assert_eq!(select_kernel(&counter, 1000, &config), Some(DeviceKernel::ShadeBackground));
    }

    #[test]
    fn test_select_empty() {
        assert_eq!(select_kernel(&IntegratorQueueCounter::default(), 1000, &config(1000)), None);
    }

    #[test]
    fn test_render_requires_init() {
        let device = Arc::new(CpuDevice::new());
        let mut work = PathTraceWork::new(device, config(64), Arc::default()).unwrap();
        work.set_effective_buffer_params(BufferParams::new(4, 4)).unwrap();
        assert!(matches!(work.render_samples(0, 1), Err(Error::InvalidBuffer(_))));
    }

    #[test]
    fn test_init_execution_idempotent() {
        let device = Arc::new(CpuDevice::new());
        let mut work = PathTraceWork::new(device.clone(), config(64), Arc::default()).unwrap();
        work.init_execution().unwrap();
        let allocations = device.stats().num_allocations;
        work.init_execution().unwrap();
        assert_eq!(device.stats().num_allocations, allocations);
        assert_eq!(work.get_num_active_paths(), 0);
    }

    fn work_with_active_paths(regenerate_threshold: f32, active: u32) -> PathTraceWork<CpuDevice> {
        let device = Arc::new(CpuDevice::new());
        let config = PathTraceConfig { regenerate_threshold, ..config(64) };
        let mut work = PathTraceWork::new(device, config, Arc::default()).unwrap();
        work.init_execution().unwrap();
        let params = BufferParams::new(16, 16);
        work.set_effective_buffer_params(params).unwrap();
        work.work_tile_scheduler.reset(&params, 0, 1);

        work.integrator_queue_counter.data_mut()[0] = IntegratorQueueCounter::with(DeviceKernel::ShadeSurface, active);
        work.max_active_path_index = active as usize;
        work
    }

    #[test]
    fn test_no_top_up_above_regenerate_threshold() {
        // 40 of 64 slots busy is above half the capacity.
        let mut work = work_with_active_paths(0.5, 40);
        assert_eq!(work.enqueue_work_tiles().unwrap(), TileRound::Idle);
        assert_eq!(work.stats.num_tile_requests, 0);
        assert_eq!(work.stats.launches(DeviceKernel::InitFromCamera), 0);
    }

    #[test]
    fn test_top_up_below_regenerate_threshold() {
        let mut work = work_with_active_paths(0.5, 20);
        assert_eq!(work.enqueue_work_tiles().unwrap(), TileRound::Enqueued);
        assert!(work.stats.num_tile_requests > 0);
        assert_eq!(work.stats.launches(DeviceKernel::TerminatedPathsArray), 1);
        assert!(work.stats.launches(DeviceKernel::InitFromCamera) > 0);
        // Top-up never exceeds the free slots.
        assert!(work.stats.num_camera_paths > 0);
        assert!(work.stats.num_camera_paths <= 44);
        assert_eq!(work.max_active_path_index(), 20 + work.stats.num_camera_paths);
    }

    #[test]
    fn test_zero_regenerate_threshold_waits_for_empty_pool() {
        let mut work = work_with_active_paths(0.0, 1);
        assert_eq!(work.enqueue_work_tiles().unwrap(), TileRound::Idle);
        assert_eq!(work.stats.num_tile_requests, 0);

        let mut work = work_with_active_paths(0.0, 0);
        assert_eq!(work.enqueue_work_tiles().unwrap(), TileRound::Enqueued);
        assert_eq!(work.stats.launches(DeviceKernel::TerminatedPathsArray), 0);
    }
}
