//! Kernel identifiers and their argument shapes.
//!
//! Every kernel a [`DeviceQueue`](super::DeviceQueue) can run is a variant of
//! [`DeviceKernel`]. The integrator phases come first so that their index
//! doubles as the slot of their queue counter.

use std::fmt;

use super::{BufferId, DeviceSlice};

/// Number of integrator phases that own a queue counter.
pub const NUM_INTEGRATOR_PHASES: usize = 8;

/// All kernels known to a compute device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum DeviceKernel {
    // Integrator phases (queue counters are indexed by these)
    IntersectClosest = 0,
    IntersectShadow = 1,
    IntersectSubsurface = 2,
    ShadeBackground = 3,
    ShadeLight = 4,
    ShadeShadow = 5,
    ShadeSurface = 6,
    ShadeVolume = 7,

    /// Runs the whole per-path state machine in one dispatch
    Megakernel = 8,
    /// Initializes camera paths from work tiles
    InitFromCamera = 9,

    // Compaction
    QueuedPathsArray = 10,
    QueuedShadowPathsArray = 11,
    TerminatedPathsArray = 12,

    // Film
    ConvertToHalfFloat = 13,

    // Adaptive sampling
    AdaptiveSamplingConvergenceCheck = 14,
    AdaptiveSamplingFilterX = 15,
    AdaptiveSamplingFilterY = 16,
}

impl DeviceKernel {
    /// Total number of kernels.
    pub const COUNT: usize = 17;

    /// Every kernel, in id order.
    pub const ALL: [DeviceKernel; Self::COUNT] = [
        Self::IntersectClosest,
        Self::IntersectShadow,
        Self::IntersectSubsurface,
        Self::ShadeBackground,
        Self::ShadeLight,
        Self::ShadeShadow,
        Self::ShadeSurface,
        Self::ShadeVolume,
        Self::Megakernel,
        Self::InitFromCamera,
        Self::QueuedPathsArray,
        Self::QueuedShadowPathsArray,
        Self::TerminatedPathsArray,
        Self::ConvertToHalfFloat,
        Self::AdaptiveSamplingConvergenceCheck,
        Self::AdaptiveSamplingFilterX,
        Self::AdaptiveSamplingFilterY,
    ];

    /// Integrator phases in priority order (lowest id first).
    pub const INTEGRATOR_PHASES: [DeviceKernel; NUM_INTEGRATOR_PHASES] = [
        Self::IntersectClosest,
        Self::IntersectShadow,
        Self::IntersectSubsurface,
        Self::ShadeBackground,
        Self::ShadeLight,
        Self::ShadeShadow,
        Self::ShadeSurface,
        Self::ShadeVolume,
    ];

    /// Numeric id of this kernel.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Kernel for a numeric id.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Whether this kernel is an integrator phase with its own queue counter.
    #[inline]
    pub const fn is_integrator_phase(self) -> bool {
        (self as usize) < NUM_INTEGRATOR_PHASES
    }

    /// Whether this kernel processes shadow rays.
    #[inline]
    pub const fn is_shadow(self) -> bool {
        matches!(self, Self::IntersectShadow | Self::ShadeShadow)
    }

    /// Whether this kernel may emit a new shadow ray for a path.
    #[inline]
    pub const fn may_emit_shadow(self) -> bool {
        matches!(self, Self::ShadeSurface | Self::ShadeVolume)
    }

    /// Kernel name used in logs and statistics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::IntersectClosest => "integrator_intersect_closest",
            Self::IntersectShadow => "integrator_intersect_shadow",
            Self::IntersectSubsurface => "integrator_intersect_subsurface",
            Self::ShadeBackground => "integrator_shade_background",
            Self::ShadeLight => "integrator_shade_light",
            Self::ShadeShadow => "integrator_shade_shadow",
            Self::ShadeSurface => "integrator_shade_surface",
            Self::ShadeVolume => "integrator_shade_volume",
            Self::Megakernel => "integrator_megakernel",
            Self::InitFromCamera => "integrator_init_from_camera",
            Self::QueuedPathsArray => "integrator_queued_paths_array",
            Self::QueuedShadowPathsArray => "integrator_queued_shadow_paths_array",
            Self::TerminatedPathsArray => "integrator_terminated_paths_array",
            Self::ConvertToHalfFloat => "convert_to_half_float",
            Self::AdaptiveSamplingConvergenceCheck => "adaptive_sampling_convergence_check",
            Self::AdaptiveSamplingFilterX => "adaptive_sampling_filter_x",
            Self::AdaptiveSamplingFilterY => "adaptive_sampling_filter_y",
        }
    }
}

impl fmt::Display for DeviceKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel region of a render buffer addressed by a film or adaptive kernel.
///
/// Pixel `(x, y)` in full-frame coordinates lives at render-buffer pixel
/// `offset + x + y * stride`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassRegion {
    pub full_x: i32,
    pub full_y: i32,
    pub width: i32,
    pub height: i32,
    pub offset: i32,
    pub stride: i32,
}

impl PassRegion {
    /// Number of pixels in the region.
    #[inline]
    pub fn num_pixels(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }

    /// Render-buffer pixel index of a region-local pixel.
    #[inline]
    pub fn buffer_pixel(&self, x: i32, y: i32) -> usize {
        (self.offset + (self.full_x + x) + (self.full_y + y) * self.stride) as usize
    }
}

/// Arguments of one kernel launch.
///
/// Each variant is the argument shape of a family of kernels; the queue
/// rejects a launch whose shape does not match the kernel.
#[derive(Clone, Debug)]
pub enum KernelArgs {
    /// Ray intersection phases.
    Intersect {
        path_index: Option<DeviceSlice>,
        work_size: usize,
    },
    /// Shading phases and the megakernel.
    Shade {
        path_index: Option<DeviceSlice>,
        render_buffer: BufferId,
        work_size: usize,
    },
    /// Camera path initialization from one work tile.
    InitFromCamera {
        path_index: Option<DeviceSlice>,
        work_tile: DeviceSlice,
        render_buffer: BufferId,
        work_size: usize,
        path_index_offset: usize,
    },
    /// Compaction of queued or terminated paths.
    Compact {
        work_size: usize,
        queued_paths: BufferId,
        num_queued_paths: BufferId,
        queued_kernel: Option<DeviceKernel>,
    },
    /// Radiance to half-float conversion.
    FilmConvert {
        rgba_half: DeviceSlice,
        render_buffer: BufferId,
        sample_scale: f32,
        per_pixel_sample_count: bool,
        region: PassRegion,
    },
    /// Adaptive sampling convergence check.
    AdaptiveCheck {
        render_buffer: BufferId,
        region: PassRegion,
        sample: u32,
        min_samples: u32,
        threshold: f32,
        num_active_pixels: BufferId,
    },
    /// Adaptive sampling neighbour filter (X or Y).
    AdaptiveFilter {
        render_buffer: BufferId,
        region: PassRegion,
    },
}

impl KernelArgs {
    /// Whether this argument shape is accepted by `kernel`.
    pub fn matches(&self, kernel: DeviceKernel) -> bool {
        use DeviceKernel as K;
        match self {
            Self::Intersect { .. } => matches!(
                kernel,
                K::IntersectClosest | K::IntersectShadow | K::IntersectSubsurface
            ),
            Self::Shade { .. } => matches!(
                kernel,
                K::ShadeBackground
                    | K::ShadeLight
                    | K::ShadeShadow
                    | K::ShadeSurface
                    | K::ShadeVolume
                    | K::Megakernel
            ),
            Self::InitFromCamera { .. } => kernel == K::InitFromCamera,
            Self::Compact { .. } => matches!(
                kernel,
                K::QueuedPathsArray | K::QueuedShadowPathsArray | K::TerminatedPathsArray
            ),
            Self::FilmConvert { .. } => kernel == K::ConvertToHalfFloat,
            Self::AdaptiveCheck { .. } => kernel == K::AdaptiveSamplingConvergenceCheck,
            Self::AdaptiveFilter { .. } => {
                matches!(kernel, K::AdaptiveSamplingFilterX | K::AdaptiveSamplingFilterY)
            }
        }
    }
}
