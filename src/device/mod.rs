//! Compute device abstraction.
//!
//! The scheduler only talks to a device through three traits:
//!
//! - [`DeviceMemory`] allocates and frees buffers and reads them back.
//! - [`Device`] creates queues, publishes named constants and graphics interop.
//! - [`DeviceQueue`] records kernel launches and memory transfers in stream
//!   order and runs them at [`synchronize`](DeviceQueue::synchronize).
//!
//! ## Architecture
//! ```text
//! PathTraceWork ──enqueue──> DeviceQueue ──synchronize──> kernels (device)
//!        │                                                   │
//!        └── DeviceVector<T> (host mirror) <── copy_from ────┘
//! ```

mod interop;
mod kernel;
mod memory;

pub mod cpu;

pub use interop::{DeviceGraphicsInterop, GraphicsInteropDestination, SharedTexture};
pub use kernel::{DeviceKernel, KernelArgs, PassRegion, NUM_INTEGRATOR_PHASES};
pub use memory::DeviceVector;

use crate::util::Result;

/// Opaque handle of a device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// A buffer plus an element offset, replacing raw device pointer arithmetic.
///
/// The offset counts elements of whatever type the consuming kernel reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSlice {
    pub buffer: BufferId,
    pub offset: usize,
}

impl DeviceSlice {
    /// Slice starting at the first element of `buffer`.
    #[inline]
    pub fn new(buffer: BufferId) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Slice advanced by `count` elements.
    #[inline]
    pub fn advance(self, count: usize) -> Self {
        Self { buffer: self.buffer, offset: self.offset + count }
    }
}

/// Static description of a device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Human readable name.
    pub name: String,
    /// Number of parallel workers the device schedules batches on.
    pub num_workers: usize,
}

/// Device memory management.
pub trait DeviceMemory: Send + Sync {
    /// Allocate a buffer of `size_bytes`; contents are unspecified.
    fn mem_alloc(&self, label: &str, size_bytes: usize) -> Result<BufferId>;

    /// Release a buffer. Unknown handles are ignored.
    fn mem_free(&self, buffer: BufferId);

    /// Read `data.len()` bytes starting at `offset_bytes`.
    ///
    /// Only valid once every queue writing the buffer has been synchronized.
    fn mem_copy_from(&self, buffer: BufferId, offset_bytes: usize, data: &mut [u8]) -> Result<()>;
}

/// A compute device.
pub trait Device: DeviceMemory {
    /// Queue type created by this device.
    type Queue: DeviceQueue;

    /// Device description.
    fn info(&self) -> DeviceInfo;

    /// Create a new queue on this device.
    fn queue_create(&self) -> Self::Queue;

    /// Publish a named table of buffer handles readable by every kernel.
    fn const_copy_to(&self, name: &str, buffers: &[BufferId]) -> Result<()>;

    /// Whether zero-copy display updates should be attempted.
    fn should_use_graphics_interop(&self) -> bool;

    /// Create the graphics interop helper for this device.
    fn graphics_interop_create(&self) -> Box<dyn DeviceGraphicsInterop>;
}

/// An in-order stream of device work.
///
/// `enqueue`, `zero_to_device` and `copy_to_device` are asynchronous; their
/// effects are only observable after [`synchronize`](Self::synchronize)
/// returned `true`.
pub trait DeviceQueue {
    /// Prepare the queue for a render session.
    fn init_execution(&mut self) -> Result<()>;

    /// Record a kernel launch over `work_size` work items.
    fn enqueue(&mut self, kernel: DeviceKernel, work_size: usize, args: KernelArgs);

    /// Record zeroing of a whole buffer.
    fn zero_to_device(&mut self, buffer: BufferId);

    /// Record an upload of `data` to the start of `buffer`.
    fn copy_to_device(&mut self, buffer: BufferId, data: Vec<u8>);

    /// Wait for all recorded work. Returns `false` if any of it failed.
    fn synchronize(&mut self) -> bool;
}
