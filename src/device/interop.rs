//! Zero-copy sharing of a display texture with a compute device.

use std::sync::Arc;

use parking_lot::RwLock;

use super::DeviceSlice;

/// Texture memory a display is willing to share with a device.
///
/// Storage holds packed `f16` RGBA pixels, two channels per word.
#[derive(Clone, Debug)]
pub struct SharedTexture {
    pub width: usize,
    pub height: usize,
    pub storage: Arc<RwLock<Vec<u32>>>,
}

impl SharedTexture {
    /// Allocate a zeroed texture.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            storage: Arc::new(RwLock::new(vec![0u32; width * height * 2])),
        }
    }
}

/// Where an interop update should land.
#[derive(Clone, Debug, Default)]
pub struct GraphicsInteropDestination {
    pub width: usize,
    pub height: usize,
    /// `None` when the display cannot share its texture.
    pub texture: Option<SharedTexture>,
}

/// Device side of a graphics interop session.
pub trait DeviceGraphicsInterop: Send {
    /// Point subsequent `map` calls at a new destination.
    fn set_destination(&mut self, destination: GraphicsInteropDestination);

    /// Map the destination into device address space.
    ///
    /// Returns `None` when mapping failed; callers fall back to a copy.
    fn map(&mut self) -> Option<DeviceSlice>;

    /// Release the mapping made by `map`.
    fn unmap(&mut self);
}
