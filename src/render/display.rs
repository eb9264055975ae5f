//! Display side of the bridge: where converted half-float pixels end up.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use half::f16;
use image::{DynamicImage, Rgba32FImage};

use crate::device::{GraphicsInteropDestination, SharedTexture};
use crate::util::{Error, Result, Vec3};

/// Half-precision RGBA pixel as written by the film conversion kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Half4 {
    pub x: f16,
    pub y: f16,
    pub z: f16,
    pub w: f16,
}

impl Half4 {
    /// Encode a linear color, flushing negative and non-finite values to zero.
    #[inline]
    pub fn from_rgb(color: Vec3, alpha: f32) -> Self {
        let clean = |v: f32| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        Self {
            x: f16::from_f32(clean(color.x)),
            y: f16::from_f32(clean(color.y)),
            z: f16::from_f32(clean(color.z)),
            w: f16::from_f32(alpha),
        }
    }

    /// Widen to `f32` channels.
    #[inline]
    pub fn to_f32(self) -> [f32; 4] {
        [self.x.to_f32(), self.y.to_f32(), self.z.to_f32(), self.w.to_f32()]
    }
}

/// A display that can present half-float images.
pub trait GpuDisplay {
    /// Whether this display can share its texture with a device at all.
    fn graphics_interop_supported(&self) -> bool {
        true
    }

    /// Describe the texture interop updates should write into.
    fn graphics_interop_get(&mut self) -> GraphicsInteropDestination;

    /// Upload a full image through host memory.
    fn copy_pixels_to_texture(&mut self, pixels: &[Half4], width: usize, height: usize) -> Result<()>;
}

/// Display keeping its texture in host memory.
///
/// With interop enabled the texture is handed to the device, which writes
/// converted pixels straight into it.
pub struct HostDisplay {
    texture: SharedTexture,
    interop_enabled: bool,
    num_naive_updates: usize,
    num_interop_requests: usize,
}

impl HostDisplay {
    /// Create a display of the given size with interop enabled.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            texture: SharedTexture::new(width, height),
            interop_enabled: true,
            num_naive_updates: 0,
            num_interop_requests: 0,
        }
    }

    /// Enable or disable sharing the texture with the device.
    pub fn with_interop(mut self, enabled: bool) -> Self {
        self.interop_enabled = enabled;
        self
    }

    /// Texture width.
    pub fn width(&self) -> usize {
        self.texture.width
    }

    /// Texture height.
    pub fn height(&self) -> usize {
        self.texture.height
    }

    /// Number of uploads through `copy_pixels_to_texture`.
    pub fn num_naive_updates(&self) -> usize {
        self.num_naive_updates
    }

    /// Number of times the texture was requested for interop.
    pub fn num_interop_requests(&self) -> usize {
        self.num_interop_requests
    }

    /// Snapshot of all pixels, row-major.
    pub fn pixels(&self) -> Vec<Half4> {
        let storage = self.texture.storage.read();
        bytemuck::cast_slice::<u32, Half4>(&storage).to_vec()
    }

    /// One pixel.
    pub fn pixel(&self, x: usize, y: usize) -> Half4 {
        let storage = self.texture.storage.read();
        bytemuck::cast_slice::<u32, Half4>(&storage)[y * self.texture.width + x]
    }

    /// Convert the texture to a float image.
    pub fn to_image(&self) -> Result<Rgba32FImage> {
        let data: Vec<f32> = self.pixels().into_iter().flat_map(Half4::to_f32).collect();
        Rgba32FImage::from_raw(self.texture.width as u32, self.texture.height as u32, data)
            .ok_or_else(|| Error::buffer("display texture size does not match its dimensions"))
    }

    /// Save the texture; `.exr` and `.hdr` keep floats, other formats get sRGB 8-bit.
    pub fn save(&self, path: &Path) -> Result<()> {
        let image = self.to_image()?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "exr" => image.save(path)?,
            "hdr" => DynamicImage::ImageRgba32F(image).into_rgb32f().save(path)?,
            _ => {
                let mut encoded = image;
                for p in encoded.pixels_mut() {
                    for c in &mut p.0[..3] {
                        *c = linear_to_srgb(*c);
                    }
                }
                DynamicImage::ImageRgba32F(encoded).into_rgba8().save(path)?
            }
        }
        tracing::info!(path = %path.display(), "saved display image");
        Ok(())
    }
}

impl GpuDisplay for HostDisplay {
    fn graphics_interop_supported(&self) -> bool {
        self.interop_enabled
    }

    fn graphics_interop_get(&mut self) -> GraphicsInteropDestination {
        self.num_interop_requests += 1;
        GraphicsInteropDestination {
            width: self.texture.width,
            height: self.texture.height,
            texture: self.interop_enabled.then(|| self.texture.clone()),
        }
    }

    fn copy_pixels_to_texture(&mut self, pixels: &[Half4], width: usize, height: usize) -> Result<()> {
        if pixels.len() != width * height {
            return Err(Error::buffer(format!(
                "{} pixels uploaded for a {}x{} texture",
                pixels.len(),
                width,
                height
            )));
        }
        if width != self.texture.width || height != self.texture.height {
            self.texture = SharedTexture::new(width, height);
        }
        let mut storage = self.texture.storage.write();
        bytemuck::cast_slice_mut::<u32, Half4>(&mut storage).copy_from_slice(pixels);
        self.num_naive_updates += 1;
        Ok(())
    }
}

/// sRGB transfer function.
#[inline]
pub fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}
