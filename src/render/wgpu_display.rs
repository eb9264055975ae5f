//! Display writing into a wgpu texture.

use super::display::{GpuDisplay, Half4};
use crate::device::GraphicsInteropDestination;
use crate::util::{Error, Result};

/// Display backed by an `Rgba16Float` wgpu texture.
///
/// Compute devices cannot map wgpu memory, so the display reports interop as
/// unsupported and every update goes through `copy_pixels_to_texture` and
/// `Queue::write_texture`.
pub struct WgpuDisplay {
    device: wgpu::Device,
    queue: wgpu::Queue,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl WgpuDisplay {
    /// Create the display texture.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, width: u32, height: u32) -> Self {
        let (texture, view) = create_texture(&device, width, height);
        Self { device, queue, texture, view, width, height }
    }

    /// Texture holding the last uploaded image.
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// View of the display texture, for sampling in a presentation pass.
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// Current texture size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

fn create_texture(device: &wgpu::Device, width: u32, height: u32) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("wavefront_display"),
        size: wgpu::Extent3d { width: width.max(1), height: height.max(1), depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba16Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

impl GpuDisplay for WgpuDisplay {
    fn graphics_interop_supported(&self) -> bool {
        false
    }

    fn graphics_interop_get(&mut self) -> GraphicsInteropDestination {
        GraphicsInteropDestination {
            width: self.width as usize,
            height: self.height as usize,
            texture: None,
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
        let (w, h) = (
            u32::try_from(width).map_err(|_| Error::buffer("display width exceeds u32"))?,
            u32::try_from(height).map_err(|_| Error::buffer("display height exceeds u32"))?,
        );
        if w == 0 || h == 0 {
            return Ok(());
        }

        if (w, h) != (self.width, self.height) {
            let (texture, view) = create_texture(&self.device, w, h);
            self.texture = texture;
            self.view = view;
            self.width = w;
            self.height = h;
            tracing::debug!("Recreated display texture at {}x{}", w, h);
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(pixels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(w * std::mem::size_of::<Half4>() as u32),
                rows_per_image: Some(h),
            },
            wgpu::Extent3d { width: w, height: h, depth_or_array_layers: 1 },
        );
        Ok(())
    }
}
