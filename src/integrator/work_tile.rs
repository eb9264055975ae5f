//! Work tiles: the producer side of the scheduler.
//!
//! [`WorkTileScheduler`] walks the pixel × sample domain of a render pass and
//! hands out [`KernelWorkTile`]s sized to fit the free path slots.

use std::collections::VecDeque;

use bytemuck::{Pod, Zeroable};

use crate::render::BufferParams;

/// A rectangle of pixels and a sample range to initialize camera paths for.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelWorkTile {
    /// Corner in full-frame pixel coordinates.
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub start_sample: u32,
    pub num_samples: u32,
    /// Render-buffer addressing, see [`BufferParams::get_offset_stride`].
    pub offset: i32,
    pub stride: i32,
}

impl KernelWorkTile {
    /// Number of paths this tile initializes.
    #[inline]
    pub fn work_size(&self) -> usize {
        self.w as usize * self.h as usize * self.num_samples as usize
    }

    /// Pixel and sample of a work item, samples varying fastest.
    #[inline]
    pub fn work_pixel(&self, global_work_index: usize) -> (i32, i32, u32) {
        let num_samples = self.num_samples as usize;
        let sample_offset = global_work_index % num_samples;
        let pixel_offset = global_work_index / num_samples;
        let y_offset = pixel_offset / self.w as usize;
        let x_offset = pixel_offset - y_offset * self.w as usize;
        (
            self.x + x_offset as i32,
            self.y + y_offset as i32,
            self.start_sample + sample_offset as u32,
        )
    }

    /// Render-buffer pixel index of a full-frame pixel.
    #[inline]
    pub fn buffer_pixel(&self, x: i32, y: i32) -> usize {
        (self.offset + x + y * self.stride) as usize
    }
}

/// Hands out work tiles for one render pass.
#[derive(Debug)]
pub struct WorkTileScheduler {
    max_num_path_states: usize,
    tile_size: usize,

    // Image region of the current pass
    full_x: i32,
    full_y: i32,
    width: usize,
    height: usize,
    offset: i32,
    stride: i32,

    start_sample: u32,
    samples_num: u32,

    // Tiling of the current pass
    tile_w: usize,
    tile_h: usize,
    num_samples_per_tile: u32,
    num_tiles_x: usize,
    num_tiles_y: usize,
    total_work: usize,
    next_work_index: usize,

    // Remainders of split tiles, served before new work
    pending: VecDeque<KernelWorkTile>,
}

impl WorkTileScheduler {
    /// Default tile edge in pixels.
    pub const DEFAULT_TILE_SIZE: usize = 64;

    /// Create a scheduler with nothing to hand out.
    pub fn new() -> Self {
        Self {
            max_num_path_states: 1,
            tile_size: Self::DEFAULT_TILE_SIZE,
            full_x: 0,
            full_y: 0,
            width: 0,
            height: 0,
            offset: 0,
            stride: 0,
            start_sample: 0,
            samples_num: 0,
            tile_w: 0,
            tile_h: 0,
            num_samples_per_tile: 0,
            num_tiles_x: 0,
            num_tiles_y: 0,
            total_work: 0,
            next_work_index: 0,
            pending: VecDeque::new(),
        }
    }

    /// Set the pool capacity tiles are sized against.
    pub fn set_max_num_path_states(&mut self, max_num_path_states: usize) {
        self.max_num_path_states = max_num_path_states.max(1);
    }

    /// Set the preferred tile edge in pixels.
    pub fn set_tile_size(&mut self, tile_size: usize) {
        self.tile_size = tile_size.max(1);
    }

    /// Start a new pass over `buffer_params` for samples
    /// `[start_sample, start_sample + samples_num)`.
    pub fn reset(&mut self, buffer_params: &BufferParams, start_sample: u32, samples_num: u32) {
        let (offset, stride) = buffer_params.get_offset_stride();
        self.full_x = buffer_params.full_x;
        self.full_y = buffer_params.full_y;
        self.width = buffer_params.width;
        self.height = buffer_params.height;
        self.offset = offset;
        self.stride = stride;
        self.start_sample = start_sample;
        self.samples_num = samples_num;
        self.pending.clear();
        self.next_work_index = 0;

        if self.width == 0 || self.height == 0 || samples_num == 0 {
            self.total_work = 0;
            return;
        }

        let mut tile_w = self.tile_size.min(self.width);
        let mut tile_h = self.tile_size.min(self.height);
        while tile_w * tile_h > self.max_num_path_states && (tile_w > 1 || tile_h > 1) {
            if tile_w >= tile_h {
                tile_w = tile_w.div_ceil(2);
            } else {
                tile_h = tile_h.div_ceil(2);
            }
        }
        let per_tile = (self.max_num_path_states / (tile_w * tile_h)).max(1);

        self.tile_w = tile_w;
        self.tile_h = tile_h;
        self.num_samples_per_tile = per_tile.min(samples_num as usize) as u32;
        self.num_tiles_x = self.width.div_ceil(tile_w);
        self.num_tiles_y = self.height.div_ceil(tile_h);
        let num_sample_ranges = samples_num.div_ceil(self.num_samples_per_tile) as usize;
        self.total_work = self.num_tiles_x * self.num_tiles_y * num_sample_ranges;

        tracing::trace!(
            tile_w,
            tile_h,
            samples_per_tile = self.num_samples_per_tile,
            total_work = self.total_work,
            "work tile scheduler reset"
        );
    }

    /// Whether every (pixel, sample) of the pass has been handed out.
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.next_work_index >= self.total_work
    }

    /// Next tile initializing at most `max_work_size` paths.
    ///
    /// Returns `None` when the pass is exhausted or `max_work_size` is zero.
    pub fn get_work(&mut self, max_work_size: usize) -> Option<KernelWorkTile> {
        if max_work_size == 0 {
            return None;
        }
        let tile = match self.pending.pop_front() {
            Some(tile) => tile,
            None => self.next_tile()?,
        };
        Some(self.fit(tile, max_work_size))
    }

    /// Tile for the next work index, samples ranges outermost.
    fn next_tile(&mut self) -> Option<KernelWorkTile> {
        if self.next_work_index >= self.total_work {
            return None;
        }
        let work_index = self.next_work_index;
        self.next_work_index += 1;

        let num_tiles = self.num_tiles_x * self.num_tiles_y;
        let sample_range = work_index / num_tiles;
        let tile_index = work_index % num_tiles;
        let tile_x = tile_index % self.num_tiles_x;
        let tile_y = tile_index / self.num_tiles_x;

        let x = tile_x * self.tile_w;
        let y = tile_y * self.tile_h;
        let start = sample_range as u32 * self.num_samples_per_tile;

        Some(KernelWorkTile {
            x: self.full_x + x as i32,
            y: self.full_y + y as i32,
            w: self.tile_w.min(self.width - x) as u32,
            h: self.tile_h.min(self.height - y) as u32,
            start_sample: self.start_sample + start,
            num_samples: self.num_samples_per_tile.min(self.samples_num - start),
            offset: self.offset,
            stride: self.stride,
        })
    }

    /// Shrink `tile` to at most `max_work_size` paths, queueing the rest.
    fn fit(&mut self, tile: KernelWorkTile, max_work_size: usize) -> KernelWorkTile {
        if tile.work_size() <= max_work_size {
            return tile;
        }

        let area = tile.w as usize * tile.h as usize;
        let mut rest: Vec<KernelWorkTile> = Vec::with_capacity(3);
        let first;

        if area <= max_work_size {
            // Fewer samples over the whole rectangle
            let n = (max_work_size / area) as u32;
            first = KernelWorkTile { num_samples: n, ..tile };
            rest.push(KernelWorkTile {
                start_sample: tile.start_sample + n,
                num_samples: tile.num_samples - n,
                ..tile
            });
        } else {
            // One sample over a band of rows, or part of a single row
            let rows = max_work_size / tile.w as usize;
            if rows >= 1 {
                let rows = rows as u32;
                first = KernelWorkTile { h: rows, num_samples: 1, ..tile };
                rest.push(KernelWorkTile {
                    y: tile.y + rows as i32,
                    h: tile.h - rows,
                    num_samples: 1,
                    ..tile
                });
            } else {
                let cols = max_work_size as u32;
                first = KernelWorkTile { w: cols, h: 1, num_samples: 1, ..tile };
                rest.push(KernelWorkTile {
                    x: tile.x + cols as i32,
                    w: tile.w - cols,
                    h: 1,
                    num_samples: 1,
                    ..tile
                });
                if tile.h > 1 {
                    rest.push(KernelWorkTile {
                        y: tile.y + 1,
                        h: tile.h - 1,
                        num_samples: 1,
                        ..tile
                    });
                }
            }
            if tile.num_samples > 1 {
                rest.push(KernelWorkTile {
                    start_sample: tile.start_sample + 1,
                    num_samples: tile.num_samples - 1,
                    ..tile
                });
            }
        }

        for remainder in rest.into_iter().rev() {
            if remainder.work_size() > 0 {
                self.pending.push_front(remainder);
            }
        }
        first
    }
}

impl Default for WorkTileScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn drain(scheduler: &mut WorkTileScheduler, max: impl Fn(usize) -> usize) -> Vec<KernelWorkTile> {
        let mut tiles = Vec::new();
        let mut i = 0;
        while let Some(tile) = scheduler.get_work(max(i)) {
            assert!(tile.work_size() > 0, "zero sized tile {:?}", tile);
            assert!(tile.work_size() <= max(i), "tile {:?} exceeds {}", tile, max(i));
            tiles.push(tile);
            i += 1;
        }
        tiles
    }

    fn coverage(tiles: &[KernelWorkTile]) -> HashMap<(i32, i32, u32), usize> {
        let mut seen = HashMap::new();
        for tile in tiles {
            for i in 0..tile.work_size() {
                *seen.entry(tile.work_pixel(i)).or_insert(0) += 1;
            }
        }
        seen
    }

    #[test]
    fn test_work_pixel_order() {
        let tile = KernelWorkTile { x: 10, y: 20, w: 2, h: 2, start_sample: 4, num_samples: 3, offset: 0, stride: 2 };
        assert_eq!(tile.work_size(), 12);
        assert_eq!(tile.work_pixel(0), (10, 20, 4));
        assert_eq!(tile.work_pixel(2), (10, 20, 6));
        assert_eq!(tile.work_pixel(3), (11, 20, 4));
        assert_eq!(tile.work_pixel(11), (11, 21, 6));
    }

    #[test]
    fn test_full_coverage() {
        let params = BufferParams::new(37, 23);
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(512);
        scheduler.set_tile_size(16);
        scheduler.reset(&params, 3, 5);

        let tiles = drain(&mut scheduler, |_| 512);
        let seen = coverage(&tiles);
        assert_eq!(seen.len(), 37 * 23 * 5);
        assert!(seen.values().all(|&n| n == 1));
        assert!(seen.keys().all(|&(_, _, s)| (3..8).contains(&s)));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn test_split_to_fit_capacity() {
        let params = BufferParams::new(20, 10);
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(1000);
        scheduler.reset(&params, 0, 4);

        // Remaining capacity varies a lot, including sizes below one row
        let limits = [7usize, 1, 33, 250, 3, 999, 19, 2];
        let tiles = drain(&mut scheduler, |i| limits[i % limits.len()]);
        let seen = coverage(&tiles);
        assert_eq!(seen.len(), 20 * 10 * 4);
        assert!(seen.values().all(|&n| n == 1));
    }

    #[test]
    fn test_zero_capacity() {
        let params = BufferParams::new(4, 4);
        let mut scheduler = WorkTileScheduler::new();
        scheduler.reset(&params, 0, 1);
        assert!(scheduler.get_work(0).is_none());
        assert!(!scheduler.is_finished());
        assert!(scheduler.get_work(16).is_some());
    }

    #[test]
    fn test_tile_smaller_than_capacity() {
        let params = BufferParams::new(64, 64);
        let mut scheduler = WorkTileScheduler::new();
        scheduler.set_max_num_path_states(100);
        scheduler.set_tile_size(64);
        scheduler.reset(&params, 0, 2);

        let tile = scheduler.get_work(100).unwrap();
        assert!(tile.w as usize * tile.h as usize <= 100);
    }

    #[test]
    fn test_offset_region() {
        let mut params = BufferParams::new(8, 8);
        params.full_x = 100;
        params.full_y = 50;
        let mut scheduler = WorkTileScheduler::new();
        scheduler.reset(&params, 0, 1);

        let tile = scheduler.get_work(1 << 20).unwrap();
        assert_eq!((tile.x, tile.y), (100, 50));
        assert_eq!(tile.buffer_pixel(100, 50), 0);
        assert_eq!(tile.buffer_pixel(107, 57), 63);
    }
}
