//! Math type re-exports and small numeric helpers shared by the kernels.

pub use glam::{Vec2, Vec3};

/// Integer division rounding up.
#[inline]
pub const fn divide_up(x: usize, y: usize) -> usize {
    x.div_ceil(y)
}

/// Rec. 709 luminance of a linear RGB value.
#[inline]
pub fn luminance(c: Vec3) -> f32 {
    0.2126 * c.x + 0.7152 * c.y + 0.0722 * c.z
}

/// Jenkins-style integer hash used to seed per-path random streams.
#[inline]
pub fn hash_u32(mut a: u32) -> u32 {
    a = a.wrapping_add(0x7ed55d16).wrapping_add(a << 12);
    a = (a ^ 0xc761c23c) ^ (a >> 19);
    a = a.wrapping_add(0x165667b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2646c) ^ (a << 9);
    a = a.wrapping_add(0xfd7046c5).wrapping_add(a << 3);
    (a ^ 0xb55a4f09) ^ (a >> 16)
}

/// Combine two integers into one hash.
#[inline]
pub fn hash_combine(a: u32, b: u32) -> u32 {
    hash_u32(a ^ hash_u32(b).wrapping_add(0x9e3779b9))
}

/// Small PCG-style random stream stored in a single `u32` of path state.
#[derive(Debug, Clone, Copy)]
pub struct PathRng {
    state: u32,
}

impl PathRng {
    /// Resume a stream from its stored state.
    #[inline]
    pub fn new(state: u32) -> Self {
        Self { state }
    }

    /// Stored state, to be written back into the path slot.
    #[inline]
    pub fn state(&self) -> u32 {
        self.state
    }

    /// Uniform float in `[0, 1)`.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        self.state = self.state.wrapping_mul(747796405).wrapping_add(2891336453);
        let word = ((self.state >> ((self.state >> 28) + 4)) ^ self.state).wrapping_mul(277803737);
        let x = (word >> 22) ^ word;
        (x >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Two uniform floats.
    #[inline]
    pub fn next_2d(&mut self) -> Vec2 {
        Vec2::new(self.next_f32(), self.next_f32())
    }
}
