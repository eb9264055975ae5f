//! Analytic scene evaluated by the CPU kernels.
//!
//! A handful of spheres over a ground plane, lit by a gradient sky and a
//! directional sun. Object ids index `spheres`; the ground plane takes the id
//! right after the last sphere.

use std::f32::consts::{FRAC_1_PI, PI};

use crate::util::{Vec2, Vec3};

/// Object id stored for rays that hit nothing.
pub const OBJECT_NONE: u32 = u32::MAX;

/// Offset applied to ray origins leaving a surface.
pub const RAY_EPSILON: f32 = 1e-3;

/// Surface or medium response of an object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Material {
    Diffuse { albedo: Vec3 },
    Emissive { emission: Vec3 },
    /// Diffuse surface whose light exits elsewhere on the object.
    Subsurface { albedo: Vec3 },
    /// Homogeneous scattering medium bounded by the object.
    Volume { albedo: Vec3, density: f32 },
}

impl Material {
    /// Reflectance used when shading the material as a surface.
    #[inline]
    pub fn albedo(&self) -> Vec3 {
        match *self {
            Self::Diffuse { albedo } | Self::Subsurface { albedo } | Self::Volume { albedo, .. } => albedo,
            Self::Emissive { .. } => Vec3::ZERO,
        }
    }
}

/// Sphere primitive.
#[derive(Clone, Copy, Debug)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
    pub material: Material,
}

impl Sphere {
    /// Both ray parameters where the ray crosses the sphere.
    #[inline]
    fn crossings(&self, origin: Vec3, dir: Vec3) -> Option<(f32, f32)> {
        let oc = origin - self.center;
        let b = oc.dot(dir);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let s = disc.sqrt();
        Some((-b - s, -b + s))
    }

    #[inline]
    fn contains(&self, p: Vec3) -> bool {
        (p - self.center).length_squared() < self.radius * self.radius
    }
}

/// Pinhole camera mapping full-frame pixel coordinates to rays.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub position: Vec3,
    forward: Vec3,
    right: Vec3,
    up: Vec3,
    tan_half_fov: f32,
    pub width: usize,
    pub height: usize,
}

impl Camera {
    /// Camera at `position` looking at `target` with a vertical field of view in degrees.
    pub fn look_at(position: Vec3, target: Vec3, fov_y_degrees: f32, width: usize, height: usize) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(Vec3::Y).normalize();
        let up = right.cross(forward);
        Self {
            position,
            forward,
            right,
            up,
            tan_half_fov: (fov_y_degrees.to_radians() * 0.5).tan(),
            width,
            height,
        }
    }

    /// Primary ray through a (possibly fractional) pixel position; `y` grows downwards.
    pub fn generate_ray(&self, x: f32, y: f32) -> (Vec3, Vec3) {
        let w = self.width.max(1) as f32;
        let h = self.height.max(1) as f32;
        let aspect = w / h;
        let ndc_x = (2.0 * x / w - 1.0) * aspect * self.tan_half_fov;
        let ndc_y = (1.0 - 2.0 * y / h) * self.tan_half_fov;
        let dir = (self.forward + self.right * ndc_x + self.up * ndc_y).normalize();
        (self.position, dir)
    }
}

/// Closest intersection along a ray.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub t: f32,
    pub object: u32,
}

/// Scene consumed by the integrator kernels.
#[derive(Clone, Debug)]
pub struct Scene {
    pub camera: Camera,
    pub spheres: Vec<Sphere>,
    /// Material of the `y = 0` plane, if present.
    pub ground: Option<Material>,
    pub sky_horizon: Vec3,
    pub sky_zenith: Vec3,
    /// Direction towards the sun.
    pub sun_direction: Vec3,
    pub sun_radiance: Vec3,
    pub max_bounce: u32,
}

impl Scene {
    /// The default scene, framed for a `width` × `height` image.
    pub fn demo(width: usize, height: usize) -> Self {
        let camera = Camera::look_at(Vec3::new(0.0, 1.2, 5.0), Vec3::new(0.0, 0.7, 0.0), 40.0, width, height);
        Self {
            camera,
            spheres: vec![
                Sphere {
                    center: Vec3::new(-1.2, 0.6, 0.0),
                    radius: 0.6,
                    material: Material::Diffuse { albedo: Vec3::new(0.8, 0.3, 0.25) },
                },
                Sphere {
                    center: Vec3::new(0.0, 0.7, -0.6),
                    radius: 0.7,
                    material: Material::Subsurface { albedo: Vec3::new(0.9, 0.85, 0.7) },
                },
                Sphere {
                    center: Vec3::new(1.25, 0.55, 0.2),
                    radius: 0.55,
                    material: Material::Volume { albedo: Vec3::new(0.6, 0.7, 0.9), density: 1.5 },
                },
                Sphere {
                    center: Vec3::new(0.4, 2.2, -1.5),
                    radius: 0.3,
                    material: Material::Emissive { emission: Vec3::new(6.0, 5.0, 3.5) },
                },
            ],
            ground: Some(Material::Diffuse { albedo: Vec3::splat(0.5) }),
            sky_horizon: Vec3::new(0.9, 0.9, 0.95),
            sky_zenith: Vec3::new(0.35, 0.5, 0.85),
            sun_direction: Vec3::new(0.4, 0.8, 0.45).normalize(),
            sun_radiance: Vec3::new(2.5, 2.4, 2.2),
            max_bounce: 6,
        }
    }

    /// Object id of the ground plane.
    #[inline]
    pub fn ground_object(&self) -> u32 {
        self.spheres.len() as u32
    }

    /// Material of an object id.
    pub fn material(&self, object: u32) -> Option<Material> {
        if object == self.ground_object() {
            self.ground
        } else {
            self.spheres.get(object as usize).map(|s| s.material)
        }
    }

    /// Closest hit in `(RAY_EPSILON, t_max)`.
    pub fn intersect(&self, origin: Vec3, dir: Vec3, t_max: f32) -> Option<Hit> {
        let mut best: Option<Hit> = None;
        let mut closest = t_max;

        for (i, sphere) in self.spheres.iter().enumerate() {
            if let Some((t0, t1)) = sphere.crossings(origin, dir) {
                let t = if t0 > RAY_EPSILON { t0 } else { t1 };
                if t > RAY_EPSILON && t < closest {
                    closest = t;
                    best = Some(Hit { t, object: i as u32 });
                }
            }
        }

        if self.ground.is_some() && dir.y.abs() > 1e-6 {
            let t = -origin.y / dir.y;
            if t > RAY_EPSILON && t < closest {
                best = Some(Hit { t, object: self.ground_object() });
            }
        }
        best
    }

    /// Distance from `origin` to where the ray leaves sphere `object`.
    pub fn exit_distance(&self, object: u32, origin: Vec3, dir: Vec3) -> Option<f32> {
        let sphere = self.spheres.get(object as usize)?;
        let (_, t1) = sphere.crossings(origin, dir)?;
        (t1 > 0.0).then_some(t1)
    }

    /// Whether `p` lies inside sphere `object`.
    pub fn contains(&self, object: u32, p: Vec3) -> bool {
        self.spheres.get(object as usize).is_some_and(|s| s.contains(p))
    }

    /// Outward geometric normal at a point on `object`.
    pub fn normal(&self, object: u32, p: Vec3) -> Vec3 {
        match self.spheres.get(object as usize) {
            Some(sphere) => (p - sphere.center).normalize_or(Vec3::Y),
            None => Vec3::Y,
        }
    }

    /// Fraction of light passing along a shadow segment.
    ///
    /// Opaque objects block completely; volumes attenuate with Beer's law.
    pub fn transmittance(&self, origin: Vec3, dir: Vec3, t_max: f32) -> f32 {
        let mut optical_depth = 0.0;
        for sphere in &self.spheres {
            let Some((t0, t1)) = sphere.crossings(origin, dir) else {
                continue;
            };
            match sphere.material {
                Material::Volume { density, .. } => {
                    let start = t0.max(0.0);
                    let end = t1.min(t_max);
                    if end > start {
                        optical_depth += density * (end - start);
                    }
                }
                _ => {
                    let t = if t0 > RAY_EPSILON { t0 } else { t1 };
                    if t > RAY_EPSILON && t < t_max {
                        return 0.0;
                    }
                }
            }
        }
        if self.ground.is_some() && dir.y < -1e-6 {
            let t = -origin.y / dir.y;
            if t > RAY_EPSILON && t < t_max {
                return 0.0;
            }
        }
        (-optical_depth).exp()
    }

    /// Sky radiance in a direction.
    pub fn sky(&self, dir: Vec3) -> Vec3 {
        let k = dir.y.clamp(0.0, 1.0);
        self.sky_horizon.lerp(self.sky_zenith, k)
    }
}

/// Cosine-weighted direction around `n`.
pub fn sample_cosine_hemisphere(n: Vec3, u: Vec2) -> Vec3 {
    let r = u.x.sqrt();
    let phi = 2.0 * PI * u.y;
    let (t, b) = n.any_orthonormal_pair();
    let z = (1.0 - u.x).max(0.0).sqrt();
    (t * (r * phi.cos()) + b * (r * phi.sin()) + n * z).normalize()
}

/// Uniform direction on the unit sphere.
pub fn sample_uniform_sphere(u: Vec2) -> Vec3 {
    let z = 1.0 - 2.0 * u.x;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * PI * u.y;
    Vec3::new(r * phi.cos(), r * phi.sin(), z)
}

/// Lambertian BRDF normalization.
pub const DIFFUSE_BRDF: f32 = FRAC_1_PI;

/// Isotropic phase function value.
pub const ISOTROPIC_PHASE: f32 = 0.25 * FRAC_1_PI;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_sphere_and_ground() {
        let scene = Scene::demo(16, 16);
        let hit = scene.intersect(Vec3::new(-1.2, 0.6, 5.0), Vec3::NEG_Z, f32::MAX).unwrap();
        assert_eq!(hit.object, 0);
        assert!((hit.t - 4.4).abs() < 1e-4);

        let hit = scene.intersect(Vec3::new(5.0, 1.0, 5.0), Vec3::NEG_Y, f32::MAX).unwrap();
        assert_eq!(hit.object, scene.ground_object());
        assert!((hit.t - 1.0).abs() < 1e-5);

        assert!(scene.intersect(Vec3::new(0.0, 1.0, 5.0), Vec3::Y, f32::MAX).is_none());
    }

    #[test]
    fn test_transmittance() {
        let scene = Scene::demo(16, 16);
        // Straight up from far away sees only sky.
        assert_eq!(scene.transmittance(Vec3::new(5.0, 0.1, 5.0), Vec3::Y, f32::MAX), 1.0);
        // Through the opaque diffuse sphere.
        assert_eq!(scene.transmittance(Vec3::new(-1.2, 0.6, 5.0), Vec3::NEG_Z, f32::MAX), 0.0);
        // Through the volume: attenuated but not blocked.
        let t = scene.transmittance(Vec3::new(1.25, 0.55, 5.0), Vec3::NEG_Z, 10.0);
        assert!(t > 0.0 && t < 1.0);
    }

    #[test]
    fn test_camera_center_ray() {
        let camera = Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, 60.0, 100, 50);
        let (_, dir) = camera.generate_ray(50.0, 25.0);
        assert!((dir - Vec3::NEG_Z).length() < 1e-5);
    }

    #[test]
    fn test_cosine_sample_in_hemisphere() {
        let n = Vec3::new(0.0, 0.0, 1.0);
        for i in 0..16 {
            let u = Vec2::new(i as f32 / 16.0, (i * 7 % 16) as f32 / 16.0);
            assert!(sample_cosine_hemisphere(n, u).dot(n) >= -1e-5);
        }
    }
}
