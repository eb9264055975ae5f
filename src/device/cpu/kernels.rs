//! Kernel bodies of the CPU device.
//!
//! Integrator kernels run in three phases: path state is gathered from the
//! state arrays, every path is stepped in parallel on the rayon pool, then
//! the results and their queue counter transitions are scattered back
//! serially in slot order.
//!
//! Each slot carries at most one shadow ray. Shading kernels that emit one
//! park the path at `IntersectShadow` and remember where to resume in
//! `PathContinuation`; touching the shadow ray of a slot in the wrong state
//! fails the launch.

use parking_lot::RwLockWriteGuard;
use rayon::prelude::*;

use super::scene::{
    sample_cosine_hemisphere, sample_uniform_sphere, Material, Scene, DIFFUSE_BRDF, ISOTROPIC_PHASE, OBJECT_NONE,
    RAY_EPSILON,
};
use super::{CpuShared, Storage};
use crate::device::{BufferId, DeviceKernel, DeviceSlice, KernelArgs, PassRegion, NUM_INTEGRATOR_PHASES};
use crate::integrator::state::{
    decode_queued, encode_queued, StateField, INTEGRATOR_QUEUE_CONST, INTEGRATOR_STATE_CONST, QUEUED_NONE,
};
use crate::integrator::KernelWorkTile;
use crate::render::{
    Half4, PASS_ADAPTIVE_CONVERGED, PASS_COMBINED, PASS_COMBINED_SQUARED, PASS_SAMPLE_COUNT, PASS_STRIDE,
};
use crate::util::{hash_combine, hash_u32, luminance, Error, PathRng, Result, Vec3};

/// Upper bound on phase steps a single megakernel path may take.
const MAX_MEGAKERNEL_STEPS: usize = 4096;

/// Bounce after which Russian roulette may end a path.
const RUSSIAN_ROULETTE_BOUNCE: u32 = 3;

const TILE_WORDS: usize = std::mem::size_of::<KernelWorkTile>() / 4;

/// Execute one recorded launch.
pub(super) fn launch(shared: &CpuShared, kernel: DeviceKernel, args: &KernelArgs) -> Result<()> {
    if !args.matches(kernel) {
        return Err(Error::buffer(format!("{kernel} launched with mismatching arguments {args:?}")));
    }

    match *args {
        KernelArgs::Intersect { path_index, work_size } => run_integrator(shared, kernel, path_index, None, work_size),
        KernelArgs::Shade { path_index, render_buffer, work_size } => {
            run_integrator(shared, kernel, path_index, Some(render_buffer), work_size)
        }
        KernelArgs::InitFromCamera { path_index, work_tile, render_buffer, work_size, path_index_offset } => {
            init_from_camera(shared, path_index, work_tile, render_buffer, work_size, path_index_offset)
        }
        KernelArgs::Compact { work_size, queued_paths, num_queued_paths, queued_kernel } => {
            compact(shared, kernel, work_size, queued_paths, num_queued_paths, queued_kernel)
        }
        KernelArgs::FilmConvert { rgba_half, render_buffer, sample_scale, per_pixel_sample_count, region } => {
            film_convert(shared, rgba_half, render_buffer, sample_scale, per_pixel_sample_count, region)
        }
        KernelArgs::AdaptiveCheck { render_buffer, region, sample, min_samples, threshold, num_active_pixels } => {
            adaptive_check(shared, render_buffer, region, sample, min_samples, threshold, num_active_pixels)
        }
        KernelArgs::AdaptiveFilter { render_buffer, region } => {
            adaptive_filter(shared, kernel == DeviceKernel::AdaptiveSamplingFilterX, render_buffer, region)
        }
    }
}

// ============================================================================
// Path state access
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
struct PathState {
    render_pixel_index: u32,
    sample: u32,
    bounce: u32,
    rng_state: u32,
    queued_kernel: u32,
    continuation: u32,
    ray_p: Vec3,
    ray_d: Vec3,
    isect_t: f32,
    isect_object: u32,
    throughput: Vec3,
    radiance: Vec3,
    shadow_p: Vec3,
    shadow_d: Vec3,
    shadow_t: f32,
    shadow_throughput: Vec3,
    shadow_occupied: u32,
}

/// Write access to every state array for the duration of a launch.
struct StateView<'a> {
    fields: Vec<RwLockWriteGuard<'a, Vec<u32>>>,
}

impl<'a> StateView<'a> {
    fn lock(arrays: &'a [Storage]) -> Result<Self> {
        if arrays.len() != StateField::COUNT {
            return Err(Error::buffer(format!(
                "integrator state lists {} arrays, expected {}",
                arrays.len(),
                StateField::COUNT
            )));
        }
        Ok(Self { fields: arrays.iter().map(|a| a.write()).collect() })
    }

    fn capacity(&self) -> usize {
        self.fields[StateField::PathQueuedKernel.index()].len()
    }

    #[inline]
    fn u32(&self, field: StateField, slot: usize) -> u32 {
        self.fields[field.index()][slot]
    }

    #[inline]
    fn f32(&self, field: StateField, slot: usize) -> f32 {
        f32::from_bits(self.u32(field, slot))
    }

    #[inline]
    fn vec3(&self, field: StateField, slot: usize) -> Vec3 {
        let a = &self.fields[field.index()];
        Vec3::new(
            f32::from_bits(a[slot * 3]),
            f32::from_bits(a[slot * 3 + 1]),
            f32::from_bits(a[slot * 3 + 2]),
        )
    }

    #[inline]
    fn set_u32(&mut self, field: StateField, slot: usize, value: u32) {
        self.fields[field.index()][slot] = value;
    }

    #[inline]
    fn set_vec3(&mut self, field: StateField, slot: usize, v: Vec3) {
        let a = &mut self.fields[field.index()];
        a[slot * 3] = v.x.to_bits();
        a[slot * 3 + 1] = v.y.to_bits();
        a[slot * 3 + 2] = v.z.to_bits();
    }

    fn read(&self, slot: usize) -> PathState {
        use StateField as F;
        PathState {
            render_pixel_index: self.u32(F::PathRenderPixelIndex, slot),
            sample: self.u32(F::PathSample, slot),
            bounce: self.u32(F::PathBounce, slot),
            rng_state: self.u32(F::PathRngState, slot),
            queued_kernel: self.u32(F::PathQueuedKernel, slot),
            continuation: self.u32(F::PathContinuation, slot),
            ray_p: self.vec3(F::RayP, slot),
            ray_d: self.vec3(F::RayD, slot),
            isect_t: self.f32(F::IsectT, slot),
            isect_object: self.u32(F::IsectObject, slot),
            throughput: self.vec3(F::PathThroughput, slot),
            radiance: self.vec3(F::PathRadiance, slot),
            shadow_p: self.vec3(F::ShadowRayP, slot),
            shadow_d: self.vec3(F::ShadowRayD, slot),
            shadow_t: self.f32(F::ShadowRayT, slot),
            shadow_throughput: self.vec3(F::ShadowThroughput, slot),
            shadow_occupied: self.u32(F::ShadowOccupied, slot),
        }
    }

    fn write(&mut self, slot: usize, st: &PathState) {
        use StateField as F;
        self.set_u32(F::PathRenderPixelIndex, slot, st.render_pixel_index);
        self.set_u32(F::PathSample, slot, st.sample);
        self.set_u32(F::PathBounce, slot, st.bounce);
        self.set_u32(F::PathRngState, slot, st.rng_state);
        self.set_u32(F::PathQueuedKernel, slot, st.queued_kernel);
        self.set_u32(F::PathContinuation, slot, st.continuation);
        self.set_vec3(F::RayP, slot, st.ray_p);
        self.set_vec3(F::RayD, slot, st.ray_d);
        self.set_u32(F::IsectT, slot, st.isect_t.to_bits());
        self.set_u32(F::IsectObject, slot, st.isect_object);
        self.set_vec3(F::PathThroughput, slot, st.throughput);
        self.set_vec3(F::PathRadiance, slot, st.radiance);
        self.set_vec3(F::ShadowRayP, slot, st.shadow_p);
        self.set_vec3(F::ShadowRayD, slot, st.shadow_d);
        self.set_u32(F::ShadowRayT, slot, st.shadow_t.to_bits());
        self.set_vec3(F::ShadowThroughput, slot, st.shadow_throughput);
        self.set_u32(F::ShadowOccupied, slot, st.shadow_occupied);
    }
}

fn state_arrays(shared: &CpuShared) -> Result<Vec<Storage>> {
    shared
        .constant(INTEGRATOR_STATE_CONST)?
        .into_iter()
        .map(|buffer| shared.storage(buffer))
        .collect()
}

fn queue_counter(shared: &CpuShared) -> Result<Storage> {
    let buffer = shared
        .constant(INTEGRATOR_QUEUE_CONST)?
        .first()
        .copied()
        .ok_or_else(|| Error::buffer("queue counter constant is empty"))?;
    let storage = shared.storage(buffer)?;
    if storage.read().len() < NUM_INTEGRATOR_PHASES {
        return Err(Error::buffer("queue counter buffer is too small"));
    }
    Ok(storage)
}

fn resolve_slots(
    shared: &CpuShared,
    path_index: Option<DeviceSlice>,
    work_size: usize,
    path_index_offset: usize,
) -> Result<Vec<usize>> {
    match path_index {
        None => Ok((path_index_offset..path_index_offset + work_size).collect()),
        Some(slice) => {
            let storage = shared.storage(slice.buffer)?;
            let indices = storage.read();
            let range = indices.get(slice.offset..slice.offset + work_size).ok_or_else(|| {
                Error::buffer(format!(
                    "path index list of {} entries cannot supply {} items at offset {}",
                    indices.len(),
                    work_size,
                    slice.offset
                ))
            })?;
            Ok(range.iter().map(|&slot| slot as usize).collect())
        }
    }
}

#[inline]
fn add_pass(film: &mut [u32], index: usize, value: f32) {
    film[index] = (f32::from_bits(film[index]) + value).to_bits();
}

fn pixel_passes(film: &[u32], pixel: usize) -> Result<&[u32]> {
    let base = pixel * PASS_STRIDE;
    film.get(base..base + PASS_STRIDE)
        .ok_or_else(|| Error::buffer(format!("pixel {pixel} is outside of the render buffer")))
}

fn write_radiance(film: &mut [u32], pixel: usize, radiance: Vec3) -> Result<()> {
    pixel_passes(film, pixel)?;
    let l = if radiance.is_finite() { radiance.max(Vec3::ZERO) } else { Vec3::ZERO };
    let base = pixel * PASS_STRIDE;
    for c in 0..3 {
        add_pass(film, base + PASS_COMBINED + c, l[c]);
        add_pass(film, base + PASS_COMBINED_SQUARED + c, l[c] * l[c]);
    }
    Ok(())
}

// ============================================================================
// Integrator phases
// ============================================================================

fn run_integrator(
    shared: &CpuShared,
    kernel: DeviceKernel,
    path_index: Option<DeviceSlice>,
    render_buffer: Option<BufferId>,
    work_size: usize,
) -> Result<()> {
    let scene = shared.scene();
    let arrays = state_arrays(shared)?;
    let counter_storage = queue_counter(shared)?;
    let film_storage = render_buffer.map(|b| shared.storage(b)).transpose()?;
    let slots = resolve_slots(shared, path_index, work_size, 0)?;

    let queue_kernel = if kernel == DeviceKernel::Megakernel {
        DeviceKernel::IntersectClosest
    } else {
        kernel
    };
    let expected = encode_queued(Some(queue_kernel));

    let mut state = StateView::lock(&arrays)?;
    let capacity = state.capacity();

    // Gather
    let mut gathered = Vec::with_capacity(slots.len());
    for slot in slots {
        if slot >= capacity {
            return Err(Error::buffer(format!("path index {slot} outside of state capacity {capacity}")));
        }
        let queued = state.u32(StateField::PathQueuedKernel, slot);
        if queued != expected {
            if path_index.is_some() {
                return Err(Error::consistency(format!(
                    "slot {slot} dispatched to {kernel} while queued for {:?}",
                    decode_queued(queued)
                )));
            }
            continue;
        }
        gathered.push((slot, state.read(slot)));
    }

    // Step
    let scene: &Scene = &scene;
    let stepped = gathered
        .into_par_iter()
        .map(|(slot, mut st)| -> Result<_> {
            let next = if kernel == DeviceKernel::Megakernel {
                run_megakernel(scene, slot, &mut st)?
            } else {
                step(kernel, scene, slot, &mut st)?
            };
            Ok((slot, st, next))
        })
        .collect::<Result<Vec<_>>>()?;

    // Scatter
    let mut counter = counter_storage.write();
    let mut film = film_storage.as_ref().map(|f| f.write());
    for (slot, mut st, next) in stepped {
        let from = &mut counter[queue_kernel.index()];
        *from = from
            .checked_sub(1)
            .ok_or_else(|| Error::consistency(format!("queue counter of {queue_kernel} underflowed")))?;

        match next {
            Some(next) => {
                counter[next.index()] += 1;
                st.queued_kernel = encode_queued(Some(next));
            }
            None => {
                let film = film.as_deref_mut().ok_or_else(|| {
                    Error::consistency(format!("{kernel} terminated slot {slot} without a render buffer"))
                })?;
                write_radiance(film, st.render_pixel_index as usize, st.radiance)?;
                st = PathState::default();
            }
        }
        state.write(slot, &st);
    }
    Ok(())
}

/// Advance a path through one phase. `None` terminates it.
fn step(kernel: DeviceKernel, scene: &Scene, slot: usize, st: &mut PathState) -> Result<Option<DeviceKernel>> {
    use DeviceKernel as K;
    match kernel {
        K::IntersectClosest => Ok(Some(intersect_closest(scene, st))),
        K::IntersectShadow => intersect_shadow(scene, slot, st),
        K::IntersectSubsurface => Ok(Some(intersect_subsurface(scene, st))),
        K::ShadeBackground => {
            st.radiance += st.throughput * scene.sky(st.ray_d);
            Ok(None)
        }
        K::ShadeLight => {
            if let Some(Material::Emissive { emission }) = scene.material(st.isect_object) {
                st.radiance += st.throughput * emission;
            }
            Ok(None)
        }
        K::ShadeShadow => shade_shadow(slot, st),
        K::ShadeSurface => shade_surface(scene, slot, st),
        K::ShadeVolume => shade_volume(scene, slot, st),
        other => Err(Error::device(format!("{other} is not an integrator phase"))),
    }
}

fn run_megakernel(scene: &Scene, slot: usize, st: &mut PathState) -> Result<Option<DeviceKernel>> {
    let mut kernel = DeviceKernel::IntersectClosest;
    for _ in 0..MAX_MEGAKERNEL_STEPS {
        match step(kernel, scene, slot, st)? {
            Some(next) => kernel = next,
            None => return Ok(None),
        }
    }
    Err(Error::consistency(format!(
        "path in slot {slot} did not terminate within {MAX_MEGAKERNEL_STEPS} steps"
    )))
}

fn intersect_closest(scene: &Scene, st: &mut PathState) -> DeviceKernel {
    let Some(hit) = scene.intersect(st.ray_p, st.ray_d, f32::MAX) else {
        st.isect_t = f32::MAX;
        st.isect_object = OBJECT_NONE;
        return DeviceKernel::ShadeBackground;
    };
    st.isect_t = hit.t;
    st.isect_object = hit.object;
    match scene.material(hit.object) {
        Some(Material::Emissive { .. }) => DeviceKernel::ShadeLight,
        Some(Material::Subsurface { .. }) => DeviceKernel::IntersectSubsurface,
        Some(Material::Volume { .. }) => DeviceKernel::ShadeVolume,
        _ => DeviceKernel::ShadeSurface,
    }
}

/// Walk through the object and continue shading where the light exits.
fn intersect_subsurface(scene: &Scene, st: &mut PathState) -> DeviceKernel {
    let object = st.isect_object;
    let entry = st.ray_p + st.ray_d * st.isect_t;
    let n = scene.normal(object, entry);

    let mut rng = PathRng::new(st.rng_state);
    let dir = sample_cosine_hemisphere(-n, rng.next_2d());
    st.rng_state = rng.state();

    if let Some(t_exit) = scene.exit_distance(object, entry, dir) {
        st.ray_p = entry;
        st.ray_d = dir;
        st.isect_t = t_exit;
    }
    st.throughput *= scene.material(object).map_or(Vec3::ONE, |m| m.albedo());
    DeviceKernel::ShadeSurface
}

fn check_shadow_free(slot: usize, st: &PathState) -> Result<()> {
    if st.shadow_occupied != 0 {
        return Err(Error::consistency(format!("slot {slot} already has a shadow ray in flight")));
    }
    Ok(())
}

fn check_shadow_in_flight(slot: usize, st: &PathState) -> Result<()> {
    if st.shadow_occupied == 0 {
        return Err(Error::consistency(format!("slot {slot} has no shadow ray in flight")));
    }
    Ok(())
}

fn clear_shadow(st: &mut PathState) {
    st.shadow_occupied = 0;
    st.shadow_throughput = Vec3::ZERO;
    st.continuation = QUEUED_NONE;
}

/// Park the path on a shadow ray when there is light to test, else go on.
fn emit_shadow(
    st: &mut PathState,
    origin: Vec3,
    dir: Vec3,
    contribution: Option<Vec3>,
    next: Option<DeviceKernel>,
) -> Option<DeviceKernel> {
    let Some(contribution) = contribution else {
        return next;
    };
    st.shadow_p = origin;
    st.shadow_d = dir;
    st.shadow_t = f32::MAX;
    st.shadow_throughput = contribution;
    st.shadow_occupied = 1;
    st.continuation = encode_queued(next);
    Some(DeviceKernel::IntersectShadow)
}

fn survive_russian_roulette(st: &mut PathState, albedo: Vec3, rng: &mut PathRng) -> bool {
    if st.bounce < RUSSIAN_ROULETTE_BOUNCE {
        return true;
    }
    let q = (st.throughput * albedo).max_element().clamp(0.05, 0.95);
    if rng.next_f32() >= q {
        return false;
    }
    st.throughput /= q;
    true
}

fn shade_surface(scene: &Scene, slot: usize, st: &mut PathState) -> Result<Option<DeviceKernel>> {
    check_shadow_free(slot, st)?;

    let p = st.ray_p + st.ray_d * st.isect_t;
    let n = scene.normal(st.isect_object, p);
    let albedo = scene.material(st.isect_object).map_or(Vec3::ZERO, |m| m.albedo());
    let origin = p + n * RAY_EPSILON;
    st.bounce += 1;

    let cos_sun = n.dot(scene.sun_direction);
    let shadow = (cos_sun > 0.0).then(|| st.throughput * albedo * DIFFUSE_BRDF * scene.sun_radiance * cos_sun);

    let mut rng = PathRng::new(st.rng_state);
    let mut next = None;
    if st.bounce < scene.max_bounce && survive_russian_roulette(st, albedo, &mut rng) {
        st.throughput *= albedo;
        st.ray_p = origin;
        st.ray_d = sample_cosine_hemisphere(n, rng.next_2d());
        next = Some(DeviceKernel::IntersectClosest);
    }
    st.rng_state = rng.state();

    Ok(emit_shadow(st, origin, scene.sun_direction, shadow, next))
}

fn shade_volume(scene: &Scene, slot: usize, st: &mut PathState) -> Result<Option<DeviceKernel>> {
    check_shadow_free(slot, st)?;

    let object = st.isect_object;
    let Some(Material::Volume { albedo, density }) = scene.material(object) else {
        return Err(Error::device(format!("object {object} does not bound a volume")));
    };

    // Medium segment along the ray, whether the ray starts inside or enters.
    let (start, length) = if scene.contains(object, st.ray_p) {
        (st.ray_p, st.isect_t)
    } else {
        let entry = st.ray_p + st.ray_d * st.isect_t;
        (entry, scene.exit_distance(object, entry, st.ray_d).unwrap_or(0.0))
    };

    let mut rng = PathRng::new(st.rng_state);
    let distance = -(1.0 - rng.next_f32()).ln() / density.max(1e-6);
    if distance >= length {
        st.ray_p = start + st.ray_d * (length + RAY_EPSILON);
        st.rng_state = rng.state();
        return Ok(Some(DeviceKernel::IntersectClosest));
    }

    let p = start + st.ray_d * distance;
    st.bounce += 1;
    st.throughput *= albedo;
    let shadow = Some(st.throughput * ISOTROPIC_PHASE * scene.sun_radiance);

    let mut next = None;
    if st.bounce < scene.max_bounce && survive_russian_roulette(st, Vec3::ONE, &mut rng) {
        st.ray_p = p;
        st.ray_d = sample_uniform_sphere(rng.next_2d());
        next = Some(DeviceKernel::IntersectClosest);
    }
    st.rng_state = rng.state();

    Ok(emit_shadow(st, p, scene.sun_direction, shadow, next))
}

fn intersect_shadow(scene: &Scene, slot: usize, st: &mut PathState) -> Result<Option<DeviceKernel>> {
    check_shadow_in_flight(slot, st)?;

    let transmittance = scene.transmittance(st.shadow_p, st.shadow_d, st.shadow_t);
    st.shadow_throughput *= transmittance;

    // Fully blocked: resume directly unless the path ends here, which needs
    // the render buffer only shadow shading has.
    if transmittance <= 0.0 {
        if let Some(resume) = decode_queued(st.continuation) {
            clear_shadow(st);
            return Ok(Some(resume));
        }
    }
    Ok(Some(DeviceKernel::ShadeShadow))
}

fn shade_shadow(slot: usize, st: &mut PathState) -> Result<Option<DeviceKernel>> {
    check_shadow_in_flight(slot, st)?;
    st.radiance += st.shadow_throughput;
    let resume = decode_queued(st.continuation);
    clear_shadow(st);
    Ok(resume)
}

// ============================================================================
// Camera path initialization
// ============================================================================

fn read_work_tile(shared: &CpuShared, slice: DeviceSlice) -> Result<KernelWorkTile> {
    let storage = shared.storage(slice.buffer)?;
    let words = storage.read();
    let start = slice.offset * TILE_WORDS;
    let raw = words
        .get(start..start + TILE_WORDS)
        .ok_or_else(|| Error::buffer(format!("work tile {} is outside of its buffer", slice.offset)))?;
    Ok(bytemuck::pod_read_unaligned(bytemuck::cast_slice(raw)))
}

fn camera_path(scene: &Scene, x: i32, y: i32, sample: u32, pixel: usize) -> PathState {
    let mut rng = PathRng::new(hash_combine(hash_u32(pixel as u32), sample));
    let jitter = rng.next_2d();
    let (origin, dir) = scene.camera.generate_ray(x as f32 + jitter.x, y as f32 + jitter.y);
    PathState {
        render_pixel_index: pixel as u32,
        sample,
        rng_state: rng.state(),
        queued_kernel: encode_queued(Some(DeviceKernel::IntersectClosest)),
        ray_p: origin,
        ray_d: dir,
        isect_object: OBJECT_NONE,
        throughput: Vec3::ONE,
        ..Default::default()
    }
}

fn init_from_camera(
    shared: &CpuShared,
    path_index: Option<DeviceSlice>,
    work_tile: DeviceSlice,
    render_buffer: BufferId,
    work_size: usize,
    path_index_offset: usize,
) -> Result<()> {
    let tile = read_work_tile(shared, work_tile)?;
    if work_size > tile.work_size() {
        return Err(Error::buffer(format!(
            "{work_size} camera paths requested from a tile of {}",
            tile.work_size()
        )));
    }

    let scene = shared.scene();
    let arrays = state_arrays(shared)?;
    let counter_storage = queue_counter(shared)?;
    let film_storage = shared.storage(render_buffer)?;
    let slots = resolve_slots(shared, path_index, work_size, path_index_offset)?;

    let mut film = film_storage.write();
    let initialized = {
        let film: &[u32] = &film;
        let scene: &Scene = &scene;
        slots
            .into_par_iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let (x, y, sample) = tile.work_pixel(i);
                let pixel = tile.buffer_pixel(x, y);
                match pixel_passes(film, pixel) {
                    Err(e) => Some(Err(e)),
                    Ok(passes) if f32::from_bits(passes[PASS_ADAPTIVE_CONVERGED]) >= 0.5 => None,
                    Ok(_) => Some(Ok((slot, camera_path(scene, x, y, sample, pixel)))),
                }
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut state = StateView::lock(&arrays)?;
    let mut counter = counter_storage.write();
    for (slot, st) in initialized {
        if slot >= state.capacity() {
            return Err(Error::buffer(format!("path index {slot} outside of state capacity {}", state.capacity())));
        }
        if state.u32(StateField::PathQueuedKernel, slot) != QUEUED_NONE {
            return Err(Error::consistency(format!("camera path initialized into busy slot {slot}")));
        }
        state.write(slot, &st);
        counter[DeviceKernel::IntersectClosest.index()] += 1;
        add_pass(&mut film, st.render_pixel_index as usize * PASS_STRIDE + PASS_SAMPLE_COUNT, 1.0);
    }
    Ok(())
}

// ============================================================================
// Compaction
// ============================================================================

fn compact(
    shared: &CpuShared,
    kernel: DeviceKernel,
    work_size: usize,
    queued_paths: BufferId,
    num_queued_paths: BufferId,
    queued_kernel: Option<DeviceKernel>,
) -> Result<()> {
    let arrays = state_arrays(shared)?;
    let field = |f: StateField| {
        arrays
            .get(f.index())
            .ok_or_else(|| Error::buffer("integrator state is incomplete"))
    };
    let target = encode_queued(queued_kernel);
    let shadow_only = kernel == DeviceKernel::QueuedShadowPathsArray;

    let list: Vec<u32> = {
        let queued = field(StateField::PathQueuedKernel)?.read();
        let occupied = field(StateField::ShadowOccupied)?.read();
        let n = work_size.min(queued.len()).min(occupied.len());
        (0..n)
            .into_par_iter()
            .filter(|&slot| queued[slot] == target && (!shadow_only || occupied[slot] != 0))
            .map(|slot| slot as u32)
            .collect()
    };

    let out_storage = shared.storage(queued_paths)?;
    let mut out = out_storage.write();
    let dst = out.get_mut(..list.len()).ok_or_else(|| {
        Error::buffer(format!("queued path list cannot hold {} entries", list.len()))
    })?;
    dst.copy_from_slice(&list);
    drop(out);

    let count_storage = shared.storage(num_queued_paths)?;
    let mut count = count_storage.write();
    let first = count
        .first_mut()
        .ok_or_else(|| Error::buffer("queued path count buffer is empty"))?;
    *first += list.len() as u32;
    Ok(())
}

// ============================================================================
// Film and adaptive sampling
// ============================================================================

fn film_convert(
    shared: &CpuShared,
    rgba_half: DeviceSlice,
    render_buffer: BufferId,
    sample_scale: f32,
    per_pixel_sample_count: bool,
    region: PassRegion,
) -> Result<()> {
    let film_storage = shared.storage(render_buffer)?;
    let width = region.width.max(0) as usize;

    let pixels = {
        let film = film_storage.read();
        let film: &[u32] = &film;
        (0..region.num_pixels())
            .into_par_iter()
            .map(|i| -> Result<Half4> {
                let passes = pixel_passes(film, region.buffer_pixel((i % width) as i32, (i / width) as i32))?;
                let pass = |k: usize| f32::from_bits(passes[k]);
                let scale = if per_pixel_sample_count {
                    let n = pass(PASS_SAMPLE_COUNT);
                    if n > 0.0 { 1.0 / n } else { 0.0 }
                } else {
                    sample_scale
                };
                let color = Vec3::new(pass(PASS_COMBINED), pass(PASS_COMBINED + 1), pass(PASS_COMBINED + 2));
                Ok(Half4::from_rgb(color * scale, 1.0))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let out_storage = shared.storage(rgba_half.buffer)?;
    let mut out = out_storage.write();
    let dst: &mut [Half4] = bytemuck::try_cast_slice_mut(out.as_mut_slice())
        .map_err(|e| Error::buffer(format!("display buffer does not hold half4 pixels: {e}")))?;
    let end = rgba_half.offset + pixels.len();
    let dst_len = dst.len();
    dst.get_mut(rgba_half.offset..end)
        .ok_or_else(|| Error::buffer(format!("{} pixels do not fit a display buffer of {dst_len}", pixels.len())))?
        .copy_from_slice(&pixels);
    Ok(())
}

fn adaptive_check(
    shared: &CpuShared,
    render_buffer: BufferId,
    region: PassRegion,
    sample: u32,
    min_samples: u32,
    threshold: f32,
    num_active_pixels: BufferId,
) -> Result<()> {
    let film_storage = shared.storage(render_buffer)?;
    let mut film = film_storage.write();
    let width = region.width.max(0) as usize;
    let required = min_samples.max(2) as f32;

    let verdicts = {
        let film: &[u32] = &film;
        (0..region.num_pixels())
            .into_par_iter()
            .map(|i| -> Result<(usize, bool)> {
                let pixel = region.buffer_pixel((i % width) as i32, (i / width) as i32);
                let passes = pixel_passes(film, pixel)?;
                let pass = |k: usize| f32::from_bits(passes[k]);

                if pass(PASS_ADAPTIVE_CONVERGED) >= 0.5 {
                    return Ok((pixel, true));
                }
                let count = pass(PASS_SAMPLE_COUNT);
                if sample < min_samples || count < required {
                    return Ok((pixel, false));
                }

                let sum = Vec3::new(pass(PASS_COMBINED), pass(PASS_COMBINED + 1), pass(PASS_COMBINED + 2));
                let sum_sq = Vec3::new(
                    pass(PASS_COMBINED_SQUARED),
                    pass(PASS_COMBINED_SQUARED + 1),
                    pass(PASS_COMBINED_SQUARED + 2),
                );
                let mean = sum / count;
                let variance = (sum_sq / count - mean * mean).max(Vec3::ZERO);
                let std_error = (variance / count).powf(0.5);
                let error = luminance(std_error) / (luminance(mean) + 1e-4).sqrt();
                Ok((pixel, error < threshold))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut num_active = 0u32;
    for (pixel, converged) in verdicts {
        film[pixel * PASS_STRIDE + PASS_ADAPTIVE_CONVERGED] = (if converged { 1.0f32 } else { 0.0 }).to_bits();
        num_active += u32::from(!converged);
    }
    drop(film);

    let count_storage = shared.storage(num_active_pixels)?;
    let mut count = count_storage.write();
    let first = count
        .first_mut()
        .ok_or_else(|| Error::buffer("active pixel count buffer is empty"))?;
    *first += num_active;
    Ok(())
}

/// Mark converged pixels next to an unconverged one as unconverged again.
fn adaptive_filter(shared: &CpuShared, horizontal: bool, render_buffer: BufferId, region: PassRegion) -> Result<()> {
    let film_storage = shared.storage(render_buffer)?;
    let mut film = film_storage.write();
    let (w, h) = (region.width.max(0), region.height.max(0));
    let flag = |x: i32, y: i32| region.buffer_pixel(x, y) * PASS_STRIDE + PASS_ADAPTIVE_CONVERGED;

    let to_reset = {
        let film: &[u32] = &film;
        let converged = |x: i32, y: i32| -> Result<bool> {
            film.get(flag(x, y))
                .map(|&v| f32::from_bits(v) >= 0.5)
                .ok_or_else(|| Error::buffer(format!("pixel ({x}, {y}) is outside of the render buffer")))
        };
        (0..w * h)
            .into_par_iter()
            .map(|i| -> Result<Option<usize>> {
                let (x, y) = (i % w, i / w);
                if !converged(x, y)? {
                    return Ok(None);
                }
                let neighbours = if horizontal { [(x - 1, y), (x + 1, y)] } else { [(x, y - 1), (x, y + 1)] };
                for (nx, ny) in neighbours {
                    if (0..w).contains(&nx) && (0..h).contains(&ny) && !converged(nx, ny)? {
                        return Ok(Some(flag(x, y)));
                    }
                }
                Ok(None)
            })
            .filter_map(|r| r.transpose())
            .collect::<Result<Vec<_>>>()?
    };

    for index in to_reset {
        film[index] = 0f32.to_bits();
    }
    Ok(())
}
