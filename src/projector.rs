//! Forward and back projection operators.
//!
//! Both geometries share one ray walker: a ray is sampled once per volume
//! column (or row, whichever axis it is closer to) and linearly interpolated
//! between the two nearest pixels. Back projection visits exactly the same
//! `(pixel, weight)` pairs as forward projection, so it is the transpose.
//!
//! Volume coordinates are centred on the origin with unit pixels; row 0 is
//! the top of the image and `+y` points up.

use std::fmt;

use ndarray::{ArrayView2, ArrayViewMut2};

use crate::geometry::{Dimensions, FanProjection, Geometry};

/// A projection operator pair bound to one geometry.
pub trait Projector: fmt::Debug {
    fn dims(&self) -> &Dimensions;

    /// Owned copy of the geometry this operator was built from.
    fn geometry(&self) -> Geometry;

    /// `sinogram += scale * A * volume`
    fn forward(&self, volume: ArrayView2<'_, f32>, sinogram: ArrayViewMut2<'_, f32>, scale: f32);

    /// `volume += A' * sinogram`
    fn backward(&self, sinogram: ArrayView2<'_, f32>, volume: ArrayViewMut2<'_, f32>);
}

/// Build the operator pair matching `geometry`.
pub fn projector_for(dims: Dimensions, geometry: Geometry) -> Box<dyn Projector> {
    match geometry {
        Geometry::Parallel { angles, offsets } => {
            Box::new(ParallelProjector::new(dims, angles, offsets))
        }
        Geometry::Fan { projections } => Box::new(FanProjector::new(dims, projections)),
    }
}

type Point = (f32, f32);

/// Sub-ray origin and direction for `(angle, detector, sub-ray)`.
trait RaySource {
    fn dims(&self) -> &Dimensions;
    fn ray(&self, angle: usize, det: usize, sub: usize) -> (Point, Point);
}

/// Walk the line `origin + s * dir` through the volume.
fn trace_ray(width: usize, height: usize, origin: Point, dir: Point, mut visit: impl FnMut(usize, usize, f32)) {
    let (ox, oy) = origin;
    let (dx, dy) = dir;
    let len = dx.hypot(dy);
    if len == 0.0 {
        return;
    }
    let half_w = 0.5 * width as f32;
    let half_h = 0.5 * height as f32;

    if dx.abs() >= dy.abs() {
        let step = len / dx.abs();
        for col in 0..width {
            let x = col as f32 + 0.5 - half_w;
            let y = oy + (x - ox) / dx * dy;
            let row = half_h - 0.5 - y;
            interpolate(row, height, step, |r, w| visit(r, col, w));
        }
    } else {
        let step = len / dy.abs();
        for row in 0..height {
            let y = half_h - 0.5 - row as f32;
            let x = ox + (y - oy) / dy * dx;
            let col = x + half_w - 0.5;
            interpolate(col, width, step, |c, w| visit(row, c, w));
        }
    }
}

fn interpolate(pos: f32, len: usize, step: f32, mut visit: impl FnMut(usize, f32)) {
    let lower = pos.floor();
    let frac = pos - lower;
    let lower = lower as i64;
    for (idx, w) in [(lower, 1.0 - frac), (lower + 1, frac)] {
        if idx >= 0 && (idx as usize) < len && w > 0.0 {
            visit(idx as usize, w * step);
        }
    }
}

fn forward_rays<S: RaySource>(
    source: &S,
    volume: ArrayView2<'_, f32>,
    mut sinogram: ArrayViewMut2<'_, f32>,
    scale: f32,
) {
    let dims = *source.dims();
    let sub_weight = 1.0 / dims.rays_per_det as f32;
    for angle in 0..dims.proj_angles {
        for det in 0..dims.proj_dets {
            let mut sum = 0.0f32;
            for sub in 0..dims.rays_per_det {
                let (origin, dir) = source.ray(angle, det, sub);
                trace_ray(dims.vol_width, dims.vol_height, origin, dir, |r, c, w| {
                    sum += w * volume[[r, c]];
                });
            }
            sinogram[[angle, det]] += scale * sub_weight * sum;
        }
    }
}

fn backward_rays<S: RaySource>(
    source: &S,
    sinogram: ArrayView2<'_, f32>,
    mut volume: ArrayViewMut2<'_, f32>,
) {
    let dims = *source.dims();
    let sub_weight = 1.0 / dims.rays_per_det as f32;
    for angle in 0..dims.proj_angles {
        for det in 0..dims.proj_dets {
            let value = sub_weight * sinogram[[angle, det]];
            if value == 0.0 {
                continue;
            }
            for sub in 0..dims.rays_per_det {
                let (origin, dir) = source.ray(angle, det, sub);
                trace_ray(dims.vol_width, dims.vol_height, origin, dir, |r, c, w| {
                    volume[[r, c]] += w * value;
                });
            }
        }
    }
}

/// Parallel-beam operators.
#[derive(Debug, Clone)]
pub struct ParallelProjector {
    dims: Dimensions,
    angles: Vec<f32>,
    offsets: Option<Vec<f32>>,
    sin_cos: Vec<(f32, f32)>,
}

impl ParallelProjector {
    pub fn new(dims: Dimensions, angles: Vec<f32>, offsets: Option<Vec<f32>>) -> Self {
        let sin_cos = angles.iter().map(|a| a.sin_cos()).collect();
        Self {
            dims,
            angles,
            offsets,
            sin_cos,
        }
    }
}

impl RaySource for ParallelProjector {
    fn dims(&self) -> &Dimensions {
        &self.dims
    }

    fn ray(&self, angle: usize, det: usize, sub: usize) -> (Point, Point) {
        let (sin, cos) = self.sin_cos[angle];
        let offset = self.offsets.as_ref().map_or(0.0, |o| o[angle]);
        let sub_pos = (sub as f32 + 0.5) / self.dims.rays_per_det as f32;
        let t = (det as f32 + sub_pos - 0.5 * self.dims.proj_dets as f32 + offset) * self.dims.det_scale;
        ((t * cos, t * sin), (-sin, cos))
    }
}

impl Projector for ParallelProjector {
    fn dims(&self) -> &Dimensions {
        &self.dims
    }

    fn geometry(&self) -> Geometry {
        Geometry::Parallel {
            angles: self.angles.clone(),
            offsets: self.offsets.clone(),
        }
    }

    fn forward(&self, volume: ArrayView2<'_, f32>, sinogram: ArrayViewMut2<'_, f32>, scale: f32) {
        forward_rays(self, volume, sinogram, scale)
    }

    fn backward(&self, sinogram: ArrayView2<'_, f32>, volume: ArrayViewMut2<'_, f32>) {
        backward_rays(self, sinogram, volume)
    }
}

/// Fan-beam operators over explicit per-angle vectors.
#[derive(Debug, Clone)]
pub struct FanProjector {
    dims: Dimensions,
    projections: Vec<FanProjection>,
}

impl FanProjector {
    pub fn new(dims: Dimensions, projections: Vec<FanProjection>) -> Self {
        Self { dims, projections }
    }
}

impl RaySource for FanProjector {
    fn dims(&self) -> &Dimensions {
        &self.dims
    }

    fn ray(&self, angle: usize, det: usize, sub: usize) -> (Point, Point) {
        let p = &self.projections[angle];
        let u = det as f32 + (sub as f32 + 0.5) / self.dims.rays_per_det as f32;
        let target = (p.det_sx + u * p.det_ux, p.det_sy + u * p.det_uy);
        ((p.src_x, p.src_y), (target.0 - p.src_x, target.1 - p.src_y))
    }
}

impl Projector for FanProjector {
    fn dims(&self) -> &Dimensions {
        &self.dims
    }

    fn geometry(&self) -> Geometry {
        Geometry::Fan {
            projections: self.projections.clone(),
        }
    }

    fn forward(&self, volume: ArrayView2<'_, f32>, sinogram: ArrayViewMut2<'_, f32>, scale: f32) {
        forward_rays(self, volume, sinogram, scale)
    }

    fn backward(&self, sinogram: ArrayView2<'_, f32>, volume: ArrayViewMut2<'_, f32>) {
        backward_rays(self, sinogram, volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FanFlatGeometry;
    use ndarray::Array2;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::f32::consts::PI;

    fn angles(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 * PI / n as f32).collect()
    }

    fn adjoint_gap(projector: &dyn Projector, seed: u64) -> f32 {
        let dims = *projector.dims();
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::random_using((dims.vol_height, dims.vol_width), Uniform::new(0.0f32, 1.0), &mut rng);
        let y = Array2::random_using((dims.proj_angles, dims.proj_dets), Uniform::new(0.0f32, 1.0), &mut rng);

        let mut ax = Array2::<f32>::zeros((dims.proj_angles, dims.proj_dets));
        projector.forward(x.view(), ax.view_mut(), 1.0);
        let mut aty = Array2::<f32>::zeros((dims.vol_height, dims.vol_width));
        projector.backward(y.view(), aty.view_mut());

        let lhs: f32 = (&ax * &y).sum();
        let rhs: f32 = (&x * &aty).sum();
        (lhs - rhs).abs() / lhs.abs().max(1e-6)
    }

    #[test]
    fn parallel_backprojection_is_adjoint() {
        let dims = Dimensions::new(8, 8, 6, 10).with_rays_per_det(2);
        let projector = ParallelProjector::new(dims, angles(6), Some(vec![0.25; 6]));
        assert!(adjoint_gap(&projector, 7) < 1e-4);
    }

    #[test]
    fn fan_backprojection_is_adjoint() {
        let dims = Dimensions::new(8, 8, 6, 12);
        let fan = FanFlatGeometry {
            detector_count: 12,
            detector_width: 1.5,
            angles: angles(6),
            origin_source: 20.0,
            origin_detector: 10.0,
        };
        let projector = FanProjector::new(dims, fan.to_vectors());
        assert!(adjoint_gap(&projector, 11) < 1e-4);
    }

    #[test]
    fn horizontal_ray_sums_one_row() {
        // angle pi/2 gives rays along -x at height t
        let dims = Dimensions::new(4, 4, 1, 4);
        let projector = ParallelProjector::new(dims, vec![PI / 2.0], None);
        let mut volume = Array2::<f32>::zeros((4, 4));
        volume.row_mut(0).fill(1.0);
        let mut sino = Array2::<f32>::zeros((1, 4));
        projector.forward(volume.view(), sino.view_mut(), 1.0);
        let total: f32 = sino.sum();
        assert!((total - 4.0).abs() < 1e-4, "total {total}");
        assert!(sino.iter().filter(|&&v| v > 1e-4).count() == 1);
    }

    #[test]
    fn forward_accumulates_with_scale() {
        let dims = Dimensions::new(6, 6, 4, 8);
        let projector = ParallelProjector::new(dims, angles(4), None);
        let volume = Array2::<f32>::from_elem((6, 6), 1.0);
        let mut once = Array2::<f32>::zeros((4, 8));
        projector.forward(volume.view(), once.view_mut(), 1.0);

        let mut acc = once.clone();
        projector.forward(volume.view(), acc.view_mut(), -1.0);
        assert!(acc.iter().all(|v| v.abs() < 1e-5));

        assert!(matches!(projector.geometry(), Geometry::Parallel { .. }));
    }
}
