//! The moving-least-squares implicit function.
//!
//! `f(q) = Σ wᵢ · n̂ᵢ·(q − pᵢ) / Σ wᵢ` over the splats whose support covers
//! `q`, with a compactly supported polynomial kernel weighted by splat
//! quality. The zero set of `f` is the reconstructed surface; samples with
//! no support evaluate to +∞ (definitely outside).

use glam::Vec3;
use splatmesh_core::Splat;

use crate::octree::SplatOctree;

/// A scalar field sampled per grid vertex by the extraction stage.
pub trait ScalarField: Sync {
    fn eval(&self, p: Vec3) -> f32;
}

/// Adapter for analytic fields (test surfaces, debugging).
pub struct FnField<F>(pub F);

impl<F: Fn(Vec3) -> f32 + Sync> ScalarField for FnField<F> {
    fn eval(&self, p: Vec3) -> f32 {
        (self.0)(p)
    }
}

/// Everything one field probe learns about the local splat population.
#[derive(Debug, Clone, Copy)]
pub struct MlsSample {
    pub value: f32,
    pub weight: f32,
    /// Weighted splat centroid minus the probe point.
    pub offset: Vec3,
    /// Weighted mean of the (scaled) splat radii.
    pub mean_radius: f32,
}

pub struct MlsField<'a> {
    /// Bin-local splats with normalized normals.
    splats: &'a [Splat],
    octree: &'a SplatOctree,
}

impl<'a> MlsField<'a> {
    pub fn new(splats: &'a [Splat], octree: &'a SplatOctree) -> Self {
        Self { splats, octree }
    }

    pub fn sample(&self, q: Vec3) -> MlsSample {
        let mut weight = 0.0f32;
        let mut dist = 0.0f32;
        let mut offset = Vec3::ZERO;
        let mut radius = 0.0f32;

        self.octree.visit(q, |id| {
            let splat = &self.splats[id as usize];
            let to_q = q - splat.position;
            let d2 = to_q.length_squared();
            let r2 = splat.radius * splat.radius;
            if d2 >= r2 {
                return;
            }
            let falloff = 1.0 - d2 / r2;
            let w = splat.quality * falloff * falloff;
            weight += w;
            dist += w * splat.normal.dot(to_q);
            offset += w * -to_q;
            radius += w * splat.radius;
        });

        if weight > 0.0 {
            MlsSample {
                value: dist / weight,
                weight,
                offset: offset / weight,
                mean_radius: radius / weight,
            }
        } else {
            MlsSample {
                value: f32::INFINITY,
                weight: 0.0,
                offset: Vec3::ZERO,
                mean_radius: 0.0,
            }
        }
    }
}

impl ScalarField for MlsField<'_> {
    #[inline]
    fn eval(&self, p: Vec3) -> f32 {
        self.sample(p).value
    }
}
