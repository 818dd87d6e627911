//! Boundary detection.
//!
//! The MLS surface extends to the edge of the splats' support, well past the
//! scanned geometry. A vertex is kept only while it stays within
//! `limit · r̄(q)` of the weighted splat centroid, where `r̄` is the weighted
//! mean of the *unscaled* splat radii; past that the local splat density no
//! longer backs the surface and the triangle is clipped.

use glam::Vec3;

use crate::mls::MlsField;

#[derive(Debug, Clone, Copy)]
pub struct BoundaryClip {
    pub limit: f32,
    /// The smoothing factor the splat radii were premultiplied by.
    pub smooth: f32,
}

impl BoundaryClip {
    pub fn keeps(&self, field: &MlsField<'_>, q: Vec3) -> bool {
        let sample = field.sample(q);
        if !(sample.weight > 0.0) {
            return false;
        }
        let base_radius = sample.mean_radius / self.smooth;
        sample.offset.length_squared() <= (self.limit * base_radius).powi(2)
    }
}
