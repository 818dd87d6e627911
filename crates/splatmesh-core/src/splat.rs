use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// An oriented point-cloud sample: a disc with a position, support radius,
/// (not necessarily unit) normal and a quality weight.
///
/// The layout is fixed so that splat arrays can be handed to compute
/// backends and spill files as plain bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Splat {
    pub position: Vec3,
    /// Support radius, premultiplied by the smoothing factor at decode time.
    pub radius: f32,
    pub normal: Vec3,
    /// MLS weight prefactor, `1 / r²` of the unscaled radius.
    pub quality: f32,
}

impl Splat {
    /// A splat participates in reconstruction only if every component is
    /// finite and its radius is positive. Anything else is silently skipped
    /// (and counted) by the readers.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.normal.is_finite()
            && self.radius.is_finite()
            && self.radius > 0.0
            && self.quality.is_finite()
    }
}
