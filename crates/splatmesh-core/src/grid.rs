use glam::{IVec3, Vec3};

/// Half-open integer range `[lo, hi)` of grid cells along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub lo: i32,
    pub hi: i32,
}

impl Extent {
    #[inline]
    pub fn new(lo: i32, hi: i32) -> Self {
        debug_assert!(lo <= hi);
        Self { lo, hi }
    }

    #[inline]
    pub fn cells(&self) -> u32 {
        (self.hi - self.lo) as u32
    }

    #[inline]
    pub fn vertices(&self) -> u32 {
        self.cells() + 1
    }
}

/// A regular sampling lattice: world reference point, isotropic spacing and a
/// per-axis window of cells.
///
/// Cell `(0,0,0)` of the underlying lattice has its low corner at the
/// reference point; the extents select a window of that lattice. Vertex
/// coordinates produced by [`Grid::world_to_vertex`] are relative to the
/// window's low corner, so vertex 0 of the window maps to 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    reference: Vec3,
    spacing: f32,
    extents: [Extent; 3],
}

impl Grid {
    pub fn new(reference: Vec3, spacing: f32, extents: [Extent; 3]) -> Self {
        debug_assert!(spacing > 0.0);
        Self {
            reference,
            spacing,
            extents,
        }
    }

    #[inline]
    pub fn reference(&self) -> Vec3 {
        self.reference
    }

    #[inline]
    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    #[inline]
    pub fn extent(&self, axis: usize) -> Extent {
        self.extents[axis]
    }

    #[inline]
    pub fn extents(&self) -> [Extent; 3] {
        self.extents
    }

    #[inline]
    pub fn num_cells(&self, axis: usize) -> u32 {
        self.extents[axis].cells()
    }

    #[inline]
    pub fn num_vertices(&self, axis: usize) -> u32 {
        self.extents[axis].vertices()
    }

    /// Total cell count of the window.
    pub fn total_cells(&self) -> u64 {
        self.extents.iter().map(|e| e.cells() as u64).product()
    }

    /// Low corner of the window in absolute lattice cells.
    #[inline]
    pub fn lo(&self) -> IVec3 {
        IVec3::new(self.extents[0].lo, self.extents[1].lo, self.extents[2].lo)
    }

    /// Floor a world position into absolute lattice cell coordinates.
    #[inline]
    pub fn world_to_cell(&self, world: Vec3) -> IVec3 {
        ((world - self.reference) / self.spacing).floor().as_ivec3()
    }

    /// Affine map from world space to window-relative vertex coordinates.
    #[inline]
    pub fn world_to_vertex(&self, world: Vec3) -> Vec3 {
        (world - self.reference) / self.spacing - self.lo().as_vec3()
    }

    /// Inverse of [`Grid::world_to_vertex`].
    #[inline]
    pub fn vertex_to_world(&self, vertex: Vec3) -> Vec3 {
        (vertex + self.lo().as_vec3()) * self.spacing + self.reference
    }

    /// The same lattice restricted to a different window.
    pub fn with_extents(&self, extents: [Extent; 3]) -> Self {
        Self {
            reference: self.reference,
            spacing: self.spacing,
            extents,
        }
    }
}

/// Axis-aligned world-space bounding box accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    #[inline]
    pub fn include_sphere(&mut self, center: Vec3, radius: f32) {
        self.min = self.min.min(center - Vec3::splat(radius));
        self.max = self.max.max(center + Vec3::splat(radius));
    }

    #[inline]
    pub fn include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::new(
            Vec3::new(1.0, 2.0, 3.0),
            0.5,
            [Extent::new(-4, 4), Extent::new(0, 8), Extent::new(2, 3)],
        )
    }

    #[test]
    fn counts() {
        let g = grid();
        assert_eq!(g.num_cells(0), 8);
        assert_eq!(g.num_vertices(0), 9);
        assert_eq!(g.num_cells(2), 1);
        assert_eq!(g.total_cells(), 8 * 8);
    }

    #[test]
    fn world_to_cell_floors() {
        let g = grid();
        assert_eq!(g.world_to_cell(Vec3::new(1.0, 2.0, 3.0)), IVec3::ZERO);
        assert_eq!(
            g.world_to_cell(Vec3::new(0.99, 2.0, 3.0)),
            IVec3::new(-1, 0, 0)
        );
        assert_eq!(
            g.world_to_cell(Vec3::new(1.74, 2.51, 2.49)),
            IVec3::new(1, 1, -2)
        );
    }

    #[test]
    fn vertex_roundtrip() {
        let g = grid();
        let w = Vec3::new(0.25, 3.1, 4.2);
        let v = g.world_to_vertex(w);
        assert!((g.vertex_to_world(v) - w).length() < 1e-5);
        // Vertex 0 of the window is the window's low corner.
        let lo_world = g.vertex_to_world(Vec3::ZERO);
        assert!((g.world_to_vertex(lo_world)).length() < 1e-6);
    }

    #[test]
    fn sub_extents_share_lattice() {
        let g = grid();
        let sub = g.with_extents([Extent::new(-2, 0), Extent::new(1, 3), Extent::new(2, 3)]);
        let w = Vec3::new(0.4, 2.9, 4.0);
        // Same lattice: absolute cells agree, window-relative vertices shift by the lo delta.
        assert_eq!(g.world_to_cell(w), sub.world_to_cell(w));
        let delta = sub.world_to_vertex(w) - g.world_to_vertex(w);
        assert!((delta - Vec3::new(2.0, -1.0, 0.0)).length() < 1e-5);
    }
}
