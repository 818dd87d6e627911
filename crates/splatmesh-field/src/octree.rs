//! Per-bin splat octree.
//!
//! Levels are numbered from the finest (level 0) upward, as in the device
//! representation this mirrors: level `l` cells span `2^(subsampling + l)`
//! grid cells. A splat is inserted at the coarsest level whose cell still
//! fits its support diameter, into every cell its support box overlaps, so a
//! point query touches exactly one cell per level.
//!
//! Query order is `(level, insertion order)`; with splats presented in
//! global ID order this makes field sums bit-identical for any two bins
//! that share a boundary sample.

use glam::Vec3;
use rustc_hash::FxHashMap;
use splatmesh_core::Splat;

pub struct SplatOctree {
    levels: u32,
    subsampling: u32,
    /// Per level: cell code -> splat indices.
    cells: Vec<FxHashMap<u32, Vec<u32>>>,
    /// Cells per axis at the finest level, for code packing.
    dims: u32,
}

impl SplatOctree {
    pub fn new(levels: u32, subsampling: u32) -> Self {
        assert!(levels >= 1);
        Self {
            levels,
            subsampling,
            cells: (0..levels).map(|_| FxHashMap::default()).collect(),
            dims: 0,
        }
    }

    /// Grid cells per axis covered by the octree.
    pub fn domain_cells(&self) -> u32 {
        1 << (self.levels - 1 + self.subsampling)
    }

    fn cell_size(&self, level: u32) -> u32 {
        1 << (self.subsampling + level)
    }

    /// Rebuild over bin-local splats (positions relative to the bin's low
    /// corner, radii in grid units). Previous contents are discarded but
    /// the cell storage is recycled.
    pub fn build(&mut self, splats: &[Splat]) {
        for level in &mut self.cells {
            level.clear();
        }
        self.dims = self.domain_cells() >> self.subsampling;
        let domain = self.domain_cells() as f32;

        for (id, splat) in splats.iter().enumerate() {
            let level = self.level_for(splat.radius);
            let size = self.cell_size(level) as f32;
            let lo = (splat.position - Vec3::splat(splat.radius)).max(Vec3::ZERO);
            let hi = (splat.position + Vec3::splat(splat.radius)).min(Vec3::splat(domain));
            if lo.cmpgt(hi).any() {
                continue; // support does not reach the octree domain
            }
            let lo = (lo / size).floor().as_uvec3();
            let hi = (hi / size).floor().as_uvec3().min(glam::UVec3::splat(
                (self.domain_cells() / self.cell_size(level)).saturating_sub(1),
            ));
            for z in lo.z..=hi.z {
                for y in lo.y..=hi.y {
                    for x in lo.x..=hi.x {
                        let code = self.code(level, x, y, z);
                        self.cells[level as usize]
                            .entry(code)
                            .or_default()
                            .push(id as u32);
                    }
                }
            }
        }
    }

    /// Coarsest-fitting level: the smallest cell size at least the support
    /// diameter, clamped to the available levels.
    fn level_for(&self, radius: f32) -> u32 {
        let mut level = 0;
        while level + 1 < self.levels && (self.cell_size(level) as f32) < 2.0 * radius {
            level += 1;
        }
        level
    }

    fn code(&self, level: u32, x: u32, y: u32, z: u32) -> u32 {
        let dims = (self.dims >> level).max(1) + 1;
        (z * dims + y) * dims + x
    }

    /// Visit the indices of every splat whose cell chain covers `point`, in
    /// `(level, insertion)` order.
    #[inline]
    pub fn visit(&self, point: Vec3, mut f: impl FnMut(u32)) {
        for level in 0..self.levels {
            let size = self.cell_size(level) as f32;
            let c = (point / size).floor();
            if c.cmplt(Vec3::ZERO).any() {
                continue;
            }
            // A sample on the domain's high face belongs to the last cell.
            let last = (self.domain_cells() / self.cell_size(level)).saturating_sub(1);
            let c = c.as_uvec3().min(glam::UVec3::splat(last));
            let code = self.code(level, c.x, c.y, c.z);
            if let Some(ids) = self.cells[level as usize].get(&code) {
                for &id in ids {
                    f(id);
                }
            }
        }
    }
}
