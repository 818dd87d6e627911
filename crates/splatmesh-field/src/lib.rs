//! The per-bin compute engine behind the device workers.
//!
//! This is the host-portable implementation of the isosurface contract: a
//! splat octree, the MLS distance field, marching-tetrahedra extraction with
//! global vertex keys, per-fragment welding with ship-out, and optional
//! boundary clipping. Each device worker owns one [`FieldEngine`] with all
//! scratch preallocated, mirroring one command queue plus buffer set per
//! worker; the inner field sampling fans out across a rayon pool.

mod clip;
mod marching;
mod mls;
mod octree;
pub mod tables;

pub use clip::BoundaryClip;
pub use marching::{EVAL_ALIGN, MarchingEngine};
pub use mls::{FnField, MlsField, MlsSample, ScalarField};
pub use octree::SplatOctree;

use glam::{UVec3, Vec3};
use splatmesh_core::{KeyMesh, Splat};

/// Largest supported octree depth.
pub const MAX_LEVELS: u32 = 11;

/// Upper bound on `levels + subsampling`; bins index at most
/// `2^(MAX_BLOCK_LOG2 - 1)` cells per axis.
pub const MAX_BLOCK_LOG2: u32 = 14;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub levels: u32,
    pub subsampling: u32,
    /// The factor splat radii were premultiplied by at decode time.
    pub smooth: f32,
    pub keep_boundary: bool,
    pub boundary_limit: f32,
}

/// Cells per bin axis implied by the octree configuration.
pub fn block_cells(levels: u32, subsampling: u32) -> u32 {
    (1u32 << (levels + subsampling - 1)) - 1
}

/// Rough preallocated scratch per engine (slices plus one worst-case slab
/// of unwelded geometry), so startup can report what a worker will pin.
pub fn engine_resource_bytes(levels: u32, subsampling: u32) -> u64 {
    let side = block_cells(levels, subsampling) as u64 + 1;
    let stride = side.div_ceil(EVAL_ALIGN as u64) * EVAL_ALIGN as u64;
    let slab = (side - 1) * (side - 1);
    let slices = 2 * stride * side * size_of::<f32>() as u64;
    let vertices = slab * tables::TABLES.max_cell_vertices as u64 * 32;
    let indices = slab * tables::TABLES.max_cell_indices as u64 * size_of::<u32>() as u64;
    slices + vertices + indices
}

pub struct FieldEngine {
    config: EngineConfig,
    octree: SplatOctree,
    marching: MarchingEngine,
    /// Bin-local splat copies with normalized normals.
    local: Vec<Splat>,
}

impl FieldEngine {
    pub fn new(config: EngineConfig) -> Self {
        let cells = block_cells(config.levels, config.subsampling);
        Self {
            config,
            octree: SplatOctree::new(config.levels, config.subsampling),
            marching: MarchingEngine::new(cells as usize + 1, cells as usize + 1),
            local: Vec::new(),
        }
    }

    /// Run one bin: `splats` in bounding-grid vertex coordinates, the bin's
    /// low corner `offset` (cells, relative to the bounding grid's low
    /// corner), its vertex-lattice `size`, and the local-to-world affine.
    /// Fragments stream through `out`; returns the number of ship-outs.
    pub fn process_bin<O: FnMut(KeyMesh)>(
        &mut self,
        splats: &[Splat],
        offset: UVec3,
        size: UVec3,
        transform: (f32, Vec3),
        out: &mut O,
    ) -> u64 {
        self.local.clear();
        self.local.extend(splats.iter().map(|s| Splat {
            position: s.position - offset.as_vec3(),
            radius: s.radius,
            normal: s.normal.normalize_or_zero(),
            quality: s.quality,
        }));
        self.octree.build(&self.local);
        let field = MlsField::new(&self.local, &self.octree);

        if self.config.keep_boundary {
            self.marching
                .generate(&field, size, offset, transform, None, out)
        } else {
            let clip = BoundaryClip {
                limit: self.config.boundary_limit,
                smooth: self.config.smooth,
            };
            let keeps = |q: Vec3| clip.keeps(&field, q);
            self.marching
                .generate(&field, size, offset, transform, Some(&keeps), out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `base_radius` is the unscaled radius in grid units.
    fn disc_splat(position: Vec3, base_radius: f32, smooth: f32) -> Splat {
        Splat {
            position,
            radius: base_radius * smooth,
            normal: Vec3::Z,
            quality: 1.0 / (base_radius * base_radius),
        }
    }

    fn engine(keep_boundary: bool) -> FieldEngine {
        FieldEngine::new(EngineConfig {
            levels: 4,
            subsampling: 1,
            smooth: 4.0,
            keep_boundary,
            boundary_limit: 1.5,
        })
    }

    #[test]
    fn single_splat_reconstructs_a_clipped_disc() {
        // One unit-world-radius splat (grid spacing 0.5), placed off the
        // lattice in z: the MLS zero set is the z = 8.3 plane, clipped to
        // 1.5 world units by the boundary test.
        let mut eng = engine(false);
        let cells = block_cells(4, 1);
        assert_eq!(cells, 15);
        let splats = vec![disc_splat(Vec3::new(8.0, 8.0, 8.3), 2.0, 4.0)];
        let mut meshes = Vec::new();
        eng.process_bin(
            &splats,
            UVec3::ZERO,
            UVec3::splat(cells + 1),
            (0.5, Vec3::new(-4.0, -4.0, -4.15)),
            &mut |m| meshes.push(m),
        );
        assert_eq!(meshes.len(), 1);
        let mesh = &meshes[0];
        assert!(!mesh.triangles.is_empty());
        for v in &mesh.vertices {
            // World space: disc around the origin in the z = 0 plane.
            assert!(v.z.abs() < 0.01, "off-plane vertex {v}");
            assert!(
                v.truncate().length() <= 1.55,
                "vertex outside the boundary limit: {v}"
            );
        }
    }

    #[test]
    fn keep_boundary_extends_to_the_support_edge() {
        let splats = vec![disc_splat(Vec3::new(8.0, 8.0, 8.3), 2.0, 4.0)];
        let run = |keep| {
            let mut eng = engine(keep);
            let mut area = 0usize;
            eng.process_bin(
                &splats,
                UVec3::ZERO,
                UVec3::splat(16),
                (1.0, Vec3::ZERO),
                &mut |m| area += m.triangles.len(),
            );
            area
        };
        let clipped = run(false);
        let kept = run(true);
        assert!(kept > clipped, "clip must remove boundary triangles");
        assert!(clipped > 0);
    }

    #[test]
    fn fragments_satisfy_the_index_contract() {
        let splats = vec![
            disc_splat(Vec3::new(5.0, 8.0, 8.4), 2.0, 4.0),
            disc_splat(Vec3::new(11.0, 8.0, 8.6), 2.0, 4.0),
        ];
        let mut eng = engine(true);
        let mut meshes = Vec::new();
        eng.process_bin(
            &splats,
            UVec3::new(16, 0, 0),
            UVec3::splat(16),
            (1.0, Vec3::ZERO),
            &mut |m| meshes.push(m),
        );
        for mesh in &meshes {
            assert_eq!(mesh.vertex_keys.len(), mesh.num_external());
            for t in &mesh.triangles {
                for &v in t {
                    assert!((v as usize) < mesh.vertices.len());
                }
            }
        }
    }
}
