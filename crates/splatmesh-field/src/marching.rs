//! Slab-by-slab marching-tetrahedra extraction.
//!
//! The field is sampled one z-slice at a time into two alternating slice
//! buffers; each slab of cells between consecutive slices is classified
//! against the case tables and contributes unwelded vertices and indices to
//! the per-block buffers. When a slab would overflow those buffers the block
//! ships what it has as a partial fragment ("ship-out") and continues with
//! the slab's low plane as the new fragment floor.
//!
//! Every fragment is welded before emission: vertices sort by
//! (external, key), key-duplicates collapse, and indices are rewritten, so
//! downstream stitching only ever matches external keys across fragments.

use glam::{UVec3, Vec3};
use splatmesh_core::{KeyMesh, VertexKey};

use crate::mls::ScalarField;
use crate::tables::{EDGE_INDICES, TABLES, edge_doubled_offset};

/// Sampling tile alignment on x/y, mirroring the device kernels' work-group
/// shape; slice rows are padded to this stride.
pub const EVAL_ALIGN: usize = 16;

struct Unwelded {
    /// Doubled midpoint of the supporting edge, local to the bin.
    doubled: UVec3,
    /// Bin-local position.
    pos: Vec3,
}

pub struct MarchingEngine {
    max_width: usize,
    max_height: usize,
    stride: usize,
    slices: [Vec<f32>; 2],
    masks: Vec<u8>,
    vertex_budget: usize,
    index_budget: usize,
    unwelded: Vec<Unwelded>,
    indices: Vec<u32>,
}

impl MarchingEngine {
    /// `max_width`/`max_height` are the largest slice dimensions in
    /// vertices. The default buffers hold one worst-case slab, as on the
    /// device; fuller blocks trigger ship-outs.
    pub fn new(max_width: usize, max_height: usize) -> Self {
        let slab_cells = (max_width - 1) * (max_height - 1);
        Self::with_budgets(
            max_width,
            max_height,
            slab_cells * TABLES.max_cell_vertices,
            slab_cells * TABLES.max_cell_indices,
        )
    }

    /// Explicit buffer budgets; a single slab may still exceed them, the
    /// budgets only decide when accumulated slabs ship out.
    pub fn with_budgets(
        max_width: usize,
        max_height: usize,
        vertex_budget: usize,
        index_budget: usize,
    ) -> Self {
        let stride = (max_width).div_ceil(EVAL_ALIGN) * EVAL_ALIGN;
        let slice_len = stride * max_height;
        Self {
            max_width,
            max_height,
            stride,
            slices: [vec![0.0; slice_len], vec![0.0; slice_len]],
            masks: vec![0; (max_width - 1) * (max_height - 1)],
            vertex_budget,
            index_budget,
            unwelded: Vec::new(),
            indices: Vec::new(),
        }
    }

    /// Extract the isosurface of `field` over a `size.x × size.y × size.z`
    /// vertex lattice. `key_offset` is the bin's low corner relative to the
    /// bounding grid's low corner, in cells; `transform` is the scale/bias
    /// taking bin-local coordinates to world space. Returns the number of
    /// ship-outs that were needed beyond the final fragment.
    pub fn generate<F, O>(
        &mut self,
        field: &F,
        size: UVec3,
        key_offset: UVec3,
        transform: (f32, Vec3),
        clip: Option<&dyn Fn(Vec3) -> bool>,
        out: &mut O,
    ) -> u64
    where
        F: ScalarField,
        O: FnMut(KeyMesh),
    {
        let (w, h, d) = (size.x as usize, size.y as usize, size.z as usize);
        assert!(w >= 2 && h >= 2 && d >= 2, "degenerate bin {size:?}");
        assert!(w <= self.max_width && h <= self.max_height);

        self.unwelded.clear();
        self.indices.clear();
        let mut frag_lo = 0usize;
        let mut ship_outs = 0u64;

        self.eval_slice(field, 0, w, h);
        for z in 1..d {
            self.slices.swap(0, 1);
            self.eval_slice(field, z, w, h);

            // First pass: classify cells and count this slab's demand.
            let mut need_vertices = 0;
            let mut need_indices = 0;
            for y in 0..h - 1 {
                for x in 0..w - 1 {
                    let mut mask = 0u8;
                    for v in 0..8u8 {
                        let fx = x + (v & 1) as usize;
                        let fy = y + ((v >> 1) & 1) as usize;
                        let slice = &self.slices[((v >> 2) & 1) as usize];
                        if slice[fy * self.stride + fx] >= 0.0 {
                            mask |= 1 << v;
                        }
                    }
                    self.masks[y * (w - 1) + x] = mask;
                    let (vertices, indices) = TABLES.cell(mask);
                    need_vertices += vertices.len();
                    need_indices += indices.len();
                }
            }
            if need_indices == 0 {
                continue;
            }

            if !self.indices.is_empty()
                && (self.unwelded.len() + need_vertices > self.vertex_budget
                    || self.indices.len() + need_indices > self.index_budget)
            {
                // Too much in flight to absorb this slab; ship what we have
                // with the slab's low plane as the shared boundary.
                self.ship_out(w, h, key_offset, frag_lo, z - 1, transform, clip, out);
                ship_outs += 1;
                frag_lo = z - 1;
            }

            // Second pass: emit the slab's vertices and triangles.
            for y in 0..h - 1 {
                for x in 0..w - 1 {
                    let mask = self.masks[y * (w - 1) + x];
                    let (edges, tri_indices) = TABLES.cell(mask);
                    if tri_indices.is_empty() {
                        continue;
                    }
                    let base = self.unwelded.len() as u32;
                    for &edge in edges {
                        let vertex = self.edge_vertex(x, y, z - 1, edge);
                        self.unwelded.push(vertex);
                    }
                    for &i in tri_indices {
                        self.indices.push(base + i as u32);
                    }
                }
            }
        }

        self.ship_out(w, h, key_offset, frag_lo, d - 1, transform, clip, out);
        ship_outs
    }

    fn eval_slice<F: ScalarField>(&mut self, field: &F, z: usize, w: usize, h: usize) {
        use rayon::prelude::*;
        let stride = self.stride;
        self.slices[1][..h * stride]
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, slot) in row.iter_mut().enumerate().take(w) {
                    *slot = field.eval(Vec3::new(x as f32, y as f32, z as f32));
                }
            });
    }

    /// Place the iso-vertex on `edge` of the cell at `(x, y, z)`.
    fn edge_vertex(&self, x: usize, y: usize, z: usize, edge: u8) -> Unwelded {
        let corner = |v: u8| -> (UVec3, f32) {
            let cx = x + (v & 1) as usize;
            let cy = y + ((v >> 1) & 1) as usize;
            let slice = &self.slices[((v >> 2) & 1) as usize];
            let f = slice[cy * self.stride + cx];
            (
                UVec3::new(cx as u32, cy as u32, (z + ((v >> 2) & 1) as usize) as u32),
                f,
            )
        };
        let [a, b] = EDGE_INDICES[edge as usize];
        let (pa, fa) = corner(a);
        let (pb, fb) = corner(b);
        debug_assert!((fa < 0.0) != (fb < 0.0), "edge without a crossing");

        let ((pi, fi), (po, fo)) = if fa < 0.0 {
            ((pa, fa), (pb, fb))
        } else {
            ((pb, fb), (pa, fa))
        };
        // fi < 0 <= fo, so t lands in (0, 1]; t == 1 pins the crossing onto
        // the outside lattice vertex. The key stays the edge's own, keeping
        // coincident crossings from different edges distinct.
        let t = fi / (fi - fo);
        let pos = if t >= 1.0 {
            po.as_vec3()
        } else {
            pi.as_vec3() + t * (po.as_vec3() - pi.as_vec3())
        };
        let off = edge_doubled_offset(edge);
        Unwelded {
            doubled: UVec3::new(
                2 * x as u32 + off[0],
                2 * y as u32 + off[1],
                2 * z as u32 + off[2],
            ),
            pos,
        }
    }

    /// Weld, classify, clip and emit the accumulated fragment, then reset
    /// the buffers for the continuation.
    #[allow(clippy::too_many_arguments)]
    fn ship_out<O: FnMut(KeyMesh)>(
        &mut self,
        w: usize,
        h: usize,
        key_offset: UVec3,
        frag_lo: usize,
        hi_plane: usize,
        (scale, bias): (f32, Vec3),
        clip: Option<&dyn Fn(Vec3) -> bool>,
        out: &mut O,
    ) {
        if self.indices.is_empty() {
            self.unwelded.clear();
            return;
        }

        let wall_x = 2 * (w as u32 - 1);
        let wall_y = 2 * (h as u32 - 1);
        let floor_z = 2 * frag_lo as u32;
        let roof_z = 2 * hi_plane as u32;

        // Global key plus external classification per unwelded vertex. A
        // vertex is external when its edge lies in a fragment wall: shared
        // either with a neighbouring bin or with the successor fragment.
        let keyed: Vec<(bool, VertexKey)> = self
            .unwelded
            .iter()
            .map(|v| {
                let d = v.doubled;
                let external = d.x == 0
                    || d.x == wall_x
                    || d.y == 0
                    || d.y == wall_y
                    || d.z == floor_z
                    || d.z == roof_z;
                (external, VertexKey::edge_midpoint(d + key_offset * 2))
            })
            .collect();

        let mut order: Vec<u32> = (0..self.unwelded.len() as u32).collect();
        order.sort_unstable_by_key(|&i| (keyed[i as usize].0, keyed[i as usize].1, i));

        // Weld by key; internals come first by the sort above.
        let mut remap = vec![0u32; self.unwelded.len()];
        let mut welded: Vec<(Vec3, VertexKey, bool)> = Vec::new();
        let mut last_key = None;
        for &i in &order {
            let (external, key) = keyed[i as usize];
            if last_key != Some(key) {
                welded.push((self.unwelded[i as usize].pos, key, external));
                last_key = Some(key);
            }
            remap[i as usize] = welded.len() as u32 - 1;
        }

        // Triangle corners are three distinct edges of one tetrahedron, so
        // welding by key never collapses a triangle.
        let mut triangles: Vec<[u32; 3]> = self
            .indices
            .chunks_exact(3)
            .map(|t| [remap[t[0] as usize], remap[t[1] as usize], remap[t[2] as usize]])
            .collect();

        if let Some(clip) = clip {
            let keep: Vec<bool> = welded.iter().map(|&(pos, _, _)| clip(pos)).collect();
            triangles.retain(|t| t.iter().all(|&v| keep[v as usize]));
        }

        self.unwelded.clear();
        self.indices.clear();
        if triangles.is_empty() {
            return;
        }

        // Compact away vertices the clip (or degeneracy cull) orphaned,
        // preserving the internal-first order.
        let mut used = vec![false; welded.len()];
        for t in &triangles {
            for &v in t {
                used[v as usize] = true;
            }
        }
        let mut compact = vec![u32::MAX; welded.len()];
        let mut vertices = Vec::new();
        let mut vertex_keys = Vec::new();
        let mut num_internal = 0;
        for (i, &(pos, key, external)) in welded.iter().enumerate() {
            if !used[i] {
                continue;
            }
            compact[i] = vertices.len() as u32;
            vertices.push(pos * scale + bias);
            if external {
                vertex_keys.push(key);
            } else {
                num_internal += 1;
            }
        }
        for t in &mut triangles {
            for v in t {
                *v = compact[*v as usize];
            }
        }

        out(KeyMesh {
            vertices,
            vertex_keys,
            triangles,
            num_internal,
        });
    }
}
