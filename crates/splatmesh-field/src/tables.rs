//! Marching-tetrahedra case tables.
//!
//! Each sampling cube is subdivided into six tetrahedra around the 0–7 main
//! diagonal; that subdivision is face-consistent between neighbouring cubes,
//! which is what makes block seams weldable by vertex key alone. The tables
//! are generated once at startup by canonicalising every tetrahedron
//! configuration through a parity-respecting walk over the 24 vertex
//! permutations, and are bit-identical across runs.

use std::sync::LazyLock;

pub const NUM_CUBES: usize = 256;
pub const NUM_EDGES: usize = 19;
pub const NUM_TETRAHEDRA: usize = 6;

/// Cube corner pairs of every edge used by the subdivision. Corner `v` sits
/// at `((v & 1), (v >> 1) & 1, (v >> 2) & 1)` within the cell.
pub const EDGE_INDICES: [[u8; 2]; NUM_EDGES] = [
    [0, 1],
    [0, 2],
    [0, 3],
    [1, 3],
    [2, 3],
    [0, 4],
    [0, 5],
    [1, 5],
    [4, 5],
    [0, 6],
    [2, 6],
    [4, 6],
    [0, 7],
    [1, 7],
    [2, 7],
    [3, 7],
    [4, 7],
    [5, 7],
    [6, 7],
];

/// The six tetrahedra around the 0–7 diagonal.
pub const TETRAHEDRON_INDICES: [[u8; 4]; NUM_TETRAHEDRA] = [
    [0, 7, 1, 3],
    [0, 7, 3, 2],
    [0, 7, 2, 6],
    [0, 7, 6, 4],
    [0, 7, 4, 5],
    [0, 7, 5, 1],
];

/// Doubled offset of an edge's midpoint within its cell, per axis (0..=2).
pub fn edge_doubled_offset(edge: u8) -> [u32; 3] {
    let [a, b] = EDGE_INDICES[edge as usize];
    [0, 1, 2].map(|axis| (((a >> axis) & 1) + ((b >> axis) & 1)) as u32)
}

pub struct Tables {
    vertex_start: [u16; NUM_CUBES + 1],
    index_start: [u16; NUM_CUBES + 1],
    /// Concatenated per-mask lists of used edge ids.
    vertices: Vec<u8>,
    /// Concatenated per-mask triangle corner lists, as indices into the
    /// mask's edge list.
    indices: Vec<u8>,
    pub max_cell_vertices: usize,
    pub max_cell_indices: usize,
}

impl Tables {
    /// Edges carrying a vertex, and triangle corners, for one sign mask
    /// (bit set = corner outside).
    pub fn cell(&self, mask: u8) -> (&[u8], &[u8]) {
        let m = mask as usize;
        (
            &self.vertices[self.vertex_start[m] as usize..self.vertex_start[m + 1] as usize],
            &self.indices[self.index_start[m] as usize..self.index_start[m + 1] as usize],
        )
    }
}

pub static TABLES: LazyLock<Tables> = LazyLock::new(make_tables);

fn find_edge(mut v0: u8, mut v1: u8) -> u8 {
    if v0 > v1 {
        std::mem::swap(&mut v0, &mut v1);
    }
    EDGE_INDICES
        .iter()
        .position(|&[a, b]| a == v0 && b == v1)
        .expect("tetrahedron edge missing from edge table") as u8
}

fn permutation_parity(items: &[(u8, bool)]) -> u32 {
    let mut parity = 0;
    for i in 0..items.len() {
        for j in i + 1..items.len() {
            if items[i] > items[j] {
                parity ^= 1;
            }
        }
    }
    parity
}

fn next_permutation(items: &mut [(u8, bool)]) -> bool {
    let n = items.len();
    if n < 2 {
        return false;
    }
    let Some(i) = (0..n - 1).rev().find(|&i| items[i] < items[i + 1]) else {
        return false;
    };
    let j = (i + 1..n).rev().find(|&j| items[j] > items[i]).expect("exists");
    items.swap(i, j);
    items[i + 1..].reverse();
    true
}

fn make_tables() -> Tables {
    let mut vertex_start = [0u16; NUM_CUBES + 1];
    let mut index_start = [0u16; NUM_CUBES + 1];
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let mut max_cell_vertices = 0;
    let mut max_cell_indices = 0;

    for mask in 0..NUM_CUBES {
        vertex_start[mask] = vertices.len() as u16;
        index_start[mask] = indices.len() as u16;

        // Triangle corners recorded as edge ids, compacted below.
        let mut triangles: Vec<u8> = Vec::new();
        for tet in &TETRAHEDRON_INDICES {
            let mut tvtxs: [(u8, bool); 4] = [(0, false); 4];
            let mut outside = 0;
            for (k, &v) in tet.iter().enumerate() {
                let o = mask & (1 << v) != 0;
                outside += o as u32;
                tvtxs[k] = (v, o);
            }
            let mut base_parity = permutation_parity(&tvtxs);

            // Flipping inside/outside keeps outside <= 2 but reverses the
            // winding, hence the parity flip.
            if outside > 2 {
                base_parity ^= 1;
                for t in &mut tvtxs {
                    t.1 = !t.1;
                }
            }

            // Rotate (never reflect) the tetrahedron onto one of the
            // canonical configurations: all inside, v0 outside, or (v0, v1)
            // outside.
            tvtxs.sort_unstable();
            loop {
                if permutation_parity(&tvtxs) == base_parity {
                    let [t0, t1, t2, t3] = tvtxs.map(|t| t.0);
                    let mut tet_mask = 0u32;
                    for (k, t) in tvtxs.iter().enumerate() {
                        tet_mask |= (t.1 as u32) << k;
                    }
                    if tet_mask == 0 {
                        break;
                    } else if tet_mask == 1 {
                        triangles.push(find_edge(t0, t1));
                        triangles.push(find_edge(t0, t3));
                        triangles.push(find_edge(t0, t2));
                        break;
                    } else if tet_mask == 3 {
                        triangles.push(find_edge(t0, t2));
                        triangles.push(find_edge(t1, t2));
                        triangles.push(find_edge(t1, t3));

                        triangles.push(find_edge(t1, t3));
                        triangles.push(find_edge(t0, t3));
                        triangles.push(find_edge(t0, t2));
                        break;
                    }
                }
                if !next_permutation(&mut tvtxs) {
                    break;
                }
            }
        }

        // Assign compact per-mask vertex slots to the edges in use.
        let mut edge_compact = [u8::MAX; NUM_EDGES];
        let mut pool = 0u8;
        for edge in 0..NUM_EDGES as u8 {
            if triangles.contains(&edge) {
                edge_compact[edge as usize] = pool;
                pool += 1;
                vertices.push(edge);
            }
        }
        for &edge in &triangles {
            indices.push(edge_compact[edge as usize]);
        }

        max_cell_vertices = max_cell_vertices.max(pool as usize);
        max_cell_indices = max_cell_indices.max(triangles.len());
    }

    vertex_start[NUM_CUBES] = vertices.len() as u16;
    index_start[NUM_CUBES] = indices.len() as u16;

    Tables {
        vertex_start,
        index_start,
        vertices,
        indices,
        max_cell_vertices,
        max_cell_indices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_full_masks_emit_nothing() {
        for mask in [0u8, 255] {
            let (vertices, indices) = TABLES.cell(mask);
            assert!(vertices.is_empty());
            assert!(indices.is_empty());
        }
    }

    #[test]
    fn single_outside_corner_cuts_every_incident_tetrahedron() {
        // Corner 0 is shared by all six tetrahedra.
        let (vertices, indices) = TABLES.cell(1);
        assert_eq!(indices.len(), 6 * 3);
        // All cut edges are incident to corner 0.
        for &edge in vertices {
            assert!(EDGE_INDICES[edge as usize].contains(&0));
        }
    }

    #[test]
    fn indices_are_valid_and_triangular() {
        for mask in 0..=255u8 {
            let (vertices, indices) = TABLES.cell(mask);
            assert_eq!(indices.len() % 3, 0);
            for &i in indices {
                assert!((i as usize) < vertices.len());
            }
            // Edge list is strictly ascending (compaction order).
            assert!(vertices.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn complementary_masks_use_the_same_edges() {
        for mask in 0..=255u8 {
            let (v_a, i_a) = TABLES.cell(mask);
            let (v_b, i_b) = TABLES.cell(!mask);
            assert_eq!(v_a, v_b, "mask {mask}");
            assert_eq!(i_a.len(), i_b.len(), "mask {mask}");
        }
    }

    #[test]
    fn every_cut_edge_crosses_the_surface() {
        // An edge carries a vertex only if its corners straddle the mask.
        for mask in 0..=255u8 {
            let (vertices, _) = TABLES.cell(mask);
            for &edge in vertices {
                let [a, b] = EDGE_INDICES[edge as usize];
                let oa = mask & (1 << a) != 0;
                let ob = mask & (1 << b) != 0;
                assert_ne!(oa, ob, "mask {mask} edge {edge}");
            }
        }
    }

    #[test]
    fn generation_is_bit_stable() {
        let again = make_tables();
        assert_eq!(again.vertices, TABLES.vertices);
        assert_eq!(again.indices, TABLES.indices);
        assert_eq!(again.vertex_start, TABLES.vertex_start);
        assert_eq!(again.index_start, TABLES.index_start);
    }

    #[test]
    fn budgets_are_modest() {
        assert!(TABLES.max_cell_vertices <= NUM_EDGES);
        assert!(TABLES.max_cell_indices <= NUM_TETRAHEDRA * 6);
        assert!(TABLES.max_cell_vertices > 0);
    }

    #[test]
    fn doubled_offsets_match_edge_geometry() {
        assert_eq!(edge_doubled_offset(0), [1, 0, 0]); // 0-1
        assert_eq!(edge_doubled_offset(12), [1, 1, 1]); // 0-7 diagonal
        assert_eq!(edge_doubled_offset(3), [2, 1, 0]); // 1-3
    }
}
