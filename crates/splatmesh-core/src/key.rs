//! Global identification of isosurface vertices.
//!
//! Every extracted vertex lies on an edge of the tetrahedral subdivision of
//! the output lattice. Its key packs the edge midpoint, in *doubled* lattice
//! coordinates relative to the low corner of the bounding grid, into 64 bits:
//!
//! ```text
//! bit 63..43   42..22   21..1   0
//!     w        v        u       odd
//! ```
//!
//! Raw integer order is therefore lexicographic in `(w, v, u, odd)`, and key
//! equality across neighbouring blocks is exactly "same global edge". The
//! `odd` bit is 1 for edge-midpoint keys; lattice vertices themselves are
//! addressable with `odd = 0`, which keeps an edge whose crossing happens to
//! coincide with a grid vertex distinct from that vertex (and from every
//! other edge pinned there).

use glam::UVec3;

/// Bits per axis in a packed key.
pub const KEY_AXIS_BITS: u32 = 21;

/// Exclusive upper bound of a doubled coordinate (2²¹, i.e. 2²⁰ grid cells).
pub const KEY_AXIS_LIMIT: u32 = 1 << KEY_AXIS_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexKey(u64);

impl VertexKey {
    /// Key for an ordinary vertex on the edge with the given doubled midpoint.
    #[inline]
    pub fn edge_midpoint(doubled: UVec3) -> Self {
        Self(pack(doubled, true))
    }

    /// Key addressing a lattice vertex itself (`doubled` therefore has all
    /// components even).
    #[inline]
    pub fn lattice_vertex(doubled: UVec3) -> Self {
        Self(pack(doubled, false))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn decode(self) -> (UVec3, bool) {
        let mask = (KEY_AXIS_LIMIT - 1) as u64;
        let u = (self.0 >> 1) & mask;
        let v = (self.0 >> (1 + KEY_AXIS_BITS)) & mask;
        let w = (self.0 >> (1 + 2 * KEY_AXIS_BITS)) & mask;
        (UVec3::new(u as u32, v as u32, w as u32), self.0 & 1 == 1)
    }
}

#[inline]
fn pack(doubled: UVec3, odd: bool) -> u64 {
    debug_assert!(
        doubled.x < KEY_AXIS_LIMIT && doubled.y < KEY_AXIS_LIMIT && doubled.z < KEY_AXIS_LIMIT,
        "doubled coordinate out of key range: {doubled:?}"
    );
    ((doubled.z as u64) << (1 + 2 * KEY_AXIS_BITS))
        | ((doubled.y as u64) << (1 + KEY_AXIS_BITS))
        | ((doubled.x as u64) << 1)
        | (odd as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn roundtrip_random() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..10_000 {
            let p = UVec3::new(
                rng.gen_range(0..KEY_AXIS_LIMIT),
                rng.gen_range(0..KEY_AXIS_LIMIT),
                rng.gen_range(0..KEY_AXIS_LIMIT),
            );
            let odd = rng.gen_bool(0.5);
            let key = if odd {
                VertexKey::edge_midpoint(p)
            } else {
                VertexKey::lattice_vertex(p)
            };
            assert_eq!(key.decode(), (p, odd));
        }
    }

    #[test]
    fn roundtrip_extremes() {
        let m = KEY_AXIS_LIMIT - 1;
        for p in [UVec3::ZERO, UVec3::new(m, m, m), UVec3::new(m, 0, m)] {
            assert_eq!(VertexKey::edge_midpoint(p).decode(), (p, true));
            assert_eq!(VertexKey::lattice_vertex(p).decode(), (p, false));
        }
    }

    #[test]
    fn sorts_lexicographically_zyx_odd() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut keys: Vec<VertexKey> = (0..2_000)
            .map(|_| {
                let p = UVec3::new(
                    rng.gen_range(0..KEY_AXIS_LIMIT),
                    rng.gen_range(0..KEY_AXIS_LIMIT),
                    rng.gen_range(0..KEY_AXIS_LIMIT),
                );
                if rng.gen_bool(0.5) {
                    VertexKey::edge_midpoint(p)
                } else {
                    VertexKey::lattice_vertex(p)
                }
            })
            .collect();
        keys.sort();
        for pair in keys.windows(2) {
            let (a, a_odd) = pair[0].decode();
            let (b, b_odd) = pair[1].decode();
            let lex_a = (a.z, a.y, a.x, a_odd);
            let lex_b = (b.z, b.y, b.x, b_odd);
            assert!(lex_a <= lex_b);
        }
    }

    #[test]
    fn midpoint_and_vertex_keys_differ() {
        let p = UVec3::new(4, 6, 8);
        assert_ne!(VertexKey::edge_midpoint(p), VertexKey::lattice_vertex(p));
    }
}
