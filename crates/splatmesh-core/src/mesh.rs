use glam::Vec3;

use crate::key::VertexKey;

/// One mesh fragment emitted by the isosurface stage.
///
/// Vertices are ordered interior-first: the first `num_internal` are unique
/// within their block; the rest are external, shared potentially with
/// neighbouring blocks, and carry one entry each in `vertex_keys`. Within a
/// fragment all key-equal vertices have already been welded.
#[derive(Debug, Clone, Default)]
pub struct KeyMesh {
    pub vertices: Vec<Vec3>,
    /// Keys of the external vertices, parallel to `vertices[num_internal..]`.
    pub vertex_keys: Vec<VertexKey>,
    pub triangles: Vec<[u32; 3]>,
    pub num_internal: usize,
}

impl KeyMesh {
    pub fn num_external(&self) -> usize {
        self.vertices.len() - self.num_internal
    }

    /// Approximate size used for byte-budgeted queueing.
    pub fn host_bytes(&self) -> usize {
        self.vertices.len() * size_of::<Vec3>()
            + self.vertex_keys.len() * size_of::<VertexKey>()
            + self.triangles.len() * size_of::<[u32; 3]>()
    }
}
