use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use splatmesh_core::{ChunkId, ExtVec, KeyMesh, Registry};
use splatmesh_ply::{WriterKind, create_writer};
use tracing::info;

use crate::MesherError;
use crate::union_find::{self, ClumpForest};

/// Elements moved per read batch while writing chunks.
const WRITE_BATCH: usize = 1 << 16;

#[derive(Debug, Clone)]
pub struct MesherConfig {
    pub output: PathBuf,
    pub writer: WriterKind,
    /// Minimum fraction of all output vertices for a kept component.
    pub prune_threshold: f64,
    /// Staging budget in bytes before spilling to the disk-backed vectors.
    pub buffer_bytes: usize,
    /// True when output chunking is enabled; selects coordinate-stamped
    /// file names.
    pub chunked: bool,
    /// Header comments for every output chunk.
    pub comments: Vec<String>,
}

/// Descriptor of one clump's slice of the vertex/triangle sequences, either
/// staged (buffer offsets) or flushed (disk-vector offsets).
#[derive(Debug, Clone, Copy)]
struct ClumpDesc {
    first_vertex: u64,
    num_internal: u32,
    num_external: u32,
    first_triangle: u64,
    num_triangles: u32,
    global_id: u32,
}

#[derive(Debug, Default)]
struct Chunk {
    id: ChunkId,
    /// External key -> `!externalIndex` pseudo-label within this chunk.
    vertex_id_map: FxHashMap<u64, u32>,
    num_external: u32,
    clumps: Vec<ClumpDesc>,
    buffered: Vec<ClumpDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub files: u32,
    pub total_components: u64,
    pub kept_components: u64,
    pub kept_vertices: u64,
    pub kept_triangles: u64,
}

/// Single-consumer mesh assembler. Not thread-safe; exactly one mesher
/// thread feeds it fragments and later finalizes it.
pub struct Mesher {
    config: MesherConfig,
    registry: Arc<Registry>,

    clumps: ClumpForest,
    /// Global external key -> clump id (any member, resolved through the
    /// forest when read).
    clump_id_map: FxHashMap<u64, u32>,
    chunks: Vec<Chunk>,

    vertices: ExtVec<[f32; 3]>,
    triangles: ExtVec<[u32; 3]>,
    vertices_buffer: Vec<[f32; 3]>,
    triangles_buffer: Vec<[u32; 3]>,

    // Per-fragment scratch.
    tmp_nodes: Vec<i32>,
    tmp_clump_id: Vec<u32>,
    tmp_order: Vec<u32>,
    tmp_label: Vec<u32>,
}

impl Mesher {
    pub fn new(config: MesherConfig, registry: Arc<Registry>) -> Result<Self, MesherError> {
        Ok(Self {
            config,
            registry,
            clumps: ClumpForest::default(),
            clump_id_map: FxHashMap::default(),
            chunks: Vec::new(),
            vertices: ExtVec::new().map_err(|e| MesherError::io("mesher vertices", e))?,
            triangles: ExtVec::new().map_err(|e| MesherError::io("mesher triangles", e))?,
            vertices_buffer: Vec::new(),
            triangles_buffer: Vec::new(),
            tmp_nodes: Vec::new(),
            tmp_clump_id: Vec::new(),
            tmp_order: Vec::new(),
            tmp_label: Vec::new(),
        })
    }

    /// Fold one fragment into the global state. The final output must not
    /// depend on the order fragments arrive in.
    pub fn add(&mut self, chunk_id: ChunkId, mut mesh: KeyMesh) -> Result<(), MesherError> {
        if chunk_id.r#gen as usize >= self.chunks.len() {
            self.chunks
                .resize_with(chunk_id.r#gen as usize + 1, Chunk::default);
        }
        self.chunks[chunk_id.r#gen as usize].id = chunk_id;

        self.compute_local_components(&mesh);
        self.update_global_clumps(&mesh)?;
        self.update_clump_key_map(&mesh);
        self.update_local_clumps(chunk_id.r#gen as usize, &mut mesh)
    }

    /// Union-find over the fragment's triangles. Two edges per triangle
    /// suffice; the third is redundant.
    fn compute_local_components(&mut self, mesh: &KeyMesh) {
        union_find::node_init(&mut self.tmp_nodes, mesh.vertices.len());
        for t in &mesh.triangles {
            union_find::node_merge(&mut self.tmp_nodes, t[0], t[1]);
            union_find::node_merge(&mut self.tmp_nodes, t[1], t[2]);
        }
    }

    /// Allocate a fresh global clump per local component and count the
    /// fragment's triangles into them.
    fn update_global_clumps(&mut self, mesh: &KeyMesh) -> Result<(), MesherError> {
        let n = mesh.vertices.len();
        self.tmp_clump_id.clear();
        self.tmp_clump_id.resize(n, 0);
        for i in 0..n {
            if self.tmp_nodes[i] < 0 {
                if self.clumps.len() >= u32::MAX as usize {
                    return Err(MesherError::TooManyComponents);
                }
                let size = union_find::node_size(&self.tmp_nodes, i as u32) as u64;
                self.tmp_clump_id[i] = self.clumps.alloc(size);
            }
        }
        for i in 0..n {
            let root = union_find::node_find(&mut self.tmp_nodes, i as u32);
            self.tmp_clump_id[i] = self.tmp_clump_id[root as usize];
        }
        for t in &mesh.triangles {
            let cid = self.tmp_clump_id[t[0] as usize];
            self.clumps.get_mut(cid).triangles += 1;
        }
        Ok(())
    }

    /// Merge clumps that share an external vertex key with earlier
    /// fragments, compensating the double-counted shared vertex.
    fn update_clump_key_map(&mut self, mesh: &KeyMesh) {
        for (i, key) in mesh.vertex_keys.iter().enumerate() {
            let cid = self.tmp_clump_id[mesh.num_internal + i];
            match self.clump_id_map.entry(key.raw()) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(cid);
                }
                std::collections::hash_map::Entry::Occupied(slot) => {
                    let root = self.clumps.merge(cid, *slot.get());
                    self.clumps.get_mut(root).vertices -= 1;
                }
            }
        }
    }

    /// Stage the fragment into its chunk: vertices grouped by clump with
    /// within-chunk external dedup, triangles rewritten to the staged
    /// labels.
    fn update_local_clumps(&mut self, r#gen: usize, mesh: &mut KeyMesh) -> Result<(), MesherError> {
        let n = mesh.vertices.len();
        let num_internal = mesh.num_internal;

        self.tmp_order.clear();
        self.tmp_order.extend(0..n as u32);
        let clump_id = &self.tmp_clump_id;
        // Stable sorts: internal vertices keep their block order within a
        // clump and therefore precede the externals.
        self.tmp_order.sort_by_key(|&v| clump_id[v as usize]);
        mesh.triangles.sort_by_key(|t| clump_id[t[0] as usize]);

        let bytes = (n + self.vertices_buffer.len()) * size_of::<[f32; 3]>()
            + (mesh.triangles.len() + self.triangles_buffer.len()) * size_of::<[u32; 3]>();
        if bytes > self.config.buffer_bytes {
            self.flush_buffer()?;
        }

        self.tmp_label.clear();
        self.tmp_label.resize(n, 0);
        let chunk = &mut self.chunks[r#gen];

        let mut next_vertex = 0usize;
        let mut next_triangle = 0usize;
        while next_vertex < n {
            // One pass per clump.
            let cid = self.tmp_clump_id[self.tmp_order[next_vertex] as usize];
            let clump_start = next_vertex;
            let first_vertex = self.vertices_buffer.len() as u64;
            let first_triangle = self.triangles_buffer.len() as u64;
            let mut clump_internal = 0u32;
            let mut clump_external = 0u32;
            loop {
                let vid = self.tmp_order[next_vertex] as usize;
                let mut elide = false;
                let label;
                if vid >= num_internal {
                    let key = mesh.vertex_keys[vid - num_internal].raw();
                    match chunk.vertex_id_map.entry(key) {
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            label = !chunk.num_external;
                            slot.insert(label);
                            chunk.num_external += 1;
                            clump_external += 1;
                        }
                        std::collections::hash_map::Entry::Occupied(slot) => {
                            label = *slot.get();
                            elide = true;
                        }
                    }
                } else {
                    label = (next_vertex - clump_start) as u32;
                    clump_internal += 1;
                }
                self.tmp_label[vid] = label;
                if !elide {
                    self.vertices_buffer.push(mesh.vertices[vid].to_array());
                }
                next_vertex += 1;
                if next_vertex >= n
                    || self.tmp_clump_id[self.tmp_order[next_vertex] as usize] != cid
                {
                    break;
                }
            }

            while next_triangle < mesh.triangles.len()
                && self.tmp_clump_id[mesh.triangles[next_triangle][0] as usize] == cid
            {
                let t = mesh.triangles[next_triangle];
                self.triangles_buffer.push([
                    self.tmp_label[t[0] as usize],
                    self.tmp_label[t[1] as usize],
                    self.tmp_label[t[2] as usize],
                ]);
                next_triangle += 1;
            }

            chunk.buffered.push(ClumpDesc {
                first_vertex,
                num_internal: clump_internal,
                num_external: clump_external,
                first_triangle,
                num_triangles: (self.triangles_buffer.len() as u64 - first_triangle) as u32,
                global_id: cid,
            });
        }
        Ok(())
    }

    /// Move every staged clump into the disk-backed sequences.
    fn flush_buffer(&mut self) -> Result<(), MesherError> {
        for chunk in &mut self.chunks {
            for desc in chunk.buffered.drain(..) {
                let first_vertex = self.vertices.len();
                let first_triangle = self.triangles.len();
                let nv = (desc.num_internal + desc.num_external) as u64;
                for i in 0..nv {
                    self.vertices
                        .push(self.vertices_buffer[(desc.first_vertex + i) as usize])
                        .map_err(|e| MesherError::io("mesher vertices", e))?;
                }
                for i in 0..desc.num_triangles as u64 {
                    self.triangles
                        .push(self.triangles_buffer[(desc.first_triangle + i) as usize])
                        .map_err(|e| MesherError::io("mesher triangles", e))?;
                }
                chunk.clumps.push(ClumpDesc {
                    first_vertex,
                    first_triangle,
                    ..desc
                });
            }
        }
        self.vertices_buffer.clear();
        self.triangles_buffer.clear();
        Ok(())
    }

    fn chunk_path(&self, id: ChunkId) -> PathBuf {
        if !self.config.chunked {
            return self.config.output.clone();
        }
        let stem = self
            .config
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_owned());
        let name = format!(
            "{stem}_{:04}_{:04}_{:04}.ply",
            id.coords[0], id.coords[1], id.coords[2]
        );
        match self.config.output.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Prune small components and write every non-empty chunk.
    pub fn finalize(&mut self) -> Result<WriteSummary, MesherError> {
        self.flush_buffer()?;
        self.vertices
            .freeze()
            .map_err(|e| MesherError::io("mesher vertices", e))?;
        self.triangles
            .freeze()
            .map_err(|e| MesherError::io("mesher triangles", e))?;

        // Vertices in the whole output, chunk boundaries not double-counted.
        let total_vertices: u64 = self.clumps.roots().map(|c| c.vertices).sum();
        let threshold = (total_vertices as f64 * self.config.prune_threshold) as u64;

        // Resolve keep/drop once per clump id.
        let mut kept = vec![false; self.clumps.len()];
        let mut summary = WriteSummary {
            files: 0,
            total_components: 0,
            kept_components: 0,
            kept_vertices: 0,
            kept_triangles: 0,
        };
        for id in 0..self.clumps.len() as u32 {
            if self.clumps.is_root(id) {
                let clump = *self.clumps.get(id);
                summary.total_components += 1;
                if clump.vertices >= threshold {
                    summary.kept_components += 1;
                    summary.kept_vertices += clump.vertices;
                    summary.kept_triangles += clump.triangles;
                }
            }
        }
        for id in 0..self.clumps.len() as u32 {
            let root = self.clumps.find(id);
            kept[id as usize] = self.clumps.get(root).vertices >= threshold;
        }

        let registry = &self.registry;
        registry.add("components.vertices.total", total_vertices as f64);
        registry.add("components.vertices.threshold", threshold as f64);
        registry.add("components.vertices.kept", summary.kept_vertices as f64);
        registry.add("components.triangles.kept", summary.kept_triangles as f64);
        registry.add("components.total", summary.total_components as f64);
        registry.add("components.kept", summary.kept_components as f64);
        registry.add("externalvertices", self.clump_id_map.len() as f64);

        let mut vertex_reader = self
            .vertices
            .reader()
            .map_err(|e| MesherError::io("mesher vertices", e))?;
        let mut triangle_reader = self
            .triangles
            .reader()
            .map_err(|e| MesherError::io("mesher triangles", e))?;

        let mut start_vertex: Vec<u32> = Vec::new();
        let mut external_remap: Vec<u32> = Vec::new();
        let mut batch_v = vec![[0f32; 3]; WRITE_BATCH];
        let mut batch_t = vec![[0u32; 3]; WRITE_BATCH];

        for chunk in &self.chunks {
            if chunk.clumps.is_empty() {
                continue;
            }
            let mut chunk_vertices = 0u64;
            let mut chunk_triangles = 0u64;
            for desc in &chunk.clumps {
                if kept[desc.global_id as usize] {
                    chunk_vertices += (desc.num_internal + desc.num_external) as u64;
                    chunk_triangles += desc.num_triangles as u64;
                }
            }
            let path = self.chunk_path(chunk.id);
            if chunk_vertices >= u32::MAX as u64 {
                return Err(MesherError::Overflow { path });
            }
            if chunk_triangles == 0 {
                continue;
            }

            let mut writer = create_writer(
                self.config.writer,
                &path,
                chunk_vertices,
                chunk_triangles,
                &self.config.comments,
            )?;

            // Vertex pass, building the external remap as we go.
            start_vertex.clear();
            external_remap.clear();
            let mut written = 0u32;
            for desc in &chunk.clumps {
                start_vertex.push(written);
                if !kept[desc.global_id as usize] {
                    external_remap.extend(
                        std::iter::repeat_n(u32::MAX, desc.num_external as usize),
                    );
                    continue;
                }
                let nv = (desc.num_internal + desc.num_external) as u64;
                let mut offset = 0u64;
                while offset < nv {
                    let count = ((nv - offset) as usize).min(WRITE_BATCH);
                    vertex_reader
                        .read_range(desc.first_vertex + offset, &mut batch_v[..count])
                        .map_err(|e| MesherError::io("mesher vertices", e))?;
                    writer.append_vertices(&batch_v[..count])?;
                    offset += count as u64;
                }
                for k in 0..desc.num_external {
                    external_remap.push(written + desc.num_internal + k);
                }
                written += desc.num_internal + desc.num_external;
            }

            // Triangle pass, translating staged labels to final indices.
            for (j, desc) in chunk.clumps.iter().enumerate() {
                if !kept[desc.global_id as usize] {
                    continue;
                }
                let nt = desc.num_triangles as u64;
                let mut offset = 0u64;
                while offset < nt {
                    let count = ((nt - offset) as usize).min(WRITE_BATCH);
                    triangle_reader
                        .read_range(desc.first_triangle + offset, &mut batch_t[..count])
                        .map_err(|e| MesherError::io("mesher triangles", e))?;
                    for t in &mut batch_t[..count] {
                        for v in t.iter_mut() {
                            let flipped = !*v;
                            if (flipped as usize) < external_remap.len() {
                                *v = external_remap[flipped as usize];
                                debug_assert_ne!(*v, u32::MAX, "triangle into a pruned clump");
                            } else {
                                *v += start_vertex[j];
                            }
                        }
                    }
                    writer.append_triangles(&batch_t[..count])?;
                    offset += count as u64;
                }
            }

            writer.finish()?;
            summary.files += 1;
            registry.incr("output.files");
            info!(
                path = %path.display(),
                vertices = chunk_vertices,
                triangles = chunk_triangles,
                "wrote chunk"
            );
        }

        Ok(summary)
    }

    #[cfg(test)]
    pub(crate) fn clump_forest(&self) -> &ClumpForest {
        &self.clumps
    }

    #[cfg(test)]
    pub(crate) fn unique_external_keys(&self) -> usize {
        self.clump_id_map.len()
    }
}
