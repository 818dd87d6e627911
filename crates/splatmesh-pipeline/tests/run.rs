//! End-to-end pipeline runs on small synthetic scans.
//!
//! The advanced options are scaled down (levels 4, subsampling 1: 15-cell
//! bins) so whole runs finish in milliseconds; the pipeline code paths are
//! identical to production sizes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use splatmesh_core::Registry;
use splatmesh_pipeline::{
    NoProgress, ReconstructParams,
    config::{AdvancedConfig, FitConfig, MesherKind},
    run,
};
use splatmesh_ply::{WriterKind, read_triangle_mesh};
use std::io::Write;

fn write_ply(path: &Path, records: &[[f32; 7]]) {
    let mut bytes = Vec::new();
    write!(
        bytes,
        "ply\nformat binary_little_endian 1.0\nelement vertex {}\n\
         property float x\nproperty float y\nproperty float z\n\
         property float nx\nproperty float ny\nproperty float nz\n\
         property float radius\nend_header\n",
        records.len()
    )
    .unwrap();
    for record in records {
        for &v in record {
            bytes.write_f32::<LittleEndian>(v).unwrap();
        }
    }
    std::fs::write(path, bytes).unwrap();
}

fn params(inputs: Vec<PathBuf>, output: PathBuf, spacing: f32) -> ReconstructParams {
    ReconstructParams {
        fit: FitConfig {
            smooth: 4.0,
            spacing,
            prune: 0.02,
            keep_boundary: false,
            boundary_limit: 1.5,
        },
        advanced: AdvancedConfig {
            levels: 4,
            subsampling: 1,
            max_device_splats: 1_000_000,
            max_host_splats: 50_000_000,
            max_split: 2_097_152,
            bucket_threads: 2,
            device_threads: 2,
            mesher: MesherKind::Stxxl,
            writer: WriterKind::Stream,
            chunk_cells: 0,
            mesher_buffer: 32 << 20,
            mesher_queue: 64 << 20,
        },
        inputs,
        output,
        comments: vec!["splatmesh test".to_owned()],
    }
}

fn run_params(params: &ReconstructParams) -> (splatmesh_mesher::WriteSummary, Arc<Registry>) {
    let registry = Arc::new(Registry::new());
    let summary = run(params, Arc::clone(&registry), Arc::new(NoProgress)).unwrap();
    (summary, registry)
}

/// E1: a single oriented splat reconstructs to one clipped disc.
#[test]
fn single_splat_yields_one_clipped_patch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    let output = dir.path().join("out.ply");
    write_ply(&input, &[[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]]);

    let (summary, _) = run_params(&params(vec![input], output.clone(), 0.5));
    assert_eq!(summary.files, 1);
    assert_eq!(summary.kept_components, 1);
    assert_eq!(summary.total_components, 1);

    let (vertices, triangles, comments) = read_triangle_mesh(&output).unwrap();
    assert!(!triangles.is_empty());
    assert_eq!(summary.kept_triangles, triangles.len() as u64);
    assert!(comments.contains(&"splatmesh test".to_owned()));
    for v in &vertices {
        for c in v {
            assert!(c.abs() <= 1.51, "vertex outside [-1.5, 1.5]^3: {v:?}");
        }
    }
}

/// E2: eight oriented splats at the corners of a unit cube produce one
/// component spanning the cube, and the file survives a byte-exact
/// write-back round trip.
#[test]
fn cube_corners_reconstruct_one_component() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    let output = dir.path().join("out.ply");

    let inv = 1.0 / 3.0f32.sqrt();
    let mut records = Vec::new();
    for corner in 0..8u32 {
        let p = [
            (corner & 1) as f32,
            ((corner >> 1) & 1) as f32,
            ((corner >> 2) & 1) as f32,
        ];
        // Outward-facing normals.
        let n = [
            (p[0] * 2.0 - 1.0) * inv,
            (p[1] * 2.0 - 1.0) * inv,
            (p[2] * 2.0 - 1.0) * inv,
        ];
        records.push([p[0], p[1], p[2], n[0], n[1], n[2], 0.6]);
    }
    write_ply(&input, &records);

    let (summary, _) = run_params(&params(vec![input], output.clone(), 0.25));
    assert_eq!(summary.files, 1);
    assert_eq!(summary.kept_components, 1);

    let (vertices, triangles, comments) = read_triangle_mesh(&output).unwrap();
    assert!(triangles.len() >= 12);
    assert_eq!(vertices.len() as u64, summary.kept_vertices);
    assert_eq!(triangles.len() as u64, summary.kept_triangles);

    // The surface spans the whole cube.
    for axis in 0..3 {
        let lo = vertices.iter().map(|v| v[axis]).fold(f32::MAX, f32::min);
        let hi = vertices.iter().map(|v| v[axis]).fold(f32::MIN, f32::max);
        assert!(lo < 0.3 && hi > 0.7, "axis {axis} range [{lo}, {hi}]");
    }

    // Byte-exact round trip through the writer.
    let rewritten = dir.path().join("rewritten.ply");
    let mut writer = splatmesh_ply::create_writer(
        WriterKind::Stream,
        &rewritten,
        vertices.len() as u64,
        triangles.len() as u64,
        &comments,
    )
    .unwrap();
    writer.append_vertices(&vertices).unwrap();
    writer.append_triangles(&triangles).unwrap();
    writer.finish().unwrap();
    assert_eq!(
        std::fs::read(&output).unwrap(),
        std::fs::read(&rewritten).unwrap()
    );
}

/// E3: one non-finite record among a thousand is counted and has no effect
/// on the output.
#[test]
fn nan_splat_is_skipped_and_counted() {
    let dir = tempfile::tempdir().unwrap();

    let mut records: Vec<[f32; 7]> = Vec::new();
    for i in 0..1000 {
        let x = (i % 32) as f32 * 0.05;
        let y = (i / 32) as f32 * 0.05;
        records.push([x, y, 0.53, 0.0, 0.0, 1.0, 0.08]);
    }
    let mut with_nan = records.clone();
    with_nan.insert(500, [0.8, 0.8, f32::NAN, 0.0, 0.0, 1.0, 0.08]);

    let run_one = |name: &str, records: &[[f32; 7]]| {
        let input = dir.path().join(format!("{name}.ply"));
        let output = dir.path().join(format!("{name}_out.ply"));
        write_ply(&input, records);
        let mut p = params(vec![input], output.clone(), 0.1);
        // Single-threaded stages make the byte stream reproducible.
        p.advanced.bucket_threads = 1;
        p.advanced.device_threads = 1;
        let (_, registry) = run_params(&p);
        (std::fs::read(&output).unwrap(), registry)
    };

    let (clean_bytes, clean_registry) = run_one("clean", &records);
    let (nan_bytes, nan_registry) = run_one("nan", &with_nan);

    assert_eq!(nan_registry.get("store.nonfinite").unwrap().sum, 1.0);
    assert!(clean_registry.get("store.nonfinite").is_none());
    assert_eq!(clean_bytes, nan_bytes);
}

/// E4: a 3-splat satellite below the prune fraction is dropped.
#[test]
fn small_component_is_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    write_ply(&input, &cluster_records());

    // First, measure both components without pruning.
    let unpruned_out = dir.path().join("all.ply");
    let mut p = params(vec![input.clone()], unpruned_out.clone(), 0.1);
    p.fit.prune = 0.0;
    let (all, _) = run_params(&p);
    assert_eq!(all.total_components, 2);
    assert_eq!(all.kept_components, 2);
    let small: u64 = all.kept_vertices - big_component_vertices(&unpruned_out);
    assert!(
        (small as f64) < 0.05 * all.kept_vertices as f64,
        "satellite too large: {small}/{}",
        all.kept_vertices
    );

    // Then prune at 5%.
    let pruned_out = dir.path().join("pruned.ply");
    let mut p = params(vec![input], pruned_out.clone(), 0.1);
    p.fit.prune = 0.05;
    let (pruned, _) = run_params(&p);
    assert_eq!(pruned.total_components, 2);
    assert_eq!(pruned.kept_components, 1);

    let (vertices, triangles, _) = read_triangle_mesh(&pruned_out).unwrap();
    assert_eq!(vertices.len() as u64, pruned.kept_vertices);
    assert_eq!(triangles.len() as u64, pruned.kept_triangles);
    // Only the main cluster near the origin survives.
    assert!(vertices.iter().all(|v| v[0] < 2.0));
}

fn cluster_records() -> Vec<[f32; 7]> {
    let mut records = Vec::new();
    // Main cluster: a 10x10 sheet of broadly supported splats.
    for i in 0..100 {
        let x = (i % 10) as f32 * 0.1;
        let y = (i / 10) as f32 * 0.1;
        records.push([x, y, 0.53, 0.0, 0.0, 1.0, 0.25]);
    }
    // Satellite: three tiny splats far away.
    for k in 0..3 {
        records.push([3.0 + 0.01 * k as f32, 3.0, 3.03, 0.0, 0.0, 1.0, 0.07]);
    }
    records
}

/// Vertices of the dominant component, by x-position split.
fn big_component_vertices(path: &Path) -> u64 {
    let (vertices, _, _) = read_triangle_mesh(path).unwrap();
    vertices.iter().filter(|v| v[0] < 2.0).count() as u64
}

/// E6 at pipeline scale: a sheet crossing bin boundaries welds without
/// duplicating seam vertices.
#[test]
fn seam_vertices_weld_across_bins() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    let output = dir.path().join("out.ply");

    // A sheet of splats spanning several 15-cell (1.5 world unit) bins.
    let mut records = Vec::new();
    for i in 0..40 {
        for j in 0..8 {
            records.push([
                i as f32 * 0.1,
                j as f32 * 0.1,
                0.53,
                0.0,
                0.0,
                1.0,
                0.12,
            ]);
        }
    }
    write_ply(&input, &records);

    let (summary, _) = run_params(&params(vec![input], output.clone(), 0.1));
    assert_eq!(summary.kept_components, 1, "seams must weld into one sheet");

    let (vertices, triangles, _) = read_triangle_mesh(&output).unwrap();
    assert_eq!(vertices.len() as u64, summary.kept_vertices);

    // No coincident duplicates: every vertex position appears once.
    let mut seen = std::collections::HashSet::new();
    for v in &vertices {
        assert!(
            seen.insert(v.map(f32::to_bits)),
            "duplicate seam vertex at {v:?}"
        );
    }
    // And the sheet is edge-manifold: no triangle edge appears more than twice.
    let mut edges = std::collections::HashMap::new();
    for t in &triangles {
        for k in 0..3 {
            let (a, b) = (t[k].min(t[(k + 1) % 3]), t[k].max(t[(k + 1) % 3]));
            *edges.entry((a, b)).or_insert(0u32) += 1;
        }
    }
    assert!(edges.values().all(|&c| c <= 2));
}

/// Chunked output: distant clusters land in separate coordinate-named files.
#[test]
fn chunked_run_writes_per_chunk_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.ply");
    let output = dir.path().join("mesh.ply");
    write_ply(&input, &cluster_records());

    let mut p = params(vec![input], output, 0.1);
    p.fit.prune = 0.0;
    p.advanced.chunk_cells = 15;
    let (summary, _) = run_params(&p);
    assert!(summary.files >= 2, "expected multiple chunk files");

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("mesh_"))
        .collect();
    assert_eq!(names.len() as u32, summary.files);
    for name in &names {
        // mesh_<x4>_<y4>_<z4>.ply
        assert_eq!(name.len(), "mesh_0000_0000_0000.ply".len(), "{name}");
        let (vertices, triangles, _) = read_triangle_mesh(&dir.path().join(name)).unwrap();
        assert!(!vertices.is_empty());
        assert!(!triangles.is_empty());
    }
}
