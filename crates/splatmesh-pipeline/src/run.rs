use std::sync::Arc;
use std::time::Instant;

use bytemuck::Zeroable;
use crossbeam_channel::{Receiver, Sender, bounded};
use glam::UVec3;
use splatmesh_core::{Extent, Grid, Registry, Splat};
use splatmesh_field::{EngineConfig, FieldEngine, block_cells, engine_resource_bytes};
use splatmesh_mesher::{Mesher, MesherConfig, WriteSummary};
use splatmesh_store::{
    BlobIndex, BucketError, BucketParams, IndexedSet, LeafBin, Recursion, SplatSet, SplatStore,
    VecSet, bucket,
};
use tracing::{error, info};

use crate::config::ReconstructParams;
use crate::{
    DeviceWorkItem, HostWorkItem, MesherQueue, MesherWork, PipelineError, ProgressSink,
};

/// Execute one reconstruction end to end.
///
/// The calling thread acts as the loader; bucket, device and mesher threads
/// are joined before this returns. Worker-side failures are fatal: there is
/// no safe way to unwind partially submitted device state, so workers log
/// and terminate the process, matching the documented error policy.
pub fn run(
    params: &ReconstructParams,
    registry: Arc<Registry>,
    progress: Arc<dyn ProgressSink>,
) -> Result<WriteSummary, PipelineError> {
    params.validate()?;
    let advanced = &params.advanced;
    let bin_cells = block_cells(advanced.levels, advanced.subsampling);

    let store = SplatStore::open(&params.inputs, params.fit.smooth, Arc::clone(&registry))?;
    info!(
        files = store.num_files(),
        records = store.size(),
        "opened input files"
    );
    let scratch = engine_resource_bytes(advanced.levels, advanced.subsampling)
        * advanced.device_threads as u64;
    info!(
        mib = scratch >> 20,
        workers = advanced.device_threads,
        "engine scratch to be allocated"
    );

    let t_bbox = Instant::now();
    let index = BlobIndex::build(&store, params.fit.spacing, bin_cells)?;
    registry.add("bbox.time", t_bbox.elapsed().as_secs_f64());
    let grid = *index.grid();

    let chunk_cells = params.chunk_cells_rounded();
    let mesher = Mesher::new(
        MesherConfig {
            output: params.output.clone(),
            writer: advanced.writer,
            prune_threshold: params.fit.prune,
            buffer_bytes: advanced.mesher_buffer,
            chunked: chunk_cells > 0,
            comments: params.comments.clone(),
        },
        Arc::clone(&registry),
    )?;

    progress.start(grid.total_cells());

    let outer_params = BucketParams {
        max_splats: advanced.max_host_splats,
        max_cells: bin_cells,
        max_split: advanced.max_split,
        max_ranges: 1 << 22,
        chunk_cells,
    };
    let inner_params = BucketParams {
        max_splats: advanced.max_device_splats,
        max_cells: bin_cells,
        max_split: advanced.max_split,
        max_ranges: 1 << 22,
        chunk_cells: 0,
    };
    let engine_config = EngineConfig {
        levels: advanced.levels,
        subsampling: advanced.subsampling,
        smooth: params.fit.smooth,
        keep_boundary: params.fit.keep_boundary,
        boundary_limit: params.fit.boundary_limit,
    };

    let (coarse_tx, coarse_rx) = bounded::<HostWorkItem>(1);
    let (fine_tx, fine_rx) = bounded::<DeviceWorkItem>(2);
    let mesher_queue = MesherQueue::new(advanced.mesher_queue);

    let mesher = std::thread::scope(|scope| -> Result<Mesher, PipelineError> {
        let mut bucket_threads = Vec::with_capacity(advanced.bucket_threads);
        for i in 0..advanced.bucket_threads {
            let rx = coarse_rx.clone();
            let tx = fine_tx.clone();
            let inner = &inner_params;
            let registry = &registry;
            let grid = &grid;
            bucket_threads.push(
                std::thread::Builder::new()
                    .name(format!("bucket-{i}"))
                    .spawn_scoped(scope, move || {
                        device_block_loop(rx, tx, grid, inner, registry)
                    })
                    .expect("failed to spawn bucket worker"),
            );
        }
        drop(coarse_rx);

        let mut device_threads = Vec::with_capacity(advanced.device_threads);
        for i in 0..advanced.device_threads {
            let rx = fine_rx.clone();
            let queue = &mesher_queue;
            let registry = &registry;
            let progress = &progress;
            let grid = &grid;
            device_threads.push(
                std::thread::Builder::new()
                    .name(format!("device-{i}"))
                    .spawn_scoped(scope, move || {
                        device_worker_loop(rx, queue, grid, engine_config, registry, progress)
                    })
                    .expect("failed to spawn device worker"),
            );
        }
        drop(fine_rx);
        drop(fine_tx);

        let mesher_thread = scope.spawn(|| mesher_loop(mesher, &mesher_queue));

        // The loader drains the outer bucketer on this thread.
        let set = IndexedSet {
            store: &store,
            index: &index,
        };
        let loader_result = bucket(
            &set,
            &grid,
            &outer_params,
            true,
            Recursion::root(),
            &mut |set, leaf| load_bin(set, leaf, &grid, params.fit.spacing, &coarse_tx, &registry),
        );

        // Bucket threads must drain completely before the device workers are
        // allowed to stop, or work would still be in flight towards them.
        drop(coarse_tx);
        for thread in bucket_threads {
            thread.join().expect("bucket worker panicked");
        }
        for thread in device_threads {
            thread.join().expect("device worker panicked");
        }
        mesher_queue.close();
        let mesher = mesher_thread.join().expect("mesher thread panicked");
        loader_result?;
        Ok(mesher)
    })?;

    let t_finalize = Instant::now();
    let mut mesher = mesher;
    let summary = mesher.finalize()?;
    registry.add("finalize.time", t_finalize.elapsed().as_secs_f64());
    info!(
        files = summary.files,
        components = summary.total_components,
        kept = summary.kept_components,
        vertices = summary.kept_vertices,
        triangles = summary.kept_triangles,
        "reconstruction finished"
    );
    Ok(summary)
}

/// Coarse-bin loader: read a leaf's splats through the contiguous fast
/// path, transform them into grid vertex coordinates, and hand them on.
fn load_bin(
    set: &IndexedSet<'_>,
    leaf: LeafBin<'_>,
    full_grid: &Grid,
    spacing: f32,
    tx: &Sender<HostWorkItem>,
    registry: &Registry,
) -> Result<(), BucketError> {
    let mut splats = vec![Splat::zeroed(); leaf.num_splats as usize];
    let mut pos = 0usize;

    // Page bookkeeping mirrors the reader's access granularity and feeds
    // tuning statistics only.
    const PAGE: u64 = 4096;
    let mut num_pages = 0u64;
    let mut last_page = u64::MAX;

    for range in leaf.ranges {
        let count = range.size as usize;
        set.read_splats(range, &mut splats[pos..pos + count]);
        for splat in &mut splats[pos..pos + count] {
            splat.position = full_grid.world_to_vertex(splat.position);
            splat.radius /= spacing;
        }
        pos += count;

        if range.size > 0 {
            let first = range.start / PAGE;
            let last = (range.start + range.size - 1) / PAGE;
            num_pages += last - first + 1;
            if last_page == first {
                num_pages -= 1;
            }
            last_page = last;
        }
    }
    debug_assert_eq!(pos, splats.len());

    registry.add("host.block.splats", leaf.num_splats as f64);
    registry.add("host.block.ranges", leaf.ranges.len() as f64);
    registry.add("host.block.pagedSplats", (num_pages * PAGE) as f64);
    registry.add("host.block.size", leaf.grid.total_cells() as f64);

    let item = HostWorkItem {
        splats,
        grid: leaf.grid,
        recursion: leaf.recursion,
    };
    let _ = tx.send(item);
    Ok(())
}

/// Bucket worker: re-bucket a coarse bin down to device size and forward
/// the resulting bins.
fn device_block_loop(
    rx: Receiver<HostWorkItem>,
    tx: Sender<DeviceWorkItem>,
    full_grid: &Grid,
    params: &BucketParams,
    registry: &Registry,
) {
    for item in rx.iter() {
        // The loader moved splats into grid vertex coordinates, so the bin
        // window is rebased onto the bounding grid's low corner.
        let base = full_grid.lo();
        let extents = [0, 1, 2].map(|a| {
            let e = item.grid.extent(a);
            Extent::new(e.lo - base[a], e.hi - base[a])
        });
        let local = Grid::new(glam::Vec3::ZERO, 1.0, extents);
        let set = VecSet {
            splats: &item.splats,
        };

        let result = bucket(
            &set,
            &local,
            params,
            false,
            item.recursion,
            &mut |set: &VecSet, leaf| {
                let mut splats = vec![Splat::zeroed(); leaf.num_splats as usize];
                let mut pos = 0usize;
                for range in leaf.ranges {
                    let count = range.size as usize;
                    set.read_splats(range, &mut splats[pos..pos + count]);
                    pos += count;
                }
                registry.add("device.block.splats", leaf.num_splats as f64);
                registry.add("device.block.ranges", leaf.ranges.len() as f64);
                registry.add("device.block.size", leaf.grid.total_cells() as f64);
                let _ = tx.send(DeviceWorkItem {
                    splats,
                    grid: leaf.grid,
                    recursion: leaf.recursion,
                });
                Ok(())
            },
        );
        if let Err(e) = result {
            error!("bucketing failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Device worker: each owns one field engine with preallocated scratch.
fn device_worker_loop(
    rx: Receiver<DeviceWorkItem>,
    queue: &MesherQueue,
    full_grid: &Grid,
    config: EngineConfig,
    registry: &Registry,
    progress: &Arc<dyn ProgressSink>,
) {
    let mut engine = FieldEngine::new(config);
    for item in rx.iter() {
        let offset = UVec3::new(
            item.grid.extent(0).lo as u32,
            item.grid.extent(1).lo as u32,
            item.grid.extent(2).lo as u32,
        );
        let size = UVec3::new(
            item.grid.num_vertices(0),
            item.grid.num_vertices(1),
            item.grid.num_vertices(2),
        );
        let scale = full_grid.spacing();
        let bias = full_grid.vertex_to_world(offset.as_vec3());

        let start = Instant::now();
        let ship_outs = engine.process_bin(
            &item.splats,
            offset,
            size,
            (scale, bias),
            &mut |mesh| {
                queue.push(MesherWork {
                    chunk: item.recursion.chunk,
                    mesh,
                });
            },
        );
        registry.add("device.worker.time", start.elapsed().as_secs_f64());
        if ship_outs > 0 {
            registry.add("marching.shipouts", ship_outs as f64);
        }
        progress.add(item.grid.total_cells());
    }
}

/// The mesher is not thread-safe; one consumer folds every fragment in.
fn mesher_loop(mut mesher: Mesher, queue: &MesherQueue) -> Mesher {
    while let Some(work) = queue.pop() {
        if let Err(e) = mesher.add(work.chunk, work.mesh) {
            error!("meshing failed: {e}");
            std::process::exit(1);
        }
    }
    mesher
}
