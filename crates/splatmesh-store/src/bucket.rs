//! Recursive spatial bucketing.
//!
//! Splits a grid region into leaf bins that satisfy both a per-axis cell
//! limit and a splat-count limit, driving all decisions off blob streams so
//! the splats themselves are only touched when a region is too fine for the
//! persistent index. A blob is assigned to every child its box intersects,
//! so splats straddling a partition boundary are duplicated into each side;
//! the mesher welds the resulting seams by vertex key.

use splatmesh_core::{ChunkId, Extent, Grid, split_splat_id};
use thiserror::Error;

use crate::set::{BlobInfo, SplatRange, SplatSet};
use crate::StoreError;

#[derive(Debug, Error)]
pub enum BucketError {
    /// A single cell holds more splats than a bin may carry.
    #[error("the splats are too dense; try a higher --max-device-splats")]
    Density,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct BucketParams {
    /// Upper bound on splats per leaf bin (duplicates included).
    pub max_splats: u64,
    /// Upper bound on leaf side length, in cells.
    pub max_cells: u32,
    /// Fan-out limit: the microcell histogram of one recursion level never
    /// exceeds this many entries.
    pub max_split: u64,
    /// Soft budget on materialized ranges across the whole recursion.
    pub max_ranges: u64,
    /// Output chunk side in cells (0 disables chunk splitting).
    pub chunk_cells: u32,
}

/// Where in the partition tree a bin sits; carried through the pipeline so
/// device-level re-bucketing can continue where the coarse level stopped.
#[derive(Debug, Clone, Copy)]
pub struct Recursion {
    pub depth: u32,
    pub total_ranges: u64,
    pub chunk: ChunkId,
}

impl Recursion {
    pub fn root() -> Self {
        Self {
            depth: 0,
            total_ranges: 0,
            chunk: ChunkId::default(),
        }
    }
}

/// One emitted leaf bin. Ranges are sorted and non-overlapping.
pub struct LeafBin<'a> {
    pub num_splats: u64,
    pub ranges: &'a [SplatRange],
    pub grid: Grid,
    pub recursion: Recursion,
}

/// Recursively partition `grid` and emit leaf bins through `callback`.
///
/// With `chunk` set, the top level walks output-chunk regions first
/// (aligned to `chunk_cells`) and stamps each with a dense [`ChunkId`].
pub fn bucket<S, F>(
    set: &S,
    grid: &Grid,
    params: &BucketParams,
    chunk: bool,
    recursion: Recursion,
    callback: &mut F,
) -> Result<(), BucketError>
where
    S: SplatSet,
    F: FnMut(&S, LeafBin<'_>) -> Result<(), BucketError>,
{
    let mut ctx = Ctx {
        total_ranges: recursion.total_ranges,
    };

    if chunk && params.chunk_cells > 0 {
        let c = params.chunk_cells;
        let n = [0, 1, 2].map(|a| grid.num_cells(a).div_ceil(c));
        let mut r#gen = 0u32;
        for cz in 0..n[2] {
            for cy in 0..n[1] {
                for cx in 0..n[0] {
                    let coords = [cx, cy, cz];
                    let region = [0, 1, 2].map(|a| {
                        let e = grid.extent(a);
                        let lo = e.lo + (coords[a] * c) as i32;
                        Extent::new(lo, (lo + c as i32).min(e.hi))
                    });
                    let (ranges, count) = collect_region(set, &region, params, None)?;
                    if count == 0 {
                        continue;
                    }
                    let rec = Recursion {
                        depth: recursion.depth,
                        total_ranges: ctx.total_ranges,
                        chunk: ChunkId { r#gen, coords },
                    };
                    r#gen += 1;
                    node(set, grid, region, ranges, count, rec, params, &mut ctx, callback)?;
                }
            }
        }
        Ok(())
    } else {
        let region = grid.extents();
        let (ranges, count) = collect_region(set, &region, params, None)?;
        if count == 0 {
            return Ok(());
        }
        node(
            set, grid, region, ranges, count, recursion, params, &mut ctx, callback,
        )
    }
}

struct Ctx {
    total_ranges: u64,
}

#[allow(clippy::too_many_arguments)]
fn node<S, F>(
    set: &S,
    grid: &Grid,
    region: [Extent; 3],
    ranges: Vec<SplatRange>,
    num_splats: u64,
    recursion: Recursion,
    params: &BucketParams,
    ctx: &mut Ctx,
    callback: &mut F,
) -> Result<(), BucketError>
where
    S: SplatSet,
    F: FnMut(&S, LeafBin<'_>) -> Result<(), BucketError>,
{
    let cells = [0, 1, 2].map(|a| region[a].cells());

    if cells.iter().all(|&c| c <= params.max_cells) && num_splats <= params.max_splats {
        let leaf = LeafBin {
            num_splats,
            ranges: &ranges,
            grid: grid.with_extents(region),
            recursion: Recursion {
                total_ranges: ctx.total_ranges,
                ..recursion
            },
        };
        return callback(set, leaf);
    }

    if cells.iter().all(|&c| c == 1) {
        // A single cell over the splat limit cannot be split further.
        return Err(BucketError::Density);
    }

    let g = choose_granularity(cells, params);
    let m = cells.map(|c| c.div_ceil(g));

    // One blob pass accumulating per-axis occupancy marginals.
    let mut marginals: [Vec<u64>; 3] =
        [0, 1, 2].map(|a| vec![0u64; m[a] as usize]);
    for blob in set.blob_stream(g, Some(&ranges)) {
        let blob = blob?;
        if !intersects(&blob, &region) {
            continue;
        }
        for a in 0..3 {
            let (lo, hi) = slab_range(&blob, region[a].lo, g, m[a], a);
            for s in lo..=hi {
                marginals[a][s] += blob.count();
            }
        }
    }

    // Split along the axis whose slabbing reduces the worst child the most.
    let mut axis = usize::MAX;
    let mut best_peak = u64::MAX;
    for a in 0..3 {
        if m[a] <= 1 {
            continue;
        }
        let peak = *marginals[a].iter().max().expect("m[a] > 1");
        if axis == usize::MAX
            || peak < best_peak
            || (peak == best_peak && m[a] > m[axis])
        {
            axis = a;
            best_peak = peak;
        }
    }
    debug_assert!(axis != usize::MAX);

    // Second pass: partition the blobs into the slabs they touch.
    let mut children: Vec<RangeCollector> = vec![RangeCollector::default(); m[axis] as usize];
    for blob in set.blob_stream(g, Some(&ranges)) {
        let blob = blob?;
        if !intersects(&blob, &region) {
            continue;
        }
        let (lo, hi) = slab_range(&blob, region[axis].lo, g, m[axis], axis);
        for child in &mut children[lo..=hi] {
            child.add(&blob);
        }
    }
    drop(ranges);

    ctx.total_ranges += children.iter().map(|c| c.ranges.len() as u64).sum::<u64>();
    if ctx.total_ranges > params.max_ranges {
        return Err(BucketError::Density);
    }

    for (j, child) in children.into_iter().enumerate() {
        if child.count == 0 {
            continue;
        }
        let mut child_region = region;
        let e = region[axis];
        let lo = e.lo + (j as u32 * g) as i32;
        child_region[axis] = Extent::new(lo, (lo + g as i32).min(e.hi));
        node(
            set,
            grid,
            child_region,
            child.ranges,
            child.count,
            Recursion {
                depth: recursion.depth + 1,
                ..recursion
            },
            params,
            ctx,
            callback,
        )?;
    }
    Ok(())
}

/// Smallest granularity whose microcell count respects `max_split`. Regions
/// larger than a leaf stay aligned to leaf multiples so the persistent blob
/// index keeps serving exact boxes.
fn choose_granularity(cells: [u32; 3], params: &BucketParams) -> u32 {
    let base = if cells.iter().any(|&c| c > params.max_cells) {
        params.max_cells
    } else {
        1
    };
    let mut g = base;
    while cells
        .iter()
        .map(|&c| c.div_ceil(g) as u64)
        .product::<u64>()
        > params.max_split
    {
        g *= 2;
    }
    g
}

fn intersects(blob: &BlobInfo, region: &[Extent; 3]) -> bool {
    (0..3).all(|a| blob.upper[a] >= region[a].lo && blob.lower[a] < region[a].hi)
}

fn slab_range(blob: &BlobInfo, lo: i32, g: u32, m: u32, axis: usize) -> (usize, usize) {
    let g = g as i32;
    let lo_s = (blob.lower[axis] - lo).div_euclid(g).max(0) as usize;
    let hi_s = (blob.upper[axis] - lo)
        .div_euclid(g)
        .min(m as i32 - 1) as usize;
    (lo_s, hi_s)
}

fn collect_region<S: SplatSet>(
    set: &S,
    region: &[Extent; 3],
    params: &BucketParams,
    ranges: Option<&[SplatRange]>,
) -> Result<(Vec<SplatRange>, u64), BucketError> {
    let mut out = RangeCollector::default();
    for blob in set.blob_stream(params.max_cells, ranges) {
        let blob = blob?;
        if intersects(&blob, region) {
            out.add(&blob);
        }
    }
    Ok((out.ranges, out.count))
}

/// Accumulates blob ID ranges, merging runs that are contiguous in one scan.
#[derive(Debug, Default, Clone)]
struct RangeCollector {
    ranges: Vec<SplatRange>,
    count: u64,
}

impl RangeCollector {
    fn add(&mut self, blob: &BlobInfo) {
        let (scan, start) = split_splat_id(blob.first);
        debug_assert_eq!(split_splat_id(blob.last - 1).0, scan, "blob spans files");
        let size = blob.count();
        self.count += size;
        if let Some(last) = self.ranges.last_mut()
            && last.scan as usize == scan
            && last.start + last.size == start
        {
            last.size += size;
            return;
        }
        self.ranges.push(SplatRange {
            scan: scan as u32,
            start,
            size,
        });
    }
}
