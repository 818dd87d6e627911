//! The persistent blob index.
//!
//! A blob is a maximal run of consecutive finite splats whose radius-inflated
//! boxes fall into the same bucket box at a fixed `(spacing, bucket_size)`.
//! Bucketing queries then cost O(#blobs) instead of O(#splats). The index is
//! built in a single pass over the store, together with the global bounding
//! grid.

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};
use splatmesh_core::{Aabb, ExtReader, ExtVec, Extent, Grid, Splat, key::KEY_AXIS_LIMIT};
use tracing::info;

use crate::{SplatStore, StoreError};

/// Largest supported bounding-grid side, limited by the vertex-key budget
/// (doubled coordinates must fit one key axis field).
pub const MAX_GRID_CELLS: u64 = (KEY_AXIS_LIMIT as u64) / 2 - 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Blob {
    /// Global ID range `[first, last)` of the covered splats.
    pub first: u64,
    pub last: u64,
    /// Inclusive bucket-box corners shared by every splat in the range.
    pub lower: [i32; 3],
    pub upper: [i32; 3],
}

impl Blob {
    pub fn count(&self) -> u64 {
        self.last - self.first
    }
}

/// Bucket box of one splat: its radius-inflated bounds floored into lattice
/// cells (anchored at `origin`) and divided down onto the bucket grid.
pub fn splat_bucket_box(
    splat: &Splat,
    origin: Vec3,
    spacing: f32,
    bucket_size: u32,
) -> (IVec3, IVec3) {
    let lo = ((splat.position - Vec3::splat(splat.radius) - origin) / spacing).floor();
    let hi = ((splat.position + Vec3::splat(splat.radius) - origin) / spacing).floor();
    let bs = bucket_size as i32;
    (
        lo.as_ivec3().div_euclid(IVec3::splat(bs)),
        hi.as_ivec3().div_euclid(IVec3::splat(bs)),
    )
}

pub struct BlobIndex {
    blobs: ExtVec<Blob>,
    grid: Grid,
    bucket_size: u32,
    num_blobs: u64,
    num_splats: u64,
}

impl BlobIndex {
    /// One full pass over the store: build blob runs and the bounding grid.
    pub fn build(
        store: &SplatStore,
        spacing: f32,
        bucket_size: u32,
    ) -> Result<Self, StoreError> {
        let mut blobs: ExtVec<Blob> = ExtVec::new().map_err(|e| StoreError::io("blob index", e))?;
        let mut bbox = Aabb::empty();
        let mut run: Option<Blob> = None;
        let mut num_splats = 0u64;

        for (id, splat) in store.stream(0, store.id_end()) {
            let (lower, upper) = splat_bucket_box(&splat, Vec3::ZERO, spacing, bucket_size);
            bbox.include_sphere(splat.position, splat.radius);
            num_splats += 1;

            match &mut run {
                Some(blob)
                    if blob.last == id
                        && blob.lower == lower.to_array()
                        && blob.upper == upper.to_array() =>
                {
                    blob.last = id + 1;
                }
                _ => {
                    if let Some(blob) = run.take() {
                        blobs.push(blob).map_err(|e| StoreError::io("blob index", e))?;
                    }
                    run = Some(Blob {
                        first: id,
                        last: id + 1,
                        lower: lower.to_array(),
                        upper: upper.to_array(),
                    });
                }
            }
        }
        if let Some(blob) = run.take() {
            blobs.push(blob).map_err(|e| StoreError::io("blob index", e))?;
        }
        if num_splats == 0 {
            return Err(StoreError::EmptyInput);
        }
        blobs.freeze().map_err(|e| StoreError::io("blob index", e))?;

        let grid = bounding_grid(&bbox, spacing, bucket_size)?;
        let num_blobs = blobs.len();
        store.registry().add("blobs.count", num_blobs as f64);
        store.registry().add("blobs.splats", num_splats as f64);
        info!(
            blobs = num_blobs,
            splats = num_splats,
            cells = ?[grid.num_cells(0), grid.num_cells(1), grid.num_cells(2)],
            "blob index ready"
        );

        Ok(Self {
            blobs,
            grid,
            bucket_size,
            num_blobs,
            num_splats,
        })
    }

    /// The bounding grid: origin-anchored lattice whose window covers every
    /// splat sphere, snapped outward to bucket multiples.
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Granularity the stored bucket boxes were computed at.
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    pub fn num_blobs(&self) -> u64 {
        self.num_blobs
    }

    /// Number of finite splats covered by the index.
    pub fn num_splats(&self) -> u64 {
        self.num_splats
    }

    pub fn reader(&self) -> Result<ExtReader<Blob>, StoreError> {
        self.blobs.reader().map_err(|e| StoreError::io("blob index", e))
    }
}

fn bounding_grid(bbox: &Aabb, spacing: f32, bucket_size: u32) -> Result<Grid, StoreError> {
    let bs = bucket_size as i64;
    let mut extents = [Extent::new(0, 0); 3];
    for axis in 0..3 {
        let lo_cell = (bbox.min[axis] / spacing).floor() as i64;
        let hi_cell = (bbox.max[axis] / spacing).floor() as i64;
        let lo = lo_cell.div_euclid(bs) * bs;
        let hi = (hi_cell.div_euclid(bs) + 1) * bs;
        if (hi - lo) as u64 > MAX_GRID_CELLS {
            return Err(StoreError::GridTooLarge {
                cells: (hi - lo) as u64,
                limit: MAX_GRID_CELLS,
            });
        }
        extents[axis] = Extent::new(lo as i32, hi as i32);
    }
    Ok(Grid::new(Vec3::ZERO, spacing, extents))
}
