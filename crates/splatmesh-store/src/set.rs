//! Uniform access to splat collections for the bucketer: the on-disk store
//! behind its blob index, and in-memory splat vectors during device-level
//! re-bucketing.

use glam::{IVec3, Vec3};
use splatmesh_core::{Splat, splat_id};

use crate::blobs::{BlobIndex, splat_bucket_box};
use crate::store::SplatStream;
use crate::{SplatStore, StoreError};

/// A contiguous run of splats within one scan (input file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplatRange {
    pub scan: u32,
    pub start: u64,
    pub size: u64,
}

impl SplatRange {
    pub fn first_id(&self) -> u64 {
        splat_id(self.scan as usize, self.start)
    }

    pub fn end_id(&self) -> u64 {
        splat_id(self.scan as usize, self.start + self.size)
    }
}

/// One blob as seen by a bucketing query: a splat ID range and the inclusive
/// cell box shared by all of its splats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    pub first: u64,
    pub last: u64,
    pub lower: IVec3,
    pub upper: IVec3,
}

impl BlobInfo {
    pub fn count(&self) -> u64 {
        self.last - self.first
    }
}

pub type BlobStream<'a> = Box<dyn Iterator<Item = Result<BlobInfo, StoreError>> + 'a>;

pub trait SplatSet {
    /// Stream blobs in ID order, restricted to `ranges` (`None` = everything).
    ///
    /// Boxes are inclusive cell boxes and are exact at boundaries that are
    /// multiples of `granularity`; a set whose native index is coarser than
    /// the requested granularity falls back to streaming individual splats.
    fn blob_stream<'a>(
        &'a self,
        granularity: u32,
        ranges: Option<&'a [SplatRange]>,
    ) -> BlobStream<'a>;

    /// Contiguous-destination read of one range.
    fn read_splats(&self, range: &SplatRange, out: &mut [Splat]);
}

/// The on-disk store paired with its precomputed blob index.
pub struct IndexedSet<'a> {
    pub store: &'a SplatStore,
    pub index: &'a BlobIndex,
}

impl SplatSet for IndexedSet<'_> {
    fn blob_stream<'a>(
        &'a self,
        granularity: u32,
        ranges: Option<&'a [SplatRange]>,
    ) -> BlobStream<'a> {
        if granularity % self.index.bucket_size() == 0 {
            Box::new(IndexedBlobIter {
                set: self,
                ranges,
                range_idx: 0,
                iter: None,
                started: false,
            })
        } else {
            // The stored boxes are too coarse; descend to the splat stream
            // and produce exact single-splat blobs.
            let ranges = match ranges {
                Some(r) => r.to_vec(),
                None => (0..self.store.num_files())
                    .map(|scan| SplatRange {
                        scan: scan as u32,
                        start: 0,
                        size: self.store.file(scan).size(),
                    })
                    .collect(),
            };
            Box::new(SplatBlobIter {
                spacing: self.index.grid().spacing(),
                stream: self.store.stream(0, 0),
                ranges,
                range_idx: None,
            })
        }
    }

    fn read_splats(&self, range: &SplatRange, out: &mut [Splat]) {
        self.store.read_splats(
            range.scan as usize,
            range.start,
            range.start + range.size,
            out,
        );
    }
}

struct IndexedBlobIter<'a> {
    set: &'a IndexedSet<'a>,
    ranges: Option<&'a [SplatRange]>,
    range_idx: usize,
    iter: Option<splatmesh_core::extvec::ExtIter<crate::blobs::Blob>>,
    started: bool,
}

impl IndexedBlobIter<'_> {
    fn convert(&self, blob: crate::blobs::Blob) -> BlobInfo {
        let bs = self.set.index.bucket_size() as i32;
        BlobInfo {
            first: blob.first,
            last: blob.last,
            lower: IVec3::from_array(blob.lower) * bs,
            upper: (IVec3::from_array(blob.upper) + IVec3::ONE) * bs - IVec3::ONE,
        }
    }

    /// Index of the first blob with `first >= target`, by binary search over
    /// the frozen blob vector.
    fn lower_bound(&self, target: u64) -> Result<u64, StoreError> {
        let mut reader = self.set.index.reader()?;
        let (mut lo, mut hi) = (0u64, reader.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let blob = reader
                .get(mid)
                .map_err(|e| StoreError::io("blob index", e))?;
            if blob.first < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

impl Iterator for IndexedBlobIter<'_> {
    type Item = Result<BlobInfo, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.iter {
                let end = self.ranges.map(|r| r[self.range_idx].end_id());
                match iter.next() {
                    Some(Ok(blob)) => {
                        if end.is_none_or(|end| blob.first < end) {
                            return Some(Ok(self.convert(blob)));
                        }
                        self.iter = None;
                        self.range_idx += 1;
                    }
                    Some(Err(e)) => return Some(Err(StoreError::io("blob index", e))),
                    None => return None,
                }
            } else {
                match self.ranges {
                    None => {
                        if self.started {
                            return None;
                        }
                        self.started = true;
                        match self.set.index.reader() {
                            Ok(reader) => self.iter = Some(reader.iter_from(0)),
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    Some(ranges) => {
                        if self.range_idx >= ranges.len() {
                            return None;
                        }
                        let start = match self.lower_bound(ranges[self.range_idx].first_id()) {
                            Ok(i) => i,
                            Err(e) => return Some(Err(e)),
                        };
                        match self.set.index.reader() {
                            Ok(reader) => self.iter = Some(reader.iter_from(start)),
                            Err(e) => return Some(Err(e)),
                        }
                    }
                }
            }
        }
    }
}

struct SplatBlobIter<'a> {
    spacing: f32,
    stream: SplatStream<'a>,
    ranges: Vec<SplatRange>,
    /// `None` before the first range is requested.
    range_idx: Option<usize>,
}

impl Iterator for SplatBlobIter<'_> {
    type Item = Result<BlobInfo, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.range_idx.is_some()
                && let Some((id, splat)) = self.stream.next()
            {
                let (lower, upper) = splat_bucket_box(&splat, Vec3::ZERO, self.spacing, 1);
                return Some(Ok(BlobInfo {
                    first: id,
                    last: id + 1,
                    lower,
                    upper,
                }));
            }
            let next = self.range_idx.map_or(0, |i| i + 1);
            if next >= self.ranges.len() {
                return None;
            }
            self.range_idx = Some(next);
            let range = self.ranges[next];
            self.stream.reset(range.first_id(), range.end_id());
        }
    }
}

/// An in-memory splat vector already transformed into grid vertex space
/// (spacing 1, origin 0), as produced by the loader.
pub struct VecSet<'a> {
    pub splats: &'a [Splat],
}

impl SplatSet for VecSet<'_> {
    fn blob_stream<'a>(
        &'a self,
        _granularity: u32,
        ranges: Option<&'a [SplatRange]>,
    ) -> BlobStream<'a> {
        let full = [SplatRange {
            scan: 0,
            start: 0,
            size: self.splats.len() as u64,
        }];
        let ranges: Vec<SplatRange> = match ranges {
            Some(r) => r.to_vec(),
            None => full.to_vec(),
        };
        Box::new(ranges.into_iter().flat_map(move |range| {
            debug_assert_eq!(range.scan, 0);
            let start = range.start as usize;
            let end = (range.start + range.size) as usize;
            self.splats[start..end].iter().enumerate().map(move |(i, splat)| {
                let (lower, upper) = splat_bucket_box(splat, Vec3::ZERO, 1.0, 1);
                let id = (start + i) as u64;
                Ok(BlobInfo {
                    first: id,
                    last: id + 1,
                    lower,
                    upper,
                })
            })
        }))
    }

    fn read_splats(&self, range: &SplatRange, out: &mut [Splat]) {
        debug_assert_eq!(range.scan, 0);
        let start = range.start as usize;
        let end = (range.start + range.size) as usize;
        out[..end - start].copy_from_slice(&self.splats[start..end]);
    }
}
