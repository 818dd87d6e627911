//! Streaming access to on-disk splat sets, the persistent blob index, and
//! the recursive spatial bucketer that turns both into device-sized work.

mod blobs;
mod bucket;
mod set;
mod store;
#[cfg(test)]
pub(crate) mod testutil;

pub use blobs::{Blob, BlobIndex, splat_bucket_box};
pub use bucket::{BucketError, BucketParams, LeafBin, Recursion, bucket};
pub use set::{BlobInfo, BlobStream, IndexedSet, SplatRange, SplatSet, VecSet};
pub use store::{BUFFER_SIZE, SplatStore, SplatStream};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The inputs contained no finite splat at all.
    #[error("at least one input point is required")]
    EmptyInput,

    #[error(transparent)]
    Ply(#[from] splatmesh_ply::PlyError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A single vertex record does not fit the read buffer.
    #[error("{path}: far too many bytes per vertex")]
    HugeVertex { path: std::path::PathBuf },

    /// The model does not fit the vertex-key coordinate budget.
    #[error("bounding grid of {cells} cells per axis exceeds the supported {limit}")]
    GridTooLarge { cells: u64, limit: u64 },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
