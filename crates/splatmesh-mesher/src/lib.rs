//! Mesh stitching and chunked output assembly.
//!
//! Fragments arrive with welded per-block vertices and global keys for the
//! external ones. The mesher tracks connected components across the whole
//! output in a union-find of *clumps*, folds duplicate external vertices
//! within each output chunk, stages everything through disk-backed vectors,
//! and on finalize writes the components that survive pruning.

mod mesher;
mod union_find;

pub use mesher::{Mesher, MesherConfig, WriteSummary};
pub use union_find::ClumpForest;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MesherError {
    /// The clump ID space is exhausted.
    #[error("there were too many connected components")]
    TooManyComponents,

    /// One output chunk needs 2³² or more vertices.
    #[error("too many vertices for {path}")]
    Overflow { path: PathBuf },

    #[error(transparent)]
    Ply(#[from] splatmesh_ply::PlyError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl MesherError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
