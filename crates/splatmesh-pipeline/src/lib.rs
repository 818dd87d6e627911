//! The streaming reconstruction pipeline.
//!
//! Stages and queue capacities follow the two-level bucketing design: the
//! loader drains the coarse bucketer on the caller's thread, bucket workers
//! re-bucket coarse bins to device size, device workers run the field
//! engine, and a single mesher thread assembles the output.
//!
//! ```text
//! store+blobs -> bucket(outer) -> loader -> q(1) -> DeviceBlock x N
//!             -> q(2) -> DeviceWorker x M -> mesher queue -> Mesher
//! ```

pub mod config;
mod queue;
mod run;

pub use config::{AdvancedConfig, FitConfig, MesherKind, ReconstructParams};
pub use queue::MesherQueue;
pub use run::run;

use splatmesh_core::{ChunkId, Grid, KeyMesh, Splat};
use splatmesh_store::Recursion;
use thiserror::Error;

/// A coarse bin read into host memory, already transformed into bounding
/// grid vertex coordinates. Ownership moves through the queue; the consumer
/// destroys it.
pub struct HostWorkItem {
    pub splats: Vec<Splat>,
    pub grid: Grid,
    pub recursion: Recursion,
}

/// A device-sized bin, in the same coordinates with extents rebased to the
/// bounding grid's low corner.
pub struct DeviceWorkItem {
    pub splats: Vec<Splat>,
    pub grid: Grid,
    pub recursion: Recursion,
}

/// One fragment on its way to the mesher.
pub struct MesherWork {
    pub chunk: ChunkId,
    pub mesh: KeyMesh,
}

/// Coarse progress reporting, fed in units of grid cells.
pub trait ProgressSink: Send + Sync {
    fn start(&self, _total_cells: u64) {}
    fn add(&self, _cells: u64) {}
}

/// Default sink for headless runs.
pub struct NoProgress;

impl ProgressSink for NoProgress {}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] splatmesh_store::StoreError),

    #[error(transparent)]
    Bucket(#[from] splatmesh_store::BucketError),

    #[error(transparent)]
    Mesher(#[from] splatmesh_mesher::MesherError),
}
