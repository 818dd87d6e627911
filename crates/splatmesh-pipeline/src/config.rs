use std::path::PathBuf;
use std::str::FromStr;

use clap::Args;
use splatmesh_field::{EVAL_ALIGN, MAX_BLOCK_LOG2, MAX_LEVELS, block_cells};
use splatmesh_ply::WriterKind;

use crate::PipelineError;

#[derive(Debug, Clone, Args)]
pub struct FitConfig {
    /// Smoothing factor (splat radius multiplier)
    #[arg(long = "fit-smooth", default_value_t = 4.0, help_heading = "Fitting options")]
    pub smooth: f32,

    /// Spacing of grid cells, in world units
    #[arg(long = "fit-grid", default_value_t = 0.01, help_heading = "Fitting options")]
    pub spacing: f32,

    /// Minimum fraction of vertices per kept component
    #[arg(long = "fit-prune", default_value_t = 0.02, help_heading = "Fitting options")]
    pub prune: f64,

    /// Do not remove boundaries
    #[arg(long = "fit-keep-boundary", help_heading = "Fitting options")]
    pub keep_boundary: bool,

    /// Tuning factor for boundary detection
    #[arg(
        long = "fit-boundary-limit",
        default_value_t = 1.5,
        help_heading = "Fitting options"
    )]
    pub boundary_limit: f32,
}

/// Output assembler selection (`--mesher`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MesherKind {
    /// The disk-backed assembler; the only variant in this build.
    #[default]
    Stxxl,
}

impl FromStr for MesherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stxxl" => Ok(Self::Stxxl),
            other => Err(format!("unknown mesher `{other}' (expected stxxl)")),
        }
    }
}

impl std::fmt::Display for MesherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stxxl => "stxxl",
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct AdvancedConfig {
    /// Levels in the splat octree
    #[arg(long, default_value_t = 7, help_heading = "Advanced options")]
    pub levels: u32,

    /// Subsampling of the splat octree
    #[arg(long, default_value_t = 2, help_heading = "Advanced options")]
    pub subsampling: u32,

    /// Maximum splats per device-level bin
    #[arg(
        long = "max-device-splats",
        default_value_t = 1_000_000,
        help_heading = "Advanced options"
    )]
    pub max_device_splats: u64,

    /// Maximum splats per host-level bin
    #[arg(
        long = "max-host-splats",
        default_value_t = 50_000_000,
        help_heading = "Advanced options"
    )]
    pub max_host_splats: u64,

    /// Maximum fan-out in partitioning
    #[arg(
        long = "max-split",
        default_value_t = 2_097_152,
        help_heading = "Advanced options"
    )]
    pub max_split: u64,

    /// Number of threads for bucketing splats
    #[arg(
        long = "bucket-threads",
        default_value_t = 4,
        help_heading = "Advanced options"
    )]
    pub bucket_threads: usize,

    /// Number of threads for submitting device work
    #[arg(
        long = "device-threads",
        default_value_t = 1,
        help_heading = "Advanced options"
    )]
    pub device_threads: usize,

    /// Output assembler (stxxl)
    #[arg(long, default_value = "stxxl", help_heading = "Advanced options")]
    pub mesher: MesherKind,

    /// File writer variant (mmap|stream)
    #[arg(long, default_value = "stream", help_heading = "Advanced options")]
    pub writer: WriterKind,

    /// Output chunk side in grid cells; 0 writes a single file
    #[arg(long = "chunk-cells", default_value_t = 0, help_heading = "Advanced options")]
    pub chunk_cells: u32,

    /// Mesher staging buffer, in bytes
    #[arg(
        long = "mesher-buffer",
        default_value_t = 256 << 20,
        help_heading = "Advanced options"
    )]
    pub mesher_buffer: usize,

    /// Mesher queue budget, in bytes
    #[arg(
        long = "mesher-queue",
        default_value_t = 512 << 20,
        help_heading = "Advanced options"
    )]
    pub mesher_queue: usize,
}

/// Everything one reconstruction run needs, validated.
#[derive(Debug, Clone)]
pub struct ReconstructParams {
    pub fit: FitConfig,
    pub advanced: AdvancedConfig,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// Header comments stamped into every output chunk.
    pub comments: Vec<String>,
}

impl ReconstructParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let cfg = |message: String| Err(PipelineError::Config(message));
        let advanced = &self.advanced;

        if self.inputs.is_empty() {
            return cfg("at least one input file must be specified".into());
        }
        if advanced.levels < 1 || advanced.levels > MAX_LEVELS {
            return cfg(format!(
                "value of --levels must be in the range 1 to {MAX_LEVELS}"
            ));
        }
        if advanced.levels + advanced.subsampling > MAX_BLOCK_LOG2 {
            return cfg("sum of --subsampling and --levels is too large".into());
        }
        if (1u32 << (advanced.levels + advanced.subsampling - 1)) < EVAL_ALIGN as u32 {
            return cfg("sum of --subsampling and --levels is too small".into());
        }
        if advanced.max_device_splats < 1 {
            return cfg("value of --max-device-splats must be positive".into());
        }
        if advanced.max_host_splats < advanced.max_device_splats {
            return cfg(
                "value of --max-host-splats must be at least that of --max-device-splats".into(),
            );
        }
        if advanced.max_split < 8 {
            return cfg("value of --max-split must be at least 8".into());
        }
        if advanced.bucket_threads < 1 {
            return cfg("value of --bucket-threads must be at least 1".into());
        }
        if advanced.device_threads < 1 {
            return cfg("value of --device-threads must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.fit.prune) {
            return cfg("value of --fit-prune must be in [0, 1]".into());
        }
        if !(self.fit.spacing > 0.0) {
            return cfg("value of --fit-grid must be positive".into());
        }
        if !(self.fit.smooth > 0.0) {
            return cfg("value of --fit-smooth must be positive".into());
        }
        if !(self.fit.boundary_limit > 0.0) {
            return cfg("value of --fit-boundary-limit must be positive".into());
        }
        Ok(())
    }

    /// Output chunk side, rounded up to a whole number of blocks.
    pub fn chunk_cells_rounded(&self) -> u32 {
        let block = block_cells(self.advanced.levels, self.advanced.subsampling);
        if self.advanced.chunk_cells == 0 {
            0
        } else {
            self.advanced.chunk_cells.div_ceil(block) * block
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ReconstructParams {
        ReconstructParams {
            fit: FitConfig {
                smooth: 4.0,
                spacing: 0.01,
                prune: 0.02,
                keep_boundary: false,
                boundary_limit: 1.5,
            },
            advanced: AdvancedConfig {
                levels: 7,
                subsampling: 2,
                max_device_splats: 1_000_000,
                max_host_splats: 50_000_000,
                max_split: 2_097_152,
                bucket_threads: 4,
                device_threads: 1,
                mesher: MesherKind::Stxxl,
                writer: WriterKind::Stream,
                chunk_cells: 0,
                mesher_buffer: 256 << 20,
                mesher_queue: 512 << 20,
            },
            inputs: vec![PathBuf::from("in.ply")],
            output: PathBuf::from("out.ply"),
            comments: Vec::new(),
        }
    }

    #[test]
    fn defaults_validate() {
        params().validate().unwrap();
    }

    fn rejected(mutate: impl FnOnce(&mut ReconstructParams), needle: &str) {
        let mut p = params();
        mutate(&mut p);
        let err = p.validate().unwrap_err().to_string();
        assert!(err.contains(needle), "`{err}` missing `{needle}`");
    }

    #[test]
    fn bounds_are_enforced() {
        rejected(|p| p.advanced.levels = 0, "--levels");
        rejected(|p| p.advanced.levels = 12, "--levels");
        rejected(|p| p.advanced.subsampling = 10, "too large");
        rejected(
            |p| {
                p.advanced.levels = 2;
                p.advanced.subsampling = 1;
            },
            "too small",
        );
        rejected(|p| p.advanced.max_device_splats = 0, "--max-device-splats");
        rejected(|p| p.advanced.max_host_splats = 10, "--max-host-splats");
        rejected(|p| p.advanced.max_split = 4, "--max-split");
        rejected(|p| p.advanced.bucket_threads = 0, "--bucket-threads");
        rejected(|p| p.advanced.device_threads = 0, "--device-threads");
        rejected(|p| p.fit.prune = 1.5, "--fit-prune");
        rejected(|p| p.fit.spacing = 0.0, "--fit-grid");
        rejected(|p| p.inputs.clear(), "input file");
    }

    #[test]
    fn chunk_cells_round_to_blocks() {
        let mut p = params();
        assert_eq!(p.chunk_cells_rounded(), 0);
        p.advanced.chunk_cells = 1;
        // block_cells(7, 2) = 255
        assert_eq!(p.chunk_cells_rounded(), 255);
        p.advanced.chunk_cells = 300;
        assert_eq!(p.chunk_cells_rounded(), 510);
    }

    #[test]
    fn variant_names_parse() {
        assert_eq!("stxxl".parse::<MesherKind>().unwrap(), MesherKind::Stxxl);
        assert!("weld".parse::<MesherKind>().is_err());
    }
}
