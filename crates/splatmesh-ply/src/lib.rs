//! Fast binary PLY input and output.
//!
//! Generic PLY libraries pay per-property dispatch costs on every record;
//! the reader here parses the header once into a byte-offset table and then
//! decodes fixed-stride records straight out of a memory mapping, which is
//! what makes the random-range reads of the bucketing stages cheap.

mod read;
mod write;

pub use read::{PlyReader, read_triangle_mesh};
pub use write::{MeshWriter, WriterKind, create_writer};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlyError {
    #[error("{path}: {message}")]
    Format { path: PathBuf, message: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PlyError {
    pub(crate) fn format(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
