//! Shared fixtures for the store tests: tiny binary PLY files on disk.

use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

/// Record layout used by [`write_ply`]: `x y z nx ny nz radius`.
pub fn splat_record(x: f32, y: f32, z: f32, radius: f32) -> [f32; 7] {
    [x, y, z, 0.0, 0.0, 1.0, radius]
}

pub fn write_ply(dir: &Path, name: &str, records: &[[f32; 7]]) -> PathBuf {
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
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
