use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use byteorder::{LittleEndian, ByteOrder, WriteBytesExt};
use memmap2::MmapMut;

use crate::PlyError;

/// Append buffer / mapping flush granularity, matched to the disk-backed
/// vector block size so finalize reads and writes move the same units.
pub const APPEND_BUFFER_BYTES: usize = 1 << 20;

const VERTEX_BYTES: u64 = 12;
const TRIANGLE_BYTES: u64 = 13; // count byte + three u32 indices

/// Output writer selection (`--writer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterKind {
    Stream,
    Mmap,
}

impl FromStr for WriterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Self::Stream),
            "mmap" => Ok(Self::Mmap),
            other => Err(format!("unknown writer `{other}' (expected mmap|stream)")),
        }
    }
}

impl std::fmt::Display for WriterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stream => "stream",
            Self::Mmap => "mmap",
        })
    }
}

/// One open output chunk. Totals are declared up front; payload is appended
/// afterwards and must match the declaration by `finish`.
pub trait MeshWriter: Send {
    fn append_vertices(&mut self, vertices: &[[f32; 3]]) -> Result<(), PlyError>;
    fn append_triangles(&mut self, triangles: &[[u32; 3]]) -> Result<(), PlyError>;
    fn finish(&mut self) -> Result<(), PlyError>;
}

/// Open an output chunk at `path`, declaring its final totals.
pub fn create_writer(
    kind: WriterKind,
    path: &Path,
    num_vertices: u64,
    num_triangles: u64,
    comments: &[String],
) -> Result<Box<dyn MeshWriter>, PlyError> {
    let header = header_bytes(num_vertices, num_triangles, comments);
    match kind {
        WriterKind::Stream => Ok(Box::new(StreamWriter::create(
            path,
            header,
            num_vertices,
            num_triangles,
        )?)),
        WriterKind::Mmap => Ok(Box::new(MmapWriter::create(
            path,
            header,
            num_vertices,
            num_triangles,
        )?)),
    }
}

fn header_bytes(num_vertices: u64, num_triangles: u64, comments: &[String]) -> Vec<u8> {
    let mut header = String::from("ply\nformat binary_little_endian 1.0\n");
    for comment in comments {
        header.push_str("comment ");
        header.push_str(comment);
        header.push('\n');
    }
    header.push_str(&format!("element vertex {num_vertices}\n"));
    header.push_str("property float32 x\nproperty float32 y\nproperty float32 z\n");
    header.push_str(&format!("element face {num_triangles}\n"));
    header.push_str("property list uint8 uint32 vertex_indices\n");
    header.push_str("end_header\n");
    header.into_bytes()
}

/// Sequential writer over a buffered stream. Vertices must be fully
/// appended before the first triangle.
struct StreamWriter {
    path: PathBuf,
    out: BufWriter<File>,
    declared: (u64, u64),
    written: (u64, u64),
}

impl StreamWriter {
    fn create(
        path: &Path,
        header: Vec<u8>,
        num_vertices: u64,
        num_triangles: u64,
    ) -> Result<Self, PlyError> {
        let file = File::create(path).map_err(|e| PlyError::io(path, e))?;
        let mut out = BufWriter::with_capacity(APPEND_BUFFER_BYTES, file);
        out.write_all(&header).map_err(|e| PlyError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            declared: (num_vertices, num_triangles),
            written: (0, 0),
        })
    }
}

impl MeshWriter for StreamWriter {
    fn append_vertices(&mut self, vertices: &[[f32; 3]]) -> Result<(), PlyError> {
        if self.written.1 > 0 {
            return Err(PlyError::format(
                &self.path,
                "stream writer requires all vertices before the first triangle",
            ));
        }
        for v in vertices {
            for &c in v {
                self.out
                    .write_f32::<LittleEndian>(c)
                    .map_err(|e| PlyError::io(&self.path, e))?;
            }
        }
        self.written.0 += vertices.len() as u64;
        Ok(())
    }

    fn append_triangles(&mut self, triangles: &[[u32; 3]]) -> Result<(), PlyError> {
        for t in triangles {
            self.out
                .write_u8(3)
                .map_err(|e| PlyError::io(&self.path, e))?;
            for &i in t {
                self.out
                    .write_u32::<LittleEndian>(i)
                    .map_err(|e| PlyError::io(&self.path, e))?;
            }
        }
        self.written.1 += triangles.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PlyError> {
        if self.written != self.declared {
            return Err(PlyError::format(
                &self.path,
                format!(
                    "declared {}/{} vertices/triangles but wrote {}/{}",
                    self.declared.0, self.declared.1, self.written.0, self.written.1
                ),
            ));
        }
        self.out.flush().map_err(|e| PlyError::io(&self.path, e))
    }
}

/// Writer over a pre-sized mutable mapping. Vertex and triangle appends can
/// interleave since each maintains its own cursor.
struct MmapWriter {
    path: PathBuf,
    map: MmapMut,
    vertex_pos: usize,
    triangle_pos: usize,
    vertex_end: usize,
    triangle_end: usize,
}

impl MmapWriter {
    fn create(
        path: &Path,
        header: Vec<u8>,
        num_vertices: u64,
        num_triangles: u64,
    ) -> Result<Self, PlyError> {
        let total = header.len() as u64 + num_vertices * VERTEX_BYTES + num_triangles * TRIANGLE_BYTES;
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| PlyError::io(path, e))?;
        file.set_len(total).map_err(|e| PlyError::io(path, e))?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| PlyError::io(path, e))?;
        map[..header.len()].copy_from_slice(&header);
        let vertex_pos = header.len();
        let vertex_end = vertex_pos + (num_vertices * VERTEX_BYTES) as usize;
        Ok(Self {
            path: path.to_path_buf(),
            map,
            vertex_pos,
            triangle_pos: vertex_end,
            vertex_end,
            triangle_end: total as usize,
        })
    }
}

impl MeshWriter for MmapWriter {
    fn append_vertices(&mut self, vertices: &[[f32; 3]]) -> Result<(), PlyError> {
        let bytes = vertices.len() * VERTEX_BYTES as usize;
        if self.vertex_pos + bytes > self.vertex_end {
            return Err(PlyError::format(&self.path, "more vertices than declared"));
        }
        for v in vertices {
            for &c in v {
                LittleEndian::write_f32(&mut self.map[self.vertex_pos..], c);
                self.vertex_pos += 4;
            }
        }
        Ok(())
    }

    fn append_triangles(&mut self, triangles: &[[u32; 3]]) -> Result<(), PlyError> {
        let bytes = triangles.len() * TRIANGLE_BYTES as usize;
        if self.triangle_pos + bytes > self.triangle_end {
            return Err(PlyError::format(&self.path, "more triangles than declared"));
        }
        for t in triangles {
            self.map[self.triangle_pos] = 3;
            self.triangle_pos += 1;
            for &i in t {
                LittleEndian::write_u32(&mut self.map[self.triangle_pos..], i);
                self.triangle_pos += 4;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PlyError> {
        if self.vertex_pos != self.vertex_end || self.triangle_pos != self.triangle_end {
            return Err(PlyError::format(
                &self.path,
                "declared totals do not match written data",
            ));
        }
        self.map.flush().map_err(|e| PlyError::io(&self.path, e))
    }
}
