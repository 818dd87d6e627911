use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use glam::Vec3;
use memmap2::Mmap;
use splatmesh_core::Splat;

use crate::PlyError;

const PROPERTY_NAMES: [&str; 7] = ["x", "y", "z", "nx", "ny", "nz", "radius"];
const X: usize = 0;
const Y: usize = 1;
const Z: usize = 2;
const NX: usize = 3;
const NY: usize = 4;
const NZ: usize = 5;
const RADIUS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl FieldType {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "int8" | "char" => Self::Int8,
            "uint8" | "uchar" => Self::Uint8,
            "int16" | "short" => Self::Int16,
            "uint16" | "ushort" => Self::Uint16,
            "int32" | "int" => Self::Int32,
            "uint32" | "uint" => Self::Uint32,
            "float32" | "float" => Self::Float32,
            "float64" | "double" => Self::Float64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone)]
struct VertexLayout {
    count: u64,
    stride: usize,
    offsets: [usize; 7],
    encoding: Encoding,
}

/// Random-access reader for one binary PLY splat file.
///
/// The file is memory-mapped; records are decoded on demand through a
/// per-property byte offset table computed once from the header.
#[derive(Debug)]
pub struct PlyReader {
    path: PathBuf,
    map: Mmap,
    layout: VertexLayout,
    data_offset: usize,
    smooth: f32,
}

impl PlyReader {
    /// Open and validate a splat file. `smooth` is the radius multiplier
    /// applied to every decoded splat.
    pub fn open(path: &Path, smooth: f32) -> Result<Self, PlyError> {
        let file = File::open(path).map_err(|e| PlyError::io(path, e))?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| PlyError::io(path, e))?;
        let (layout, data_offset) = parse_header(&map, path)?;
        if (((map.len() - data_offset) / layout.stride) as u64) < layout.count {
            return Err(PlyError::format(
                path,
                "file is too small to contain its vertices",
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            map,
            layout,
            data_offset,
            smooth,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of vertex records in the file.
    pub fn size(&self) -> u64 {
        self.layout.count
    }

    /// Byte stride of one vertex record.
    pub fn vertex_size(&self) -> usize {
        self.layout.stride
    }

    /// Copy the raw bytes of records `[first, last)` into `out`.
    pub fn read_raw(&self, first: u64, last: u64, out: &mut [u8]) {
        assert!(first <= last && last <= self.layout.count);
        let stride = self.layout.stride;
        let begin = self.data_offset + first as usize * stride;
        let end = self.data_offset + last as usize * stride;
        out[..end - begin].copy_from_slice(&self.map[begin..end]);
    }

    /// Decode record `index` of a raw buffer previously filled by
    /// [`PlyReader::read_raw`].
    #[inline]
    pub fn decode(&self, raw: &[u8], index: usize) -> Splat {
        self.decode_record(&raw[index * self.layout.stride..])
    }

    /// Contiguous fast path: decode records `[first, last)` straight out of
    /// the mapping into a splat slice.
    pub fn read_splats(&self, first: u64, last: u64, out: &mut [Splat]) {
        assert!(first <= last && last <= self.layout.count);
        assert!(out.len() >= (last - first) as usize);
        let stride = self.layout.stride;
        let base = self.data_offset + first as usize * stride;
        for (i, slot) in out.iter_mut().enumerate().take((last - first) as usize) {
            *slot = self.decode_record(&self.map[base + i * stride..]);
        }
    }

    #[inline]
    fn decode_record(&self, record: &[u8]) -> Splat {
        let field = |prop: usize| -> f32 {
            let at = &record[self.layout.offsets[prop]..];
            match self.layout.encoding {
                Encoding::Little => LittleEndian::read_f32(at),
                Encoding::Big => BigEndian::read_f32(at),
            }
        };
        let radius = field(RADIUS);
        Splat {
            position: Vec3::new(field(X), field(Y), field(Z)),
            radius: radius * self.smooth,
            normal: Vec3::new(field(NX), field(NY), field(NZ)),
            quality: 1.0 / (radius * radius),
        }
    }
}

fn parse_header(bytes: &[u8], path: &Path) -> Result<(VertexLayout, usize), PlyError> {
    let bad = |message: &str| PlyError::format(path, message);

    let mut lines = HeaderLines { bytes, pos: 0 };

    let magic = lines.next().ok_or_else(|| bad("end of file in PLY header"))?;
    if magic? != "ply" {
        return Err(bad("PLY signature missing"));
    }

    let mut encoding = None;
    let mut elements = 0usize;
    let mut count = 0u64;
    let mut stride = 0usize;
    let mut offsets = [usize::MAX; 7];

    loop {
        let line = lines
            .next()
            .ok_or_else(|| bad("end of file in PLY header"))??;
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        match tokens.first() {
            None => continue, // blank line
            Some(&"end_header") => break,
            Some(&"comment") | Some(&"obj_info") => continue,
            Some(&"format") => {
                if tokens.len() != 3 {
                    return Err(bad("malformed format line"));
                }
                encoding = Some(match tokens[1] {
                    "ascii" => return Err(bad("PLY ASCII format not supported")),
                    "binary_little_endian" => Encoding::Little,
                    "binary_big_endian" => Encoding::Big,
                    other => {
                        return Err(PlyError::format(path, format!("unknown PLY format {other}")));
                    }
                });
                if tokens[2] != "1.0" {
                    return Err(PlyError::format(
                        path,
                        format!("unknown PLY version {}", tokens[2]),
                    ));
                }
            }
            Some(&"element") => {
                if tokens.len() != 3 {
                    return Err(bad("malformed element line"));
                }
                if elements == 0 {
                    if tokens[1] != "vertex" {
                        return Err(bad("first element is not vertex"));
                    }
                    count = tokens[2]
                        .parse::<u64>()
                        .map_err(|_| bad("malformed element line or too many elements"))?;
                }
                elements += 1;
            }
            Some(&"property") => {
                if elements == 0 {
                    return Err(bad("property appears before any element declaration"));
                }
                if elements > 1 {
                    continue; // later elements are not read
                }
                if tokens.get(1) == Some(&"list") {
                    return Err(bad("lists in a vertex are not supported"));
                }
                if tokens.len() != 3 {
                    return Err(bad("malformed property line"));
                }
                let ty = FieldType::parse(tokens[1])
                    .ok_or_else(|| PlyError::format(path, format!("unknown type `{}'", tokens[1])))?;
                let name = tokens[2];
                if let Some(slot) = PROPERTY_NAMES.iter().position(|&p| p == name) {
                    if offsets[slot] != usize::MAX {
                        return Err(PlyError::format(path, format!("duplicate property {name}")));
                    }
                    if ty != FieldType::Float32 {
                        return Err(PlyError::format(
                            path,
                            format!("property {name} must be float32"),
                        ));
                    }
                    offsets[slot] = stride;
                }
                stride += ty.size();
            }
            Some(_) => continue, // unknown header lines are tolerated
        }
    }

    let encoding = encoding.ok_or_else(|| bad("no format line found"))?;
    if elements == 0 {
        return Err(bad("no elements found"));
    }
    for (slot, &name) in PROPERTY_NAMES.iter().enumerate() {
        if offsets[slot] == usize::MAX {
            return Err(PlyError::format(path, format!("property {name} not found")));
        }
    }

    Ok((
        VertexLayout {
            count,
            stride,
            offsets,
            encoding,
        },
        lines.pos,
    ))
}

struct HeaderLines<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for HeaderLines<'a> {
    type Item = Result<&'a str, PlyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let rest = &self.bytes[self.pos..];
        let end = rest.iter().position(|&b| b == b'\n')?;
        self.pos += end + 1;
        let line = &rest[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Some(std::str::from_utf8(line).map_err(|_| {
            PlyError::Format {
                path: PathBuf::new(),
                message: "non-ASCII bytes in PLY header".to_owned(),
            }
        }))
    }
}

/// Load a triangle mesh written by this crate's writers. Used by
/// verification tools and the end-to-end tests.
#[allow(clippy::type_complexity)]
pub fn read_triangle_mesh(
    path: &Path,
) -> Result<(Vec<[f32; 3]>, Vec<[u32; 3]>, Vec<String>), PlyError> {
    let bytes = std::fs::read(path).map_err(|e| PlyError::io(path, e))?;
    let bad = |message: &str| PlyError::format(path, message);

    let mut lines = HeaderLines {
        bytes: &bytes,
        pos: 0,
    };
    if lines.next().ok_or_else(|| bad("empty file"))?? != "ply" {
        return Err(bad("PLY signature missing"));
    }

    let mut comments = Vec::new();
    let mut num_vertices = 0u64;
    let mut num_triangles = 0u64;
    loop {
        let line = lines.next().ok_or_else(|| bad("truncated header"))??;
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        match tokens.first() {
            Some(&"end_header") => break,
            Some(&"comment") => comments.push(line["comment".len()..].trim_start().to_owned()),
            Some(&"format") => {
                if tokens.get(1) != Some(&"binary_little_endian") {
                    return Err(bad("expected a little-endian mesh file"));
                }
            }
            Some(&"element") => {
                let n = tokens[2].parse::<u64>().map_err(|_| bad("bad element count"))?;
                match tokens[1] {
                    "vertex" => num_vertices = n,
                    "face" => num_triangles = n,
                    _ => return Err(bad("unexpected element")),
                }
            }
            // The writers emit a fixed property schema; nothing to record.
            _ => continue,
        }
    }

    let mut pos = lines.pos;
    let need = num_vertices as usize * 12 + num_triangles as usize * 13;
    if bytes.len() - pos < need {
        return Err(bad("payload shorter than declared"));
    }

    let mut vertices = Vec::with_capacity(num_vertices as usize);
    for _ in 0..num_vertices {
        let mut v = [0f32; 3];
        LittleEndian::read_f32_into(&bytes[pos..pos + 12], &mut v);
        vertices.push(v);
        pos += 12;
    }
    let mut triangles = Vec::with_capacity(num_triangles as usize);
    for _ in 0..num_triangles {
        if bytes[pos] != 3 {
            return Err(bad("non-triangle face"));
        }
        let mut t = [0u32; 3];
        LittleEndian::read_u32_into(&bytes[pos + 1..pos + 13], &mut t);
        triangles.push(t);
        pos += 13;
    }
    Ok((vertices, triangles, comments))
}
