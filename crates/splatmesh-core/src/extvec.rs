//! Disk-backed append vectors.
//!
//! The mesher's vertex and triangle sequences, and the blob index, can all
//! exceed host RAM. `ExtVec` is an append-only sequence of plain-old-data
//! records buffered in 1 MiB blocks and spilled to an anonymous temporary
//! file; after a freeze point it serves positioned range reads and chunked
//! sequential scans through independent reader handles.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use bytemuck::Pod;

/// Spill block size in bytes; also the granularity of reader chunking.
pub const BLOCK_BYTES: usize = 1 << 20;

pub struct ExtVec<T> {
    file: File,
    buffer: Vec<T>,
    spilled: u64,
    frozen: bool,
}

impl<T: Pod> ExtVec<T> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            buffer: Vec::new(),
            spilled: 0,
            frozen: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.spilled + self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, value: T) -> io::Result<()> {
        debug_assert!(!self.frozen, "push after freeze");
        self.buffer.push(value);
        if self.buffer.len() * size_of::<T>() >= BLOCK_BYTES {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(bytemuck::cast_slice(&self.buffer))?;
            self.spilled += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    /// End the append phase. Further reads go through [`ExtVec::reader`].
    pub fn freeze(&mut self) -> io::Result<()> {
        self.spill()?;
        self.file.flush()?;
        self.frozen = true;
        Ok(())
    }

    /// An independent read handle. Only valid after [`ExtVec::freeze`]; the
    /// handle seeks absolutely before every read, so handles do not disturb
    /// each other as long as they stay on one thread.
    pub fn reader(&self) -> io::Result<ExtReader<T>> {
        assert!(self.frozen, "reader before freeze");
        Ok(ExtReader {
            file: self.file.try_clone()?,
            len: self.spilled,
            _marker: PhantomData,
        })
    }
}

pub struct ExtReader<T> {
    file: File,
    len: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod> ExtReader<T> {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&mut self, index: u64) -> io::Result<T> {
        let mut out = [T::zeroed()];
        self.read_range(index, &mut out)?;
        Ok(out[0])
    }

    pub fn read_range(&mut self, start: u64, out: &mut [T]) -> io::Result<()> {
        assert!(start + out.len() as u64 <= self.len, "read past end");
        self.file
            .seek(SeekFrom::Start(start * size_of::<T>() as u64))?;
        self.file.read_exact(bytemuck::cast_slice_mut(out))?;
        Ok(())
    }

    /// Chunked sequential scan starting at `start`.
    pub fn iter_from(self, start: u64) -> ExtIter<T> {
        ExtIter {
            reader: self,
            next: start,
            chunk: Vec::new(),
            chunk_pos: 0,
        }
    }
}

pub struct ExtIter<T> {
    reader: ExtReader<T>,
    next: u64,
    chunk: Vec<T>,
    chunk_pos: usize,
}

impl<T: Pod> ExtIter<T> {
    /// Index of the element the next call to `next()` will yield.
    pub fn position(&self) -> u64 {
        self.next - (self.chunk.len() - self.chunk_pos) as u64
    }
}

impl<T: Pod> Iterator for ExtIter<T> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk_pos == self.chunk.len() {
            let remaining = self.reader.len().saturating_sub(self.next);
            if remaining == 0 {
                return None;
            }
            let count = remaining.min((BLOCK_BYTES / size_of::<T>()).max(1) as u64) as usize;
            self.chunk.clear();
            self.chunk.resize(count, T::zeroed());
            if let Err(e) = self.reader.read_range(self.next, &mut self.chunk) {
                return Some(Err(e));
            }
            self.next += count as u64;
            self.chunk_pos = 0;
        }
        let item = self.chunk[self.chunk_pos];
        self.chunk_pos += 1;
        Some(Ok(item))
    }
}
